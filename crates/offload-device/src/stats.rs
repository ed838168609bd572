// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Per-device transfer statistics.

/// Cumulative counters for one device.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TransferStats {
    pub h2d_transfers: u64,
    pub h2d_bytes: u64,
    pub d2h_transfers: u64,
    pub d2h_bytes: u64,
    /// Aggregated submissions issued by the bulk path.
    pub batched_submissions: u64,
    /// Chunks carried by those submissions.
    pub batched_chunks: u64,
    pub allocations: u64,
    pub deallocations: u64,
    pub launches: u64,
}

impl TransferStats {
    pub(crate) fn record_h2d(&mut self, bytes: usize) {
        self.h2d_transfers += 1;
        self.h2d_bytes += bytes as u64;
    }

    pub(crate) fn record_d2h(&mut self, bytes: usize) {
        self.d2h_transfers += 1;
        self.d2h_bytes += bytes as u64;
    }

    pub(crate) fn record_batch(&mut self, chunks: usize, bytes: usize) {
        self.batched_submissions += 1;
        self.batched_chunks += chunks as u64;
        self.h2d_bytes += bytes as u64;
    }

    pub(crate) fn record_alloc(&mut self) {
        self.allocations += 1;
    }

    pub(crate) fn record_free(&mut self) {
        self.deallocations += 1;
    }

    pub(crate) fn record_launch(&mut self) {
        self.launches += 1;
    }

    /// Returns a human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "Transfers: {} H2D ({} bytes), {} D2H ({} bytes), {} batches ({} chunks), \
             {} allocs, {} frees, {} launches",
            self.h2d_transfers,
            self.h2d_bytes,
            self.d2h_transfers,
            self.d2h_bytes,
            self.batched_submissions,
            self.batched_chunks,
            self.allocations,
            self.deallocations,
            self.launches,
        )
    }
}
