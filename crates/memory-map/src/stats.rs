// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Mapping statistics for profiling and diagnostics.

/// Cumulative statistics about a [`MappingTable`](crate::MappingTable).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MappingStats {
    /// Entries created.
    pub new_mappings: u64,
    /// Map requests satisfied by an existing entry.
    pub reuses: u64,
    /// Inserts or explicit maps rejected for partial overlap.
    pub overlap_rejections: u64,
    /// Entries removed.
    pub releases: u64,
    /// Peak host bytes mapped at once.
    pub peak_live_bytes: usize,
    /// Total host bytes ever mapped.
    pub cumulative_mapped_bytes: u64,
}

impl MappingStats {
    /// Fraction of map requests served by an existing entry, in `[0.0, 1.0]`.
    pub fn reuse_ratio(&self) -> f64 {
        let total = self.new_mappings + self.reuses;
        if total == 0 {
            return 0.0;
        }
        self.reuses as f64 / total as f64
    }

    pub(crate) fn record_new_mapping(&mut self, size: usize) {
        self.new_mappings += 1;
        self.cumulative_mapped_bytes += size as u64;
    }

    pub(crate) fn record_reuse(&mut self) {
        self.reuses += 1;
    }

    pub(crate) fn record_overlap(&mut self) {
        self.overlap_rejections += 1;
    }

    pub(crate) fn record_release(&mut self) {
        self.releases += 1;
    }

    pub(crate) fn update_peak(&mut self, live_bytes: usize) {
        if live_bytes > self.peak_live_bytes {
            self.peak_live_bytes = live_bytes;
        }
    }

    /// Returns a human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "Mappings: {} new, {} reused ({:.0}% reuse), {} overlaps rejected, \
             {} released, peak {} bytes live",
            self.new_mappings,
            self.reuses,
            self.reuse_ratio() * 100.0,
            self.overlap_rejections,
            self.releases,
            self.peak_live_bytes,
        )
    }
}
