// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Offload profiling metrics.
//!
//! [`OffloadMetrics`] accumulates wall-clock time per runtime phase plus a
//! few counters. Device-level byte counts live in
//! [`TransferStats`](offload_device::TransferStats).

use std::time::{Duration, Instant};

/// A timed runtime phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    DataBegin,
    DataEnd,
    DataUpdate,
    Target,
    Kernel,
    PointerUpdate,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::DataBegin,
        Phase::DataEnd,
        Phase::DataUpdate,
        Phase::Target,
        Phase::Kernel,
        Phase::PointerUpdate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::DataBegin => "data_begin",
            Phase::DataEnd => "data_end",
            Phase::DataUpdate => "data_update",
            Phase::Target => "target",
            Phase::Kernel => "kernel",
            Phase::PointerUpdate => "pointer_update",
        }
    }
}

/// Accumulated time and call count of one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PhaseTiming {
    pub calls: u64,
    pub total: Duration,
}

impl PhaseTiming {
    pub fn mean(&self) -> Duration {
        if self.calls == 0 {
            return Duration::ZERO;
        }
        self.total / self.calls as u32
    }
}

/// Aggregate metrics for the lifetime of a runtime.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OffloadMetrics {
    pub data_begin: PhaseTiming,
    pub data_end: PhaseTiming,
    pub data_update: PhaseTiming,
    pub target: PhaseTiming,
    pub kernel: PhaseTiming,
    pub pointer_update: PhaseTiming,
    /// Kernels launched successfully.
    pub kernels_launched: u64,
    /// Segments uploaded in address tables, summed over launches.
    pub address_table_entries: u64,
}

impl OffloadMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timing(&self, phase: Phase) -> &PhaseTiming {
        match phase {
            Phase::DataBegin => &self.data_begin,
            Phase::DataEnd => &self.data_end,
            Phase::DataUpdate => &self.data_update,
            Phase::Target => &self.target,
            Phase::Kernel => &self.kernel,
            Phase::PointerUpdate => &self.pointer_update,
        }
    }

    fn timing_mut(&mut self, phase: Phase) -> &mut PhaseTiming {
        match phase {
            Phase::DataBegin => &mut self.data_begin,
            Phase::DataEnd => &mut self.data_end,
            Phase::DataUpdate => &mut self.data_update,
            Phase::Target => &mut self.target,
            Phase::Kernel => &mut self.kernel,
            Phase::PointerUpdate => &mut self.pointer_update,
        }
    }

    /// Adds one call of `phase` taking `elapsed`.
    pub fn record(&mut self, phase: Phase, elapsed: Duration) {
        let t = self.timing_mut(phase);
        t.calls += 1;
        t.total += elapsed;
    }

    /// Adds one call of `phase` that started at `start`.
    pub fn record_since(&mut self, phase: Phase, start: Instant) {
        self.record(phase, start.elapsed());
    }

    pub fn record_launch(&mut self, table_entries: usize) {
        self.kernels_launched += 1;
        self.address_table_entries += table_entries as u64;
    }

    /// Returns a human-readable summary suitable for CLI output.
    pub fn summary(&self) -> String {
        let phases: Vec<String> = Phase::ALL
            .iter()
            .filter(|p| self.timing(**p).calls > 0)
            .map(|p| {
                let t = self.timing(*p);
                format!(
                    "{} {}x {:.3}ms",
                    p.name(),
                    t.calls,
                    t.total.as_secs_f64() * 1000.0
                )
            })
            .collect();
        format!(
            "Offload: {} kernels, {} table entries; {}",
            self.kernels_launched,
            self.address_table_entries,
            if phases.is_empty() {
                "no phases timed".to_string()
            } else {
                phases.join(", ")
            }
        )
    }
}
