// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `offload-sim compare` command: run one workload under every transfer
//! strategy and print a comparison table.

use super::scenario::{self, Report, Workload};
use offload_runtime::RuntimeConfig;

const VARIANTS: [(&str, bool); 3] = [("immediate", false), ("bulk", false), ("immediate", true)];

pub fn execute(base: RuntimeConfig, workload: Workload) -> anyhow::Result<()> {
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║           offload-sim · Strategy Comparison          ║");
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
    println!(
        "  {} structs × {} bytes, {} iterations",
        workload.structs, workload.payload, workload.iterations
    );
    println!();
    println!(
        "  {:<18} {:>10} {:>10} {:>9} {:>9} {:>10}  {}",
        "strategy", "wall ms", "ptr ms", "h2d", "batches", "tables", "result"
    );

    let mut results: Vec<Report> = Vec::new();
    for (mode, address_table) in VARIANTS {
        let config = RuntimeConfig {
            transfer_mode: mode.to_string(),
            address_table,
            ..base.clone()
        };
        match scenario::run(config, workload) {
            Ok(r) => {
                println!(
                    "  {:<18} {:>10.3} {:>10.3} {:>9} {:>9} {:>10}  {}",
                    r.label(),
                    r.elapsed.as_secs_f64() * 1000.0,
                    r.metrics.pointer_update.total.as_secs_f64() * 1000.0,
                    r.transfers.h2d_transfers,
                    r.transfers.batched_submissions,
                    r.metrics.address_table_entries,
                    if r.verified { "ok" } else { "MISMATCH" },
                );
                results.push(r);
            }
            Err(e) => {
                tracing::warn!("{mode} run failed: {e:#}");
                println!("  {:<18} FAILED: {e:#}", mode);
            }
        }
    }
    println!();

    let Some(fastest) = results.iter().min_by_key(|r| r.elapsed) else {
        println!("  No successful runs.");
        return Ok(());
    };
    println!(
        "  Fastest: {} ({:.3}ms)",
        fastest.label(),
        fastest.elapsed.as_secs_f64() * 1000.0
    );
    if results.iter().any(|r| !r.verified) {
        anyhow::bail!("at least one strategy produced a mismatching result");
    }
    Ok(())
}
