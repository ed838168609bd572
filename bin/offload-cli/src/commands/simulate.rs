// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `offload-sim simulate` command: run one workload and report its metrics.

use super::scenario::{self, Workload};
use offload_runtime::{Phase, RuntimeConfig};

pub fn execute(
    mut config: RuntimeConfig,
    mode: Option<String>,
    address_table: bool,
    workload: Workload,
    json: bool,
) -> anyhow::Result<()> {
    if let Some(mode) = mode {
        config.transfer_mode = mode;
    }
    config.address_table |= address_table;
    config.validate()?;

    let report = scenario::run(config, workload)?;
    if json {
        let out = serde_json::json!({
            "strategy": report.label(),
            "elapsed_ms": report.elapsed.as_secs_f64() * 1000.0,
            "verified": report.verified,
            "metrics": report.metrics,
            "transfers": report.transfers,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return verdict(report.verified);
    }

    println!("╔══════════════════════════════════════════════════════╗");
    println!("║            offload-sim · Workload Runner             ║");
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
    println!("  Workload:");
    println!("   Strategy:   {}", report.label());
    println!("   Structs:    {}", workload.structs);
    println!("   Payload:    {} bytes", workload.payload);
    println!("   Iterations: {}", workload.iterations);
    println!();

    println!("  Phases:");
    for phase in Phase::ALL {
        let t = report.metrics.timing(phase);
        if t.calls == 0 {
            continue;
        }
        println!(
            "   {:<15} {:>6} calls {:>10.3}ms total {:>8.3}ms mean",
            phase.name(),
            t.calls,
            t.total.as_secs_f64() * 1000.0,
            t.mean().as_secs_f64() * 1000.0,
        );
    }
    println!();
    println!("  {}", report.metrics.summary());
    println!("  Device: {}", report.transfers.summary());
    println!("  Wall:   {:.3}ms", report.elapsed.as_secs_f64() * 1000.0);
    println!(
        "  Result: {}",
        if report.verified { "verified" } else { "MISMATCH" }
    );
    println!();

    verdict(report.verified)
}

fn verdict(verified: bool) -> anyhow::Result<()> {
    if verified {
        Ok(())
    } else {
        anyhow::bail!("host memory does not match the expected result")
    }
}
