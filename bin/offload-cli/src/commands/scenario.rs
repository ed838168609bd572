// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The simulated workload: an array of structs, each holding a pointer to
//! its own payload, mapped with `tofrom` and incremented by a kernel once
//! per iteration.

use anyhow::Context;
use offload_abi::{ArgList, BinaryDescriptor, MapArg, MapType, OffloadEntry};
use offload_device::{HostPlugin, KernelContext, TransferStats};
use offload_runtime::{LaunchKind, OffloadMetrics, OffloadRuntime, RuntimeConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};

const KERNEL: usize = 0x4000;

/// Workload shape.
#[derive(Debug, Clone, Copy, clap::Args)]
pub struct Workload {
    /// Number of pointer-bearing structs.
    #[arg(short, long, default_value_t = 32)]
    pub structs: usize,

    /// Payload bytes behind each struct's pointer (rounded down to u32s).
    #[arg(short, long, default_value_t = 1024)]
    pub payload: usize,

    /// Target regions to run.
    #[arg(short, long, default_value_t = 10)]
    pub iterations: usize,
}

impl Workload {
    fn elements(&self) -> usize {
        (self.payload / 4).max(1)
    }
}

#[repr(C)]
struct Node {
    data: *mut u32,
    len: u64,
}

/// Outcome of one workload run.
#[derive(Debug, Clone)]
pub struct Report {
    pub strategy: String,
    pub address_table: bool,
    pub elapsed: Duration,
    pub verified: bool,
    pub metrics: OffloadMetrics,
    pub transfers: TransferStats,
}

impl Report {
    pub fn label(&self) -> String {
        if self.address_table {
            format!("{}+table", self.strategy)
        } else {
            self.strategy.clone()
        }
    }
}

/// Adds one to every element behind each struct's pointer. With a table,
/// the pointers still hold host addresses and are translated first.
fn increment_kernel(structs: usize, elements: usize, address_table: bool) -> impl Fn(&mut KernelContext<'_>) -> Result<(), String> {
    move |ctx| {
        let table = if address_table { Some(ctx.arg(structs)?) } else { None };
        for i in 0..structs {
            let node = ctx.arg(i)?;
            let mut data = ctx.read_u64(node)? as usize;
            if let Some(table) = table {
                data = ctx.translate(table, data)?;
            }
            let mut bytes = ctx.read_bytes(data, elements * 4)?;
            for chunk in bytes.chunks_exact_mut(4) {
                let v = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                chunk.copy_from_slice(&v.wrapping_add(1).to_ne_bytes());
            }
            ctx.write_bytes(data, &bytes)?;
        }
        Ok(())
    }
}

/// Runs `workload` under `config` on a fresh host device.
pub fn run(config: RuntimeConfig, workload: Workload) -> anyhow::Result<Report> {
    let elements = workload.elements();
    let address_table = config.address_table;
    let plugin = Arc::new(HostPlugin::new(1));
    plugin.register_kernel("increment", increment_kernel(workload.structs, elements, address_table));

    let rt = OffloadRuntime::with_plugin(config, plugin).context("building runtime")?;
    let entries = vec![OffloadEntry::function("increment", KERNEL)];
    rt.register_library(&BinaryDescriptor::new(entries.clone()).with_image(0, HostPlugin::image_for(&entries)));

    let mut payloads: Vec<Vec<u32>> = (0..workload.structs)
        .map(|s| (0..elements as u32).map(|e| e + s as u32).collect())
        .collect();
    let mut nodes: Vec<Node> = payloads
        .iter_mut()
        .map(|p| Node {
            data: p.as_mut_ptr(),
            len: p.len() as u64,
        })
        .collect();
    let originals: Vec<usize> = nodes.iter().map(|n| n.data as usize).collect();

    let mut args = Vec::with_capacity(workload.structs * 2);
    for node in nodes.iter_mut() {
        let parent = args.len();
        let n = node as *mut Node as usize;
        args.push(MapArg::new(
            n,
            n,
            std::mem::size_of::<Node>(),
            MapType::TO | MapType::FROM | MapType::TARGET_PARAM,
        ));
        args.push(MapArg::new(
            n,
            node.data as usize,
            node.len as usize * 4,
            (MapType::TO | MapType::FROM | MapType::PTR_AND_OBJ).with_member_of(parent),
        ));
    }
    let mut args = ArgList::from_args(args);

    let start = Instant::now();
    for i in 0..workload.iterations {
        // SAFETY: every section names live host memory owned by this frame,
        // and no other reference to it is used while the region runs.
        unsafe { rt.target(-1, KERNEL, &mut args, LaunchKind::Single) }
            .with_context(|| format!("region {i} failed"))?;
    }
    let elapsed = start.elapsed();

    let pointers_restored = nodes
        .iter()
        .zip(&originals)
        .all(|(n, &orig)| n.data as usize == orig);
    let data_updated = payloads.iter().enumerate().all(|(s, p)| {
        p.iter()
            .enumerate()
            .all(|(e, &v)| v == (e + s + workload.iterations) as u32)
    });
    let device = rt.device(-1)?;
    let drained = device.mapping_count() == 0;
    tracing::info!(
        "{}: pointers restored {pointers_restored}, data updated {data_updated}, drained {drained}",
        rt.strategy_name()
    );

    Ok(Report {
        strategy: rt.strategy_name().to_string(),
        address_table,
        elapsed,
        verified: pointers_restored && data_updated && drained,
        metrics: rt.metrics(),
        transfers: device.transfer_stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Workload {
        Workload {
            structs: 4,
            payload: 64,
            iterations: 3,
        }
    }

    #[test]
    fn test_immediate_workload_verifies() {
        let report = run(RuntimeConfig::default(), small()).unwrap();
        assert!(report.verified);
        assert_eq!(report.metrics.kernels_launched, 3);
        assert_eq!(report.label(), "immediate");
    }

    #[test]
    fn test_bulk_and_table_workloads_verify() {
        let bulk = RuntimeConfig {
            transfer_mode: "bulk".into(),
            ..Default::default()
        };
        assert!(run(bulk, small()).unwrap().verified);

        let table = RuntimeConfig {
            address_table: true,
            ..Default::default()
        };
        let report = run(table, small()).unwrap();
        assert!(report.verified);
        assert_eq!(report.label(), "immediate+table");
    }
}
