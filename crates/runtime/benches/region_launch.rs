// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Benchmarks for region data movement and launches per transfer mode.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use offload_abi::{ArgList, BinaryDescriptor, MapArg, MapType, OffloadEntry};
use offload_device::HostPlugin;
use offload_runtime::{LaunchKind, OffloadRuntime, RuntimeConfig};
use std::sync::Arc;

const KERNEL: usize = 0x4000;

fn runtime(mode: &str, address_table: bool) -> OffloadRuntime {
    let plugin = Arc::new(HostPlugin::new(1));
    plugin.register_kernel("noop", |_| Ok(()));
    let entries = vec![OffloadEntry::function("noop", KERNEL)];
    let desc = BinaryDescriptor::new(entries.clone()).with_image(0, HostPlugin::image_for(&entries));
    let config = RuntimeConfig {
        transfer_mode: mode.into(),
        address_table,
        enable_profiling: false,
        ..Default::default()
    };
    let rt = OffloadRuntime::with_plugin(config, plugin).expect("valid config");
    rt.register_library(&desc);
    rt
}

#[repr(C)]
struct Node {
    payload: *mut u8,
    len: u64,
}

/// `n` structs, each with an embedded pointer to its own 256-byte payload.
fn pointer_args(nodes: &mut [Node]) -> ArgList {
    let mut args = Vec::with_capacity(nodes.len() * 2);
    for node in nodes.iter_mut() {
        let index = args.len();
        let n = node as *mut Node as usize;
        args.push(MapArg::new(n, n, 16, MapType::TO | MapType::FROM | MapType::TARGET_PARAM));
        args.push(MapArg::new(
            n,
            node.payload as usize,
            node.len as usize,
            (MapType::TO | MapType::FROM | MapType::PTR_AND_OBJ).with_member_of(index),
        ));
    }
    ArgList::from_args(args)
}

fn bench_pointer_regions(c: &mut Criterion) {
    let mut group = c.benchmark_group("pointer_region");
    for (label, mode, table) in [
        ("immediate", "immediate", false),
        ("bulk", "bulk", false),
        ("address_table", "immediate", true),
    ] {
        let rt = runtime(mode, table);
        let mut payloads = vec![[0u8; 256]; 32];
        let mut nodes: Vec<Node> = payloads
            .iter_mut()
            .map(|p| Node {
                payload: p.as_mut_ptr(),
                len: 256,
            })
            .collect();
        let mut args = pointer_args(&mut nodes);

        group.bench_with_input(BenchmarkId::from_parameter(label), &label, |b, _| {
            b.iter(|| unsafe {
                rt.target(0, KERNEL, &mut args, LaunchKind::Single)
                    .expect("region runs");
                black_box(&nodes);
            })
        });
    }
    group.finish();
}

fn bench_data_begin_end(c: &mut Criterion) {
    let rt = runtime("immediate", false);
    let mut buf = vec![0u8; 64 * 1024];
    let a = buf.as_mut_ptr() as usize;
    let mut args = ArgList::from_args(vec![MapArg::new(a, a, buf.len(), MapType::TO | MapType::FROM)]);
    c.bench_function("data_begin_end_64k", |b| {
        b.iter(|| unsafe {
            rt.target_data_begin(0, &mut args).expect("begin");
            rt.target_data_end(0, &mut args).expect("end");
        })
    });
}

criterion_group!(benches, bench_pointer_regions, bench_data_begin_end);
criterion_main!(benches);
