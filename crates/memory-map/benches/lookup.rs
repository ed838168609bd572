// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Benchmarks for interval-map lookups and shadow range walks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use memory_map::{MappingEntry, MappingTable, ShadowEntry, ShadowTable};

fn populated_table(n: usize) -> MappingTable {
    let mut table = MappingTable::new();
    for i in 0..n {
        let begin = 0x10_0000 + i * 0x100;
        table
            .insert(MappingEntry::new(begin, begin, begin + 0x80, 0xd000_0000 + i * 0x80))
            .expect("disjoint by construction");
    }
    table
}

fn bench_lookup_contained(c: &mut Criterion) {
    let table = populated_table(10_000);
    c.bench_function("lookup_contained_10k", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 7919) % 10_000;
            let addr = 0x10_0000 + i * 0x100 + 0x10;
            black_box(table.lookup(black_box(addr), 16))
        })
    });
}

fn bench_lookup_miss(c: &mut Criterion) {
    let table = populated_table(10_000);
    c.bench_function("lookup_miss_10k", |b| {
        b.iter(|| black_box(table.lookup(black_box(0x10_0090), 0x10)))
    });
}

fn bench_shadow_range(c: &mut Criterion) {
    let mut shadows = ShadowTable::new();
    for i in 0..4096usize {
        let slot = 0x1000 + i * 8;
        shadows.insert(ShadowEntry {
            host_slot: slot,
            host_value: slot,
            tgt_slot: slot,
            tgt_value: slot,
        });
    }
    c.bench_function("shadow_range_64", |b| {
        b.iter(|| black_box(shadows.in_range(0x2000, 0x2200).count()))
    });
}

criterion_group!(
    benches,
    bench_lookup_contained,
    bench_lookup_miss,
    bench_shadow_range
);
criterion_main!(benches);
