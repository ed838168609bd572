// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Shadow pointer table.
//!
//! When a struct holding a pointer is copied to the device, the device copy
//! of the pointer field is patched to point at the device copy of the
//! pointee. The host value of that field is remembered here so it can be
//! put back after a device-to-host copy overwrites it.
//!
//! Entries are keyed by the host address of the pointer slot and visited
//! from the highest slot in a range downwards.

use std::cmp::Reverse;
use std::collections::BTreeMap;

/// One patched pointer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ShadowEntry {
    /// Host address of the pointer field.
    pub host_slot: usize,
    /// Original host value of the field.
    pub host_value: usize,
    /// Device address of the pointer field.
    pub tgt_slot: usize,
    /// Device address written into the device field.
    pub tgt_value: usize,
}

#[derive(Debug, Default)]
pub struct ShadowTable {
    entries: BTreeMap<Reverse<usize>, ShadowEntry>,
}

impl ShadowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a patched slot, returning the entry it replaced.
    pub fn insert(&mut self, entry: ShadowEntry) -> Option<ShadowEntry> {
        self.entries.insert(Reverse(entry.host_slot), entry)
    }

    pub fn get(&self, host_slot: usize) -> Option<&ShadowEntry> {
        self.entries.get(&Reverse(host_slot))
    }

    pub fn remove(&mut self, host_slot: usize) -> Option<ShadowEntry> {
        self.entries.remove(&Reverse(host_slot))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Slots in `[lb, ub)`, highest first.
    pub fn in_range(&self, lb: usize, ub: usize) -> impl Iterator<Item = &ShadowEntry> + '_ {
        let range = (ub > lb).then(|| self.entries.range(Reverse(ub - 1)..=Reverse(lb)));
        range.into_iter().flatten().map(|(_, e)| e)
    }

    /// Calls `f` on every slot in `[lb, ub)`, highest first, optionally
    /// erasing the visited entries. Returns how many were visited.
    pub fn visit_range<F>(&mut self, lb: usize, ub: usize, erase: bool, mut f: F) -> usize
    where
        F: FnMut(&ShadowEntry),
    {
        let mut visited = Vec::new();
        for entry in self.in_range(lb, ub) {
            f(entry);
            visited.push(entry.host_slot);
        }
        if erase {
            for slot in &visited {
                self.remove(*slot);
            }
        }
        visited.len()
    }
}
