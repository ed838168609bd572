// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

use crate::RefCount;

/// One mapped host section and its device copy.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MappingEntry {
    /// Base of the enclosing host object.
    pub host_base: usize,
    /// First mapped host byte.
    pub host_begin: usize,
    /// One past the last mapped host byte.
    pub host_end: usize,
    /// Device address of `host_begin`.
    pub tgt_begin: usize,
    pub ref_count: RefCount,
}

impl MappingEntry {
    /// Creates an entry held by one reference.
    pub fn new(host_base: usize, host_begin: usize, host_end: usize, tgt_begin: usize) -> Self {
        Self {
            host_base,
            host_begin,
            host_end,
            tgt_begin,
            ref_count: RefCount::ONE,
        }
    }

    pub fn with_ref_count(mut self, ref_count: RefCount) -> Self {
        self.ref_count = ref_count;
        self
    }

    pub fn len(&self) -> usize {
        self.host_end - self.host_begin
    }

    pub fn is_empty(&self) -> bool {
        self.host_end == self.host_begin
    }

    pub fn contains(&self, host_addr: usize) -> bool {
        (self.host_begin..self.host_end).contains(&host_addr)
    }

    /// Device address corresponding to `host_addr`. The host address may
    /// lie outside the entry (implicit partial mappings).
    pub fn tgt_for(&self, host_addr: usize) -> usize {
        self.tgt_begin
            .wrapping_add(host_addr.wrapping_sub(self.host_begin))
    }
}
