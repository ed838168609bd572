// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The host-to-device interval map.
//!
//! [`MappingTable`] keeps disjoint host intervals keyed by their first byte
//! in descending order, so both questions a lookup asks are single range
//! queries:
//!
//! 1. Which entry starts at or below `begin`? If `begin` lies inside it, the
//!    query is contained, or extends past its end.
//! 2. Otherwise, which entry starts just above `begin`? If the query reaches
//!    into it, the query extends before that entry.
//!
//! Both are `O(log n)`.

use crate::{MapError, MappingEntry, MappingStats, RefCount};
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// How a query range relates to the mapped intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LookupResult {
    /// `host_begin` of the entry the query touches.
    pub entry: Option<usize>,
    /// The query lies entirely inside the entry.
    pub is_contained: bool,
    /// The query starts before the entry and runs into it.
    pub extends_before: bool,
    /// The query runs past the end of the entry.
    pub extends_after: bool,
}

impl LookupResult {
    pub fn is_found(&self) -> bool {
        self.entry.is_some()
    }

    /// True for a partial overlap with an existing entry.
    pub fn is_partial(&self) -> bool {
        self.extends_before || self.extends_after
    }
}

/// Ordered, interval-disjoint map of host sections to device copies.
#[derive(Debug, Default)]
pub struct MappingTable {
    entries: BTreeMap<Reverse<usize>, MappingEntry>,
    live_bytes: usize,
    stats: MappingStats,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies `[begin, begin + size)` against the mapped intervals.
    pub fn lookup(&self, begin: usize, size: usize) -> LookupResult {
        let end = begin.saturating_add(size);

        if let Some(e) = self.containing(begin) {
            let extends_after = end > e.host_end;
            return LookupResult {
                entry: Some(e.host_begin),
                is_contained: !extends_after,
                extends_before: false,
                extends_after,
            };
        }

        // Closest entry starting above `begin`.
        if let Some((_, e)) = self.entries.range(..Reverse(begin)).next_back() {
            if end > e.host_begin {
                return LookupResult {
                    entry: Some(e.host_begin),
                    is_contained: false,
                    extends_before: true,
                    extends_after: end > e.host_end,
                };
            }
        }

        LookupResult::default()
    }

    /// The entry whose interval contains `host_addr`.
    pub fn containing(&self, host_addr: usize) -> Option<&MappingEntry> {
        self.entries
            .range(Reverse(host_addr)..)
            .next()
            .map(|(_, e)| e)
            .filter(|e| e.contains(host_addr))
    }

    /// Reference count of the entry containing `host_addr`.
    pub fn ref_count_at(&self, host_addr: usize) -> Option<RefCount> {
        self.containing(host_addr).map(|e| e.ref_count)
    }

    /// Inserts a new entry. Fails if it would touch any existing entry.
    pub fn insert(&mut self, entry: MappingEntry) -> Result<(), MapError> {
        if entry.is_empty() {
            return Err(MapError::EmptySection {
                begin: entry.host_begin,
            });
        }
        let found = self.lookup(entry.host_begin, entry.len());
        if let Some((existing_begin, existing_end)) = found
            .entry
            .and_then(|k| self.entry(k))
            .map(|e| (e.host_begin, e.host_end))
        {
            self.stats.record_overlap();
            return Err(MapError::Overlap {
                begin: entry.host_begin,
                end: entry.host_end,
                existing_begin,
                existing_end,
            });
        }

        let len = entry.len();
        self.live_bytes += len;
        self.stats.record_new_mapping(len);
        self.stats.update_peak(self.live_bytes);
        tracing::trace!(
            "mapped host [{:#x}, {:#x}) -> {:#x} (rc {})",
            entry.host_begin,
            entry.host_end,
            entry.tgt_begin,
            entry.ref_count
        );
        self.entries.insert(Reverse(entry.host_begin), entry);
        Ok(())
    }

    /// Removes the entry starting at `host_begin`.
    pub fn remove(&mut self, host_begin: usize) -> Option<MappingEntry> {
        let entry = self.entries.remove(&Reverse(host_begin))?;
        self.live_bytes -= entry.len();
        self.stats.record_release();
        Some(entry)
    }

    /// The entry starting exactly at `host_begin`.
    pub fn entry(&self, host_begin: usize) -> Option<&MappingEntry> {
        self.entries.get(&Reverse(host_begin))
    }

    pub fn entry_mut(&mut self, host_begin: usize) -> Option<&mut MappingEntry> {
        self.entries.get_mut(&Reverse(host_begin))
    }

    /// Entries in descending `host_begin` order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &MappingEntry> + '_ {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total host bytes currently mapped.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn stats(&self) -> &MappingStats {
        &self.stats
    }

    /// Counts a lookup that was satisfied by an existing entry.
    pub fn record_reuse(&mut self) {
        self.stats.record_reuse();
    }

    /// Counts a rejected partial overlap detected outside [`insert`](Self::insert).
    pub fn record_overlap(&mut self) {
        self.stats.record_overlap();
    }
}
