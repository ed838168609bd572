// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # memory-map
//!
//! Bookkeeping for host sections that have device-resident copies.
//!
//! # Key Components
//!
//! - [`MappingTable`]: an ordered map of disjoint host intervals, each with
//!   its device address and a reference count. Lookups classify a query
//!   range as contained in an entry, or as partially overlapping one.
//! - [`RefCount`]: a saturating count with an *infinite* sentinel for
//!   entries that must never be evicted (globals, user associations).
//! - [`ShadowTable`]: host pointer slots whose device copies were patched
//!   to device addresses, walked in descending slot order.
//! - [`MappingStats`]: cumulative counters (new mappings, reuses, overlap
//!   rejections, peak live bytes).
//!
//! # Layout
//!
//! ```text
//!  host address space (descending key order)
//!
//!  ┌──────────────┐ host_end
//!  │   entry B    │ ──► tgt_begin(B), ref_count(B)
//!  └──────────────┘ host_begin
//!        gap
//!  ┌──────────────┐
//!  │   entry A    │ ──► tgt_begin(A), ref_count(A)
//!  └──────────────┘
//! ```
//!
//! Entries never overlap. The tables are not synchronised; the owning
//! device wraps each one in its own lock.
//!
//! # Example
//! ```
//! use memory_map::{MappingEntry, MappingTable};
//!
//! let mut table = MappingTable::new();
//! table.insert(MappingEntry::new(0x1000, 0x1000, 0x1010, 0xd000)).unwrap();
//!
//! let hit = table.lookup(0x1004, 4);
//! assert!(hit.is_contained);
//!
//! let partial = table.lookup(0x1008, 16);
//! assert!(partial.extends_after);
//! ```

mod entry;
mod error;
mod refcount;
pub mod shadow;
mod stats;
pub mod table;

pub use entry::MappingEntry;
pub use error::MapError;
pub use refcount::RefCount;
pub use shadow::{ShadowEntry, ShadowTable};
pub use stats::MappingStats;
pub use table::{LookupResult, MappingTable};
