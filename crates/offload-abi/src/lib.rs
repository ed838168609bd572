// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # offload-abi
//!
//! The call-site contract between compiler-generated host code and the
//! offload runtime.
//!
//! Every offloaded region hands the runtime four parallel arrays: argument
//! bases, argument begins, sizes in bytes and map-type flags. This crate
//! turns those arrays into typed values:
//!
//! - [`MapType`]: the flag set (`TO`, `FROM`, `PTR_AND_OBJ`, `MEMBER_OF`, ...).
//! - [`MapArg`]: one argument tuple, classified once into an [`ArgKind`].
//! - [`ArgList`]: the validated argument list, including any attached
//!   [`NestedDescriptor`]s that expand into further regions.
//! - [`OffloadEntry`] / [`TranslationTable`]: host entry points and the
//!   per-device tables they resolve to.
//!
//! ```text
//!  bases[]  begins[]  sizes[]  types[]
//!     └────────┴─────────┴────────┘
//!                  │  ArgList::new
//!                  ▼
//!              ArgList ──► MapArg::kind() ──► ArgKind
//!                  │
//!                  │  regions(i)
//!                  ▼
//!        ArgRegions (one region, or a nested expansion)
//! ```

mod arg;
mod entry;
mod error;
mod map_type;
pub mod nested;

pub use arg::{ArgKind, ArgList, ArgRegions, MapArg};
pub use entry::{BinaryDescriptor, DeviceImage, OffloadEntry, TargetTable, TranslationTable};
pub use error::AbiError;
pub use map_type::MapType;
pub use nested::{NestedDescriptor, RegionList};

/// Size in bytes of a host pointer slot.
pub const PTR_SIZE: usize = std::mem::size_of::<usize>();
