// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # offload-device
//!
//! One accelerator as the offload runtime sees it: a driver plugin plus the
//! mapping state the runtime keeps for that device.
//!
//! # Key Components
//!
//! - [`DevicePlugin`]: the narrow driver interface (allocate, free, copy in
//!   both directions, launch single or team regions, load images).
//! - [`HostPlugin`]: an in-process plugin whose "device memory" is a set of
//!   host buffers at synthetic device addresses. Kernels are Rust closures.
//! - [`Device`]: the per-device mapping lifecycle: get-or-allocate,
//!   lookup with reference counting, deallocation, user associations,
//!   shadow pointer bookkeeping and data movement.
//! - Bulk path ([`BulkQueue`], [`Device::bulk_transfer`]): stage copies
//!   and pointer patches during one data-begin, then flush them as one
//!   batch. The queue belongs to the caller, never to the device.
//! - [`AddressTable`]: the segment table uploaded for device-side address
//!   translation.
//! - [`OffsetList`]: per-window offsets, the mask-and-add alternative to
//!   the table.
//!
//! # Locking
//!
//! ```text
//! Device
//!  ├── mappings:        Mutex<MappingTable>   map / lookup / refcount
//!  ├── shadows:         Mutex<ShadowTable>    patched pointer slots
//!  ├── pending_globals: Mutex<bool>           one-time library init
//!  └── init:            OnceLock              plugin device init
//! ```
//!
//! Each lock is held only for the duration of a single operation.
//! Multi-step sequences (lookup, then copy) are not atomic.

mod address_table;
mod bulk;
mod device;
mod error;
mod host;
mod offset_list;
mod plugin;
mod stats;

pub use address_table::{AddressTable, Segment, UploadedTable};
pub use bulk::{BulkQueue, BulkSummary, PendingUpdate};
pub use device::{Device, LaunchKind, TargetLookup, TargetPtr};
pub use error::{DeviceError, Direction};
pub use host::{HostPlugin, Kernel, KernelContext};
pub use offset_list::{OffsetConflict, OffsetList};
pub use plugin::{DevicePlugin, PluginError, TransferChunk};
pub use stats::TransferStats;
