// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # offload-runtime
//!
//! The region orchestrator that moves data around offloaded kernels.
//!
//! The runtime takes:
//! - Argument lists from `offload-abi`, as compiler-generated call sites
//!   describe them.
//! - Devices from `offload-device`, each owning its mapping and shadow
//!   tables from `memory-map`.
//! - A [`RuntimeConfig`] selecting the transfer strategy and how kernels
//!   translate host addresses (patched pointers, address table, offset list).
//!
//! And implements the four region operations: data-begin, data-update,
//! data-end and target launch.
//!
//! # Type-State Pipeline
//! A target launch runs through a type-safe pipeline:
//! ```text
//! RegionLaunch<Idle> → RegionLaunch<Mapped> → RegionLaunch<Staged> → RegionLaunch<Launched>
//! ```
//! Transitions are compile-time checked.
//!
//! # Transfer Strategies
//! - `immediate`: every copy and pointer patch goes to the device at once.
//! - `bulk`: copies are staged and coalesced; pointer patches are queued
//!   and written in one batch when data-begin ends.
//!
//! Either can be combined with an address table or a per-window offset
//! list, in which case pointers are left unpatched and device code
//! translates host addresses itself.

mod config;
mod error;
mod host;
mod launch;
mod metrics;
mod nested;
mod offload;
mod region;
mod registry;
pub mod strategy;

pub use config::{OffsetWindows, RuntimeConfig, MAX_OFFSET_WINDOWS};
pub use error::{return_code, OffloadError, OFFLOAD_FAIL, OFFLOAD_SUCCESS};
pub use memory_map::{MappingStats, RefCount};
pub use metrics::{OffloadMetrics, Phase, PhaseTiming};
pub use nested::PointerArrayDescriptor;
pub use offload::{OffloadRuntime, DEFAULT_DEVICE};
pub use offload_device::LaunchKind;
pub use registry::{DeviceRegistry, LibraryId};
pub use strategy::{BulkTransfer, ImmediateTransfer, PointerPatch, TransferStrategy};
