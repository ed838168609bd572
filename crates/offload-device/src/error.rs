// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for device operations.

use crate::{OffsetConflict, PluginError};
use memory_map::MapError;
use std::fmt;

/// Direction of a data transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HostToDevice => "host-to-device",
            Self::DeviceToHost => "device-to-host",
        })
    }
}

/// Errors raised by [`Device`](crate::Device) operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The plugin could not allocate device memory.
    #[error("device {device}: failed to allocate {size} bytes")]
    AllocationFailed { device: usize, size: usize },

    /// A copy between host and device failed.
    #[error("device {device}: {direction} transfer of {size} bytes at {tgt:#x} failed: {source}")]
    TransferFailed {
        device: usize,
        direction: Direction,
        tgt: usize,
        size: usize,
        #[source]
        source: PluginError,
    },

    /// Device memory could not be released.
    #[error("device {device}: failed to free {tgt:#x}: {source}")]
    ReleaseFailed {
        device: usize,
        tgt: usize,
        #[source]
        source: PluginError,
    },

    /// A kernel launch reported failure.
    #[error("device {device}: kernel {entry:#x} failed: {source}")]
    LaunchFailed {
        device: usize,
        entry: usize,
        #[source]
        source: PluginError,
    },

    /// No mapping covers the host section.
    #[error("device {device}: no mapping for host section at {begin:#x} ({size} bytes)")]
    Unmapped {
        device: usize,
        begin: usize,
        size: usize,
    },

    /// An explicit map partially overlaps an existing mapping.
    #[error("device {device}: {source}")]
    Overlap {
        device: usize,
        #[source]
        source: MapError,
    },

    /// A user association request conflicts with the mapping table.
    #[error("device {device}: {detail}")]
    Association { device: usize, detail: String },

    /// The live mappings cannot be expressed as one offset per window.
    #[error("device {device}: {source}")]
    OffsetConflict {
        device: usize,
        #[source]
        source: OffsetConflict,
    },

    /// Plugin-side device or image initialisation failed.
    #[error("device {device}: initialisation failed: {detail}")]
    InitFailed { device: usize, detail: String },
}
