// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the offload runtime.

use offload_abi::AbiError;
use offload_device::{DeviceError, Direction, PluginError};

/// Status code of a successful runtime entry point.
pub const OFFLOAD_SUCCESS: i32 = 0;
/// Status code of a failed runtime entry point.
pub const OFFLOAD_FAIL: i32 = !0;

/// Errors surfaced by the region orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    /// The device could not provide memory for a section or scratch buffer.
    #[error("device {device}: allocation of {size} bytes failed")]
    AllocationFailure { device: usize, size: usize },

    /// A copy between host and device failed. The source names the device.
    #[error("{direction} transfer failed: {source}")]
    TransferFailure {
        device: usize,
        direction: Direction,
        #[source]
        source: DeviceError,
    },

    /// The kernel could not be run. The source names the device.
    #[error("launch of entry {entry:#x} failed: {source}")]
    LaunchFailure {
        device: usize,
        entry: usize,
        #[source]
        source: DeviceError,
    },

    /// A section expected to be mapped was not.
    #[error("device {device}: host range [{begin:#x}, +{size}) is not mapped")]
    UnmappedAddress {
        device: usize,
        begin: usize,
        size: usize,
    },

    /// An explicit map partially overlaps an existing mapping.
    #[error("overlapping map: {source}")]
    OverlapViolation {
        device: usize,
        #[source]
        source: DeviceError,
    },

    /// Device memory backing a released section could not be freed.
    #[error("device {device}: release of {tgt:#x} failed: {source}")]
    ReleaseFailure {
        device: usize,
        tgt: usize,
        #[source]
        source: PluginError,
    },

    /// A user association conflicts with the mapping table.
    #[error("device {device}: association rejected: {detail}")]
    AssociationConflict { device: usize, detail: String },

    /// Live mappings need different offsets inside one translation window.
    #[error("offset translation impossible: {source}")]
    TranslationConflict {
        device: usize,
        #[source]
        source: DeviceError,
    },

    /// No registered library provides a kernel for this host entry.
    #[error("no target entry for host function {host_ptr:#x}")]
    EntryTableExhausted { host_ptr: usize },

    /// Device initialisation or library loading failed.
    #[error("device {device} not ready: {detail}")]
    DeviceNotReady { device: usize, detail: String },

    /// The compiler-emitted argument arrays are inconsistent.
    #[error("invalid arguments: {0}")]
    InvalidArguments(#[from] AbiError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl From<DeviceError> for OffloadError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::AllocationFailed { device, size } => {
                Self::AllocationFailure { device, size }
            }
            DeviceError::TransferFailed {
                device, direction, ..
            } => Self::TransferFailure {
                device,
                direction,
                source: err,
            },
            DeviceError::LaunchFailed { device, entry, .. } => Self::LaunchFailure {
                device,
                entry,
                source: err,
            },
            DeviceError::Unmapped {
                device,
                begin,
                size,
            } => Self::UnmappedAddress {
                device,
                begin,
                size,
            },
            DeviceError::Overlap { device, .. } => Self::OverlapViolation {
                device,
                source: err,
            },
            DeviceError::ReleaseFailed {
                device,
                tgt,
                source,
            } => Self::ReleaseFailure {
                device,
                tgt,
                source,
            },
            DeviceError::Association { device, detail } => {
                Self::AssociationConflict { device, detail }
            }
            DeviceError::OffsetConflict { device, .. } => Self::TranslationConflict {
                device,
                source: err,
            },
            DeviceError::InitFailed { device, .. } => Self::DeviceNotReady {
                device,
                detail: err.to_string(),
            },
        }
    }
}

/// Collapses a runtime result to the status code compiled code expects.
pub fn return_code<T>(result: &Result<T, OffloadError>) -> i32 {
    match result {
        Ok(_) => OFFLOAD_SUCCESS,
        Err(_) => OFFLOAD_FAIL,
    }
}
