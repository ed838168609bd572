// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The driver plugin interface.
//!
//! A plugin serves one or more devices, addressed by the plugin-local
//! device number. All calls are synchronous: when a call returns, the copy
//! or kernel has completed.

use offload_abi::{DeviceImage, TargetTable};

/// Error reported by a plugin call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PluginError(pub String);

impl PluginError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

/// One piece of a batched host-to-device submission.
#[derive(Debug, Clone, Copy)]
pub struct TransferChunk<'a> {
    pub tgt: usize,
    pub bytes: &'a [u8],
}

/// Driver operations the runtime relies on.
pub trait DevicePlugin: Send + Sync {
    /// Human-readable plugin name.
    fn name(&self) -> &str;

    /// Number of devices this plugin drives.
    fn number_of_devices(&self) -> usize;

    /// Prepares `device` for use. Called once per device.
    fn init_device(&self, device: i32) -> Result<(), PluginError>;

    /// Loads an image and returns its entries in image order.
    fn load_binary(&self, device: i32, image: &DeviceImage) -> Result<TargetTable, PluginError>;

    /// Allocates `size` bytes. `host_hint` is the host address being mapped.
    fn data_alloc(&self, device: i32, size: usize, host_hint: usize) -> Option<usize>;

    fn data_delete(&self, device: i32, tgt: usize) -> Result<(), PluginError>;

    fn data_submit(&self, device: i32, tgt: usize, src: &[u8]) -> Result<(), PluginError>;

    fn data_retrieve(&self, device: i32, dst: &mut [u8], tgt: usize) -> Result<(), PluginError>;

    /// Submits several chunks as one aggregated transfer.
    ///
    /// Plugins without a native batched copy inherit this per-chunk loop.
    fn data_submit_batch(&self, device: i32, chunks: &[TransferChunk<'_>]) -> Result<(), PluginError> {
        for chunk in chunks {
            self.data_submit(device, chunk.tgt, chunk.bytes)?;
        }
        Ok(())
    }

    /// Runs a single-team region. Each kernel argument is `args[i] + offsets[i]`.
    fn run_region(
        &self,
        device: i32,
        entry: usize,
        args: &[usize],
        offsets: &[isize],
    ) -> Result<(), PluginError>;

    /// Runs a team region.
    #[allow(clippy::too_many_arguments)]
    fn run_team_region(
        &self,
        device: i32,
        entry: usize,
        args: &[usize],
        offsets: &[isize],
        num_teams: i32,
        thread_limit: i32,
        loop_trip_count: u64,
    ) -> Result<(), PluginError>;
}
