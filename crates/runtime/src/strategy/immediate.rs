// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Immediate transfer strategy.
//!
//! Every copy and every pointer patch is issued as soon as the argument is
//! mapped. Simple and ordered, at the cost of one driver call per section.

use crate::strategy::{PointerPatch, TransferStrategy};
use memory_map::ShadowEntry;
use offload_device::{BulkQueue, Device, DeviceError};

/// One driver call per copy or patch.
#[derive(Debug, Clone, Default)]
pub struct ImmediateTransfer;

impl ImmediateTransfer {
    pub fn new() -> Self {
        Self
    }
}

impl TransferStrategy for ImmediateTransfer {
    fn name(&self) -> &str {
        "immediate"
    }

    fn submit(
        &self,
        device: &Device,
        _deferred: &mut BulkQueue,
        tgt: usize,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        device.data_submit(tgt, bytes)
    }

    fn patch(
        &self,
        device: &Device,
        _deferred: &mut BulkQueue,
        patch: PointerPatch,
    ) -> Result<(), DeviceError> {
        device.patch_pointer(ShadowEntry {
            host_slot: patch.host_slot,
            host_value: patch.host_value,
            tgt_slot: patch.tgt_slot,
            tgt_value: patch.tgt_value(),
        })
    }

    fn flush(&self, _device: &Device, _deferred: &mut BulkQueue) -> Result<usize, DeviceError> {
        Ok(0)
    }
}
