// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Bulk transfer strategy.
//!
//! Copies are staged and pointer patches queued in the activation's
//! [`BulkQueue`]; the flush at the end of data-begin sends all copies as one
//! batch, then all patches as a second batch.
//!
//! # When to use
//! - Many small sections per region (struct members, pointer arrays).
//! - Drivers where per-call submission overhead dominates.

use crate::strategy::{PointerPatch, TransferStrategy};
use offload_device::{BulkQueue, Device, DeviceError, PendingUpdate};

/// Two batched submissions per data-begin.
#[derive(Debug, Clone, Default)]
pub struct BulkTransfer;

impl BulkTransfer {
    pub fn new() -> Self {
        Self
    }
}

impl TransferStrategy for BulkTransfer {
    fn name(&self) -> &str {
        "bulk"
    }

    fn submit(
        &self,
        _device: &Device,
        deferred: &mut BulkQueue,
        tgt: usize,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        deferred.bulk_data_submit(tgt, bytes);
        Ok(())
    }

    fn patch(
        &self,
        _device: &Device,
        deferred: &mut BulkQueue,
        patch: PointerPatch,
    ) -> Result<(), DeviceError> {
        deferred.suspend_update(PendingUpdate {
            host_slot: patch.host_slot,
            pointee_begin: patch.pointee_begin,
            delta: patch.delta,
            host_value: patch.host_value,
        });
        Ok(())
    }

    fn flush(&self, device: &Device, deferred: &mut BulkQueue) -> Result<usize, DeviceError> {
        let summary = device.bulk_transfer(deferred)?;
        let patched = device.update_suspend_list(deferred)?;
        if summary.chunks > 0 || patched > 0 {
            tracing::debug!(
                "device {}: flushed {} bytes in {} chunks, {} pointer patches",
                device.id(),
                summary.bytes,
                summary.chunks,
                patched
            );
        }
        Ok(patched)
    }
}
