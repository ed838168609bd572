// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The [`TransferStrategy`] trait and its implementations.
//!
//! A strategy decides how the data-begin phase moves host bytes into fresh
//! device copies and how it patches embedded pointers. Mapping decisions
//! (what to allocate, what to copy, reference counts) are the same for
//! every strategy.
//!
//! Deferred work lives in a [`BulkQueue`] created by the caller for one
//! region activation and handed to every call of that activation. A failed
//! activation drops its queue, so nothing it staged reaches the device and
//! concurrent activations never flush each other's work.

pub mod bulk;
pub mod immediate;

pub use bulk::BulkTransfer;
pub use immediate::ImmediateTransfer;

use offload_device::{BulkQueue, Device, DeviceError};

/// One embedded pointer whose device copy must point at a device section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerPatch {
    /// Host address of the pointer field.
    pub host_slot: usize,
    /// Current host value of the pointer field.
    pub host_value: usize,
    /// Device address of the pointer field.
    pub tgt_slot: usize,
    /// Host address of the mapped pointee section.
    pub pointee_begin: usize,
    /// `pointee_begin - host_value`.
    pub delta: usize,
    /// Device address of `pointee_begin`, if the pointee is mapped.
    pub pointee_tgt: Option<usize>,
}

impl PointerPatch {
    /// The value the device pointer field receives. Unmapped pointees give null.
    pub fn tgt_value(&self) -> usize {
        self.pointee_tgt.map_or(0, |tgt| tgt.wrapping_sub(self.delta))
    }
}

/// How the data-begin phase moves bytes to the device.
pub trait TransferStrategy: Send + Sync {
    /// Human-readable name of this strategy.
    fn name(&self) -> &str;

    /// Copies `bytes` to `tgt`, now or at the next [`flush`](Self::flush).
    fn submit(
        &self,
        device: &Device,
        deferred: &mut BulkQueue,
        tgt: usize,
        bytes: &[u8],
    ) -> Result<(), DeviceError>;

    /// Patches a pointer field, now or at the next [`flush`](Self::flush).
    fn patch(
        &self,
        device: &Device,
        deferred: &mut BulkQueue,
        patch: PointerPatch,
    ) -> Result<(), DeviceError>;

    /// Completes the work deferred into `deferred`. Called once at the end
    /// of every successful data-begin. Returns the number of pointer fields
    /// patched.
    fn flush(&self, device: &Device, deferred: &mut BulkQueue) -> Result<usize, DeviceError>;
}
