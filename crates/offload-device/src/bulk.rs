// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Deferred, batched host-to-device transfers.
//!
//! In bulk mode the data-begin phase does not copy anything. Copies are
//! staged into one contiguous buffer and pointer patches are queued in a
//! [`BulkQueue`] owned by that one region activation; once every argument
//! is mapped the device flushes both:
//!
//! ```text
//!  BulkQueue::bulk_data_submit ──► staging buffer + copy list ─┐
//!  BulkQueue::suspend_update   ──► pending patch FIFO ─────────┤
//!                                                              ▼
//!                    Device::bulk_transfer        (one batched submission)
//!                    Device::update_suspend_list  (one batched submission,
//!                                                  shadow entries recorded)
//! ```
//!
//! Patches run after the copies so that the staged copy of an enclosing
//! struct cannot overwrite a patched pointer field. A queue dropped without
//! a flush sends nothing.

use crate::{Device, DeviceError, TransferChunk};
use memory_map::ShadowEntry;
use std::collections::VecDeque;

/// A queued pointer patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingUpdate {
    /// Host address of the pointer field.
    pub host_slot: usize,
    /// Host address of the mapped pointee section.
    pub pointee_begin: usize,
    /// `pointee_begin - pointer value`; the patched device pointer keeps it.
    pub delta: usize,
    /// Host value of the pointer field, restored on copy-back.
    pub host_value: usize,
}

#[derive(Debug, Clone, Copy)]
struct StagedCopy {
    tgt: usize,
    offset: usize,
    len: usize,
}

/// Staged copies and patches of one region activation.
#[derive(Debug, Default)]
pub struct BulkQueue {
    staging: Vec<u8>,
    copies: Vec<StagedCopy>,
    updates: VecDeque<PendingUpdate>,
}

impl BulkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages `bytes` for the device address `tgt`.
    pub fn bulk_data_submit(&mut self, tgt: usize, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let offset = self.staging.len();
        self.staging.extend_from_slice(bytes);
        self.copies.push(StagedCopy {
            tgt,
            offset,
            len: bytes.len(),
        });
    }

    /// Queues a pointer patch for the next [`Device::update_suspend_list`].
    pub fn suspend_update(&mut self, update: PendingUpdate) {
        self.updates.push_back(update);
    }

    pub fn pending_copies(&self) -> usize {
        self.copies.len()
    }

    pub fn pending_updates(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty() && self.updates.is_empty()
    }
}

/// What a flush sent to the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkSummary {
    /// Coalesced chunks in the batch.
    pub chunks: usize,
    pub bytes: usize,
}

impl Device {
    /// Flushes every staged copy as one batched submission. Copies that
    /// are contiguous both on the device and in the staging buffer are
    /// merged into one chunk.
    pub fn bulk_transfer(&self, queue: &mut BulkQueue) -> Result<BulkSummary, DeviceError> {
        let staging = std::mem::take(&mut queue.staging);
        let mut copies = std::mem::take(&mut queue.copies);
        if copies.is_empty() {
            return Ok(BulkSummary::default());
        }

        copies.sort_by_key(|c| c.tgt);
        let mut merged: Vec<StagedCopy> = Vec::with_capacity(copies.len());
        for c in copies {
            match merged.last_mut() {
                Some(last) if last.tgt + last.len == c.tgt && last.offset + last.len == c.offset => {
                    last.len += c.len;
                }
                _ => merged.push(c),
            }
        }

        let chunks: Vec<TransferChunk<'_>> = merged
            .iter()
            .map(|c| TransferChunk {
                tgt: c.tgt,
                bytes: &staging[c.offset..c.offset + c.len],
            })
            .collect();
        let summary = self.submit_batch(&chunks)?;
        tracing::debug!(
            "device {}: bulk transfer of {} bytes in {} chunks",
            self.id(),
            summary.bytes,
            summary.chunks
        );
        Ok(summary)
    }

    /// Applies every queued pointer patch with one batched submission and
    /// records a shadow entry for each. Returns the number applied.
    pub fn update_suspend_list(&self, queue: &mut BulkQueue) -> Result<usize, DeviceError> {
        let updates: Vec<PendingUpdate> = queue.updates.drain(..).collect();
        if updates.is_empty() {
            return Ok(0);
        }

        let mut shadows = Vec::with_capacity(updates.len());
        for u in &updates {
            // An unmapped zero-length pointee becomes a null device pointer.
            let tgt_value = self
                .lookup_tgt_ptr(u.pointee_begin, 0)
                .map_or(0, |pointee| pointee.wrapping_sub(u.delta));
            shadows.push(ShadowEntry {
                host_slot: u.host_slot,
                host_value: u.host_value,
                tgt_slot: self.pointer_slot(u.host_slot)?,
                tgt_value,
            });
        }

        let values: Vec<[u8; std::mem::size_of::<usize>()]> =
            shadows.iter().map(|s| s.tgt_value.to_ne_bytes()).collect();
        let chunks: Vec<TransferChunk<'_>> = shadows
            .iter()
            .zip(&values)
            .map(|(s, v)| TransferChunk {
                tgt: s.tgt_slot,
                bytes: v.as_slice(),
            })
            .collect();
        self.submit_batch(&chunks)?;

        for shadow in shadows {
            self.insert_shadow(shadow);
        }
        Ok(updates.len())
    }

    fn submit_batch(&self, chunks: &[TransferChunk<'_>]) -> Result<BulkSummary, DeviceError> {
        let bytes = chunks.iter().map(|c| c.bytes.len()).sum();
        self.plugin()
            .data_submit_batch(self.rtl_device(), chunks)
            .map_err(|source| DeviceError::TransferFailed {
                device: self.id(),
                direction: crate::Direction::HostToDevice,
                tgt: chunks.first().map_or(0, |c| c.tgt),
                size: bytes,
                source,
            })?;
        self.transfers.lock().record_batch(chunks.len(), bytes);
        Ok(BulkSummary {
            chunks: chunks.len(),
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DevicePlugin, HostPlugin};
    use std::sync::Arc;

    fn device() -> (Arc<HostPlugin>, Device) {
        let plugin = Arc::new(HostPlugin::new(1));
        (plugin.clone(), Device::new(0, plugin, 0))
    }

    #[test]
    fn test_staged_copies_are_coalesced() {
        let (plugin, dev) = device();
        let tgt = plugin.data_alloc(0, 32, 0).unwrap();
        let mut q = BulkQueue::new();
        q.bulk_data_submit(tgt, &[1; 8]);
        q.bulk_data_submit(tgt + 8, &[2; 8]);
        q.bulk_data_submit(tgt + 24, &[3; 8]);
        assert_eq!(q.pending_copies(), 3);

        let summary = dev.bulk_transfer(&mut q).unwrap();
        assert_eq!(summary, BulkSummary { chunks: 2, bytes: 24 });
        assert_eq!(plugin.batches(), 1);
        assert!(q.is_empty());

        let bytes = plugin.read_device(0, tgt, 32).unwrap();
        assert_eq!(&bytes[..8], &[1; 8]);
        assert_eq!(&bytes[8..16], &[2; 8]);
        assert_eq!(&bytes[16..24], &[0; 8]);
        assert_eq!(&bytes[24..], &[3; 8]);
    }

    #[test]
    fn test_empty_flush_sends_nothing() {
        let (plugin, dev) = device();
        let mut q = BulkQueue::new();
        assert_eq!(dev.bulk_transfer(&mut q).unwrap(), BulkSummary::default());
        assert_eq!(dev.update_suspend_list(&mut q).unwrap(), 0);
        assert_eq!(plugin.batches(), 0);
    }

    #[test]
    fn test_patches_follow_copies() {
        let (plugin, dev) = device();
        // A 16-byte struct whose second field points at a 32-byte buffer.
        let s = dev.get_or_alloc_tgt_ptr(0x1000, 0x1000, 16, false, true).unwrap().unwrap();
        let buf = dev.get_or_alloc_tgt_ptr(0x8000, 0x8000, 32, false, true).unwrap().unwrap();
        let mut host_struct = [0u8; 16];
        host_struct[8..].copy_from_slice(&0x8000usize.to_ne_bytes());
        let mut q = BulkQueue::new();
        q.bulk_data_submit(s.addr, &host_struct);
        q.suspend_update(PendingUpdate {
            host_slot: 0x1008,
            pointee_begin: 0x8000,
            delta: 0,
            host_value: 0x8000,
        });

        dev.bulk_transfer(&mut q).unwrap();
        assert_eq!(dev.update_suspend_list(&mut q).unwrap(), 1);

        let field = plugin.read_device(0, s.addr + 8, 8).unwrap();
        assert_eq!(usize::from_ne_bytes(field.try_into().unwrap()), buf.addr);
        assert_eq!(dev.shadow_count(), 1);
        assert_eq!(dev.transfer_stats().batched_submissions, 2);
    }

    #[test]
    fn test_patch_with_unmapped_slot_fails() {
        let (_, dev) = device();
        let mut q = BulkQueue::new();
        q.suspend_update(PendingUpdate {
            host_slot: 0x1000,
            pointee_begin: 0x2000,
            delta: 0,
            host_value: 0x2000,
        });
        assert!(matches!(
            dev.update_suspend_list(&mut q),
            Err(DeviceError::Unmapped { begin: 0x1000, .. })
        ));
    }

    #[test]
    fn test_dropped_queue_sends_nothing() {
        let (plugin, dev) = device();
        let a = dev.get_or_alloc_tgt_ptr(0x1000, 0x1000, 8, false, true).unwrap().unwrap();
        {
            let mut q = BulkQueue::new();
            q.bulk_data_submit(a.addr, &[7; 8]);
        }
        plugin.data_submit(0, a.addr, &[9; 8]).unwrap();

        let mut other = BulkQueue::new();
        assert_eq!(dev.bulk_transfer(&mut other).unwrap(), BulkSummary::default());
        assert_eq!(plugin.read_device(0, a.addr, 8).unwrap(), vec![9; 8]);
        assert_eq!(plugin.batches(), 0);
    }
}
