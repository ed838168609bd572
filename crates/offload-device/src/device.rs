// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Per-device mapping lifecycle.
//!
//! ```text
//!   get_or_alloc_tgt_ptr ──► new entry (rc = 1) or reuse (rc + 1)
//!            │
//!   get_tgt_ptr_begin    ──► lookup, rc - 1 while rc > 1, reports is_last
//!            │
//!   dealloc_tgt_ptr      ──► final decrement, device free, entry removed
//! ```
//!
//! Entries with an infinite reference count (globals, user associations)
//! are never decremented or evicted by this lifecycle.

use crate::{DeviceError, DevicePlugin, Direction, TransferStats};
use memory_map::{
    MapError, MappingEntry, MappingStats, MappingTable, RefCount, ShadowEntry, ShadowTable,
};
use offload_abi::PTR_SIZE;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Result of [`Device::get_or_alloc_tgt_ptr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetPtr {
    /// Device address of the requested host begin.
    pub addr: usize,
    /// True if the mapping was created by this call.
    pub is_new: bool,
}

/// Result of [`Device::get_tgt_ptr_begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetLookup {
    pub addr: usize,
    /// True if the caller held the last reference.
    pub is_last: bool,
}

/// How a kernel is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchKind {
    Single,
    Teams { num_teams: i32, thread_limit: i32 },
}

/// One accelerator and the runtime state kept for it.
pub struct Device {
    id: usize,
    rtl_device: i32,
    plugin: Arc<dyn DevicePlugin>,
    mappings: Mutex<MappingTable>,
    shadows: Mutex<ShadowTable>,
    pending_globals: Mutex<bool>,
    init: OnceLock<Result<(), String>>,
    loop_trip_count: AtomicU64,
    pub(crate) transfers: Mutex<TransferStats>,
}

impl Device {
    /// Creates device `id`, served by `plugin` as its device `rtl_device`.
    pub fn new(id: usize, plugin: Arc<dyn DevicePlugin>, rtl_device: i32) -> Self {
        Self {
            id,
            rtl_device,
            plugin,
            mappings: Mutex::new(MappingTable::new()),
            shadows: Mutex::new(ShadowTable::new()),
            pending_globals: Mutex::new(false),
            init: OnceLock::new(),
            loop_trip_count: AtomicU64::new(0),
            transfers: Mutex::new(TransferStats::default()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn plugin(&self) -> &Arc<dyn DevicePlugin> {
        &self.plugin
    }

    /// Plugin-local device number.
    pub fn rtl_device(&self) -> i32 {
        self.rtl_device
    }

    // ── Initialisation ─────────────────────────────────────────

    /// Initialises the device through its plugin exactly once. Later calls
    /// return the outcome of the first.
    pub fn initialize(&self) -> Result<(), DeviceError> {
        let outcome = self.init.get_or_init(|| {
            tracing::debug!("initialising device {} ({})", self.id, self.plugin.name());
            self.plugin
                .init_device(self.rtl_device)
                .map_err(|e| e.to_string())
        });
        outcome.clone().map_err(|detail| DeviceError::InitFailed {
            device: self.id,
            detail,
        })
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.init.get(), Some(Ok(())))
    }

    /// Locks the pending-globals flag. Holding the guard serialises
    /// one-time library initialisation on this device.
    pub fn pending_globals(&self) -> MutexGuard<'_, bool> {
        self.pending_globals.lock()
    }

    // ── Mapping lifecycle ──────────────────────────────────────

    /// Returns the device address for `[host_begin, host_begin + size)`,
    /// reusing a containing mapping or allocating a new one.
    ///
    /// Implicit maps may reuse a partially overlapping entry; explicit maps
    /// fail with [`DeviceError::Overlap`]. A zero-sized section with no
    /// covering mapping yields `Ok(None)`.
    pub fn get_or_alloc_tgt_ptr(
        &self,
        host_begin: usize,
        host_base: usize,
        size: usize,
        is_implicit: bool,
        update_ref: bool,
    ) -> Result<Option<TargetPtr>, DeviceError> {
        let mut map = self.mappings.lock();
        let found = map.lookup(host_begin, size);

        if let Some(key) = found.entry {
            if found.is_partial() && !is_implicit {
                map.record_overlap();
                let existing = map.entry(key).map(|e| (e.host_begin, e.host_end));
                let (existing_begin, existing_end) = existing.unwrap_or((key, key));
                return Err(DeviceError::Overlap {
                    device: self.id,
                    source: MapError::Overlap {
                        begin: host_begin,
                        end: host_begin.saturating_add(size),
                        existing_begin,
                        existing_end,
                    },
                });
            }
            if found.is_partial() {
                tracing::debug!(
                    "device {}: implicit map of [{host_begin:#x}, +{size}) reuses overlapping entry at {key:#x}",
                    self.id
                );
            }
            let reused = map.entry_mut(key).map(|entry| {
                if update_ref {
                    entry.ref_count.increment();
                }
                tracing::debug!(
                    "device {}: reuse host {host_begin:#x} -> {:#x} (rc {})",
                    self.id,
                    entry.tgt_for(host_begin),
                    entry.ref_count
                );
                entry.tgt_for(host_begin)
            });
            if let Some(addr) = reused {
                map.record_reuse();
                return Ok(Some(TargetPtr {
                    addr,
                    is_new: false,
                }));
            }
        }

        if size == 0 {
            return Ok(None);
        }

        let tgt = self
            .plugin
            .data_alloc(self.rtl_device, size, host_begin)
            .ok_or(DeviceError::AllocationFailed {
                device: self.id,
                size,
            })?;
        self.transfers.lock().record_alloc();
        map.insert(MappingEntry::new(host_base, host_begin, host_begin + size, tgt))
            .map_err(|source| DeviceError::Overlap {
                device: self.id,
                source,
            })?;
        tracing::debug!(
            "device {}: new mapping host [{host_begin:#x}, +{size}) -> {tgt:#x}",
            self.id
        );
        Ok(Some(TargetPtr {
            addr: tgt,
            is_new: true,
        }))
    }

    /// Looks up the device address of a mapped section, optionally
    /// releasing one reference. The final reference is released by
    /// [`dealloc_tgt_ptr`](Self::dealloc_tgt_ptr), so the count never drops
    /// below one here.
    pub fn get_tgt_ptr_begin(
        &self,
        host_begin: usize,
        size: usize,
        update_ref: bool,
    ) -> Option<TargetLookup> {
        let mut map = self.mappings.lock();
        let key = map.lookup(host_begin, size).entry?;
        let entry = map.entry_mut(key)?;
        let is_last = entry.ref_count.is_last();
        if update_ref && !is_last {
            entry.ref_count.decrement();
        }
        Some(TargetLookup {
            addr: entry.tgt_for(host_begin),
            is_last,
        })
    }

    /// Device address of a mapped section without touching its count.
    pub fn lookup_tgt_ptr(&self, host_begin: usize, size: usize) -> Option<usize> {
        let map = self.mappings.lock();
        let key = map.lookup(host_begin, size).entry?;
        map.entry(key).map(|e| e.tgt_for(host_begin))
    }

    /// Releases one reference to the mapping covering `host_begin`; frees
    /// the device copy and removes the entry when none remain.
    /// `force_delete` releases every reference at once.
    pub fn dealloc_tgt_ptr(
        &self,
        host_begin: usize,
        size: usize,
        force_delete: bool,
    ) -> Result<(), DeviceError> {
        let mut map = self.mappings.lock();
        let unmapped = || DeviceError::Unmapped {
            device: self.id,
            begin: host_begin,
            size,
        };
        let key = map.lookup(host_begin, size).entry.ok_or_else(unmapped)?;
        let Some(entry) = map.entry_mut(key) else {
            return Err(unmapped());
        };
        if entry.ref_count.is_infinite() {
            return Ok(());
        }
        if force_delete {
            entry.ref_count = RefCount::ONE;
        }
        if entry.ref_count.decrement() > 0 {
            return Ok(());
        }

        let (tgt, host_end) = (entry.tgt_begin, entry.host_end);
        map.remove(key);
        // Shadows never outlive the mapping that holds their slot.
        let stale = self.shadows.lock().visit_range(key, host_end, true, |_| {});
        tracing::debug!(
            "device {}: removed mapping at host {key:#x} (tgt {tgt:#x}, {stale} stale shadows)",
            self.id
        );
        self.plugin
            .data_delete(self.rtl_device, tgt)
            .map_err(|source| DeviceError::ReleaseFailed {
                device: self.id,
                tgt,
                source,
            })?;
        self.transfers.lock().record_free();
        Ok(())
    }

    /// Maps `host_begin` to caller-provided device memory. The mapping has
    /// an infinite count and is only removed by
    /// [`disassociate_ptr`](Self::disassociate_ptr).
    pub fn associate_ptr(&self, host_begin: usize, tgt_begin: usize, size: usize) -> Result<(), DeviceError> {
        let mut map = self.mappings.lock();
        let found = map.lookup(host_begin, size);
        if let Some(key) = found.entry {
            let same = map.entry(key).is_some_and(|e| {
                found.is_contained && e.tgt_for(host_begin) == tgt_begin
            });
            return if same {
                Ok(())
            } else {
                Err(DeviceError::Association {
                    device: self.id,
                    detail: format!("host {host_begin:#x} is already mapped elsewhere"),
                })
            };
        }
        let entry = MappingEntry::new(host_begin, host_begin, host_begin + size, tgt_begin)
            .with_ref_count(RefCount::INFINITE);
        map.insert(entry).map_err(|source| DeviceError::Overlap {
            device: self.id,
            source,
        })
    }

    /// Removes a mapping created by [`associate_ptr`](Self::associate_ptr).
    /// Device memory is left to its owner.
    pub fn disassociate_ptr(&self, host_begin: usize) -> Result<(), DeviceError> {
        let mut map = self.mappings.lock();
        let key = map.lookup(host_begin, 0).entry.ok_or(DeviceError::Association {
            device: self.id,
            detail: format!("host {host_begin:#x} is not associated"),
        })?;
        match map.entry(key) {
            Some(e) if e.ref_count.is_infinite() => {
                map.remove(key);
                Ok(())
            }
            _ => Err(DeviceError::Association {
                device: self.id,
                detail: format!("host {host_begin:#x} was mapped by a region, not associated"),
            }),
        }
    }

    /// Inserts a mapping for an image global with an infinite count, unless
    /// the section is already mapped.
    pub fn map_global(&self, host_addr: usize, tgt_addr: usize, size: usize) -> Result<bool, DeviceError> {
        let mut map = self.mappings.lock();
        if map.lookup(host_addr, size).is_found() {
            return Ok(false);
        }
        let entry = MappingEntry::new(host_addr, host_addr, host_addr + size, tgt_addr)
            .with_ref_count(RefCount::INFINITE);
        map.insert(entry).map_err(|source| DeviceError::Overlap {
            device: self.id,
            source,
        })?;
        Ok(true)
    }

    /// Reference count of the mapping containing `host_addr`.
    pub fn map_entry_ref_count(&self, host_addr: usize) -> Option<RefCount> {
        self.mappings.lock().ref_count_at(host_addr)
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }

    /// A copy of every live mapping, in descending host order.
    pub fn snapshot_mappings(&self) -> Vec<MappingEntry> {
        self.mappings.lock().iter().cloned().collect()
    }

    pub fn mapping_stats(&self) -> MappingStats {
        self.mappings.lock().stats().clone()
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.transfers.lock().clone()
    }

    pub(crate) fn with_mappings<R>(&self, f: impl FnOnce(&MappingTable) -> R) -> R {
        f(&self.mappings.lock())
    }

    // ── Shadow pointers ────────────────────────────────────────

    /// Writes `tgt_value` into the device pointer slot `tgt_slot` and
    /// remembers the host value of the slot.
    pub fn patch_pointer(&self, shadow: ShadowEntry) -> Result<(), DeviceError> {
        self.data_submit(shadow.tgt_slot, &shadow.tgt_value.to_ne_bytes())?;
        self.insert_shadow(shadow);
        Ok(())
    }

    pub fn insert_shadow(&self, shadow: ShadowEntry) {
        tracing::debug!(
            "device {}: shadow slot {:#x} (host value {:#x}, device value {:#x})",
            self.id,
            shadow.host_slot,
            shadow.host_value,
            shadow.tgt_value
        );
        self.shadows.lock().insert(shadow);
    }

    /// Visits shadowed slots in `[lb, ub)` from the highest down, erasing
    /// them when `erase` is set.
    pub fn restore_shadows<F>(&self, lb: usize, ub: usize, erase: bool, f: F) -> usize
    where
        F: FnMut(&ShadowEntry),
    {
        self.shadows.lock().visit_range(lb, ub, erase, f)
    }

    /// Re-submits the patched device values of shadowed slots in `[lb, ub)`.
    pub fn resubmit_shadows(&self, lb: usize, ub: usize) -> Result<usize, DeviceError> {
        let patched: Vec<ShadowEntry> = self.shadows.lock().in_range(lb, ub).copied().collect();
        for shadow in &patched {
            self.data_submit(shadow.tgt_slot, &shadow.tgt_value.to_ne_bytes())?;
        }
        Ok(patched.len())
    }

    pub fn shadow_count(&self) -> usize {
        self.shadows.lock().len()
    }

    // ── Data movement ──────────────────────────────────────────

    pub fn data_submit(&self, tgt: usize, src: &[u8]) -> Result<(), DeviceError> {
        if src.is_empty() {
            return Ok(());
        }
        self.plugin
            .data_submit(self.rtl_device, tgt, src)
            .map_err(|source| DeviceError::TransferFailed {
                device: self.id,
                direction: Direction::HostToDevice,
                tgt,
                size: src.len(),
                source,
            })?;
        self.transfers.lock().record_h2d(src.len());
        Ok(())
    }

    pub fn data_retrieve(&self, dst: &mut [u8], tgt: usize) -> Result<(), DeviceError> {
        if dst.is_empty() {
            return Ok(());
        }
        let size = dst.len();
        self.plugin
            .data_retrieve(self.rtl_device, dst, tgt)
            .map_err(|source| DeviceError::TransferFailed {
                device: self.id,
                direction: Direction::DeviceToHost,
                tgt,
                size,
                source,
            })?;
        self.transfers.lock().record_d2h(size);
        Ok(())
    }

    /// Allocates unmapped device memory for a single launch.
    pub fn alloc_scratch(&self, size: usize, host_hint: usize) -> Result<usize, DeviceError> {
        let tgt = self
            .plugin
            .data_alloc(self.rtl_device, size, host_hint)
            .ok_or(DeviceError::AllocationFailed {
                device: self.id,
                size,
            })?;
        self.transfers.lock().record_alloc();
        Ok(tgt)
    }

    pub fn free_scratch(&self, tgt: usize) -> Result<(), DeviceError> {
        self.plugin
            .data_delete(self.rtl_device, tgt)
            .map_err(|source| DeviceError::ReleaseFailed {
                device: self.id,
                tgt,
                source,
            })?;
        self.transfers.lock().record_free();
        Ok(())
    }

    // ── Launch ─────────────────────────────────────────────────

    /// Records the trip count for the next team launch.
    pub fn push_loop_trip_count(&self, count: u64) {
        self.loop_trip_count.store(count, Ordering::Release);
    }

    /// Takes the pending trip count, resetting it to zero.
    pub fn take_loop_trip_count(&self) -> u64 {
        self.loop_trip_count.swap(0, Ordering::AcqRel)
    }

    /// Launches `entry`. A team launch consumes the pending trip count.
    pub fn launch(
        &self,
        entry: usize,
        args: &[usize],
        offsets: &[isize],
        kind: LaunchKind,
    ) -> Result<(), DeviceError> {
        let outcome = match kind {
            LaunchKind::Single => self.plugin.run_region(self.rtl_device, entry, args, offsets),
            LaunchKind::Teams {
                num_teams,
                thread_limit,
            } => {
                let trip_count = self.take_loop_trip_count();
                self.plugin.run_team_region(
                    self.rtl_device,
                    entry,
                    args,
                    offsets,
                    num_teams,
                    thread_limit,
                    trip_count,
                )
            }
        };
        outcome.map_err(|source| DeviceError::LaunchFailed {
            device: self.id,
            entry,
            source,
        })?;
        self.transfers.lock().record_launch();
        Ok(())
    }

    /// Device address of the pointer slot at `host_slot`.
    pub(crate) fn pointer_slot(&self, host_slot: usize) -> Result<usize, DeviceError> {
        self.lookup_tgt_ptr(host_slot, PTR_SIZE)
            .ok_or(DeviceError::Unmapped {
                device: self.id,
                begin: host_slot,
                size: PTR_SIZE,
            })
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("plugin", &self.plugin.name())
            .field("rtl_device", &self.rtl_device)
            .field("mappings", &self.mapping_count())
            .finish()
    }
}
