// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Data-begin, data-end and data-update over one argument list.
//!
//! ```text
//!  data_begin   forward   map (+1 ref) ─► copy TO ─► patch pointers ─► flush
//!  data_update  forward   lookup ─► FROM: retrieve + restore slots
//!                                ─► TO:   submit + re-patch slots
//!  data_end     reverse   lookup (-1 ref) ─► copy FROM ─► restore/erase
//!                         shadows ─► free on last reference
//! ```
//!
//! Arguments are classified once with [`MapArg::kind`]; literals, privates
//! and lambda captures never reach this module's mapping paths. `NESTED`
//! arguments are expanded lazily, one region at a time.

use crate::host::{host_bytes, host_bytes_mut, read_host_ptr, write_host_ptr};
use crate::metrics::{OffloadMetrics, Phase};
use crate::strategy::{PointerPatch, TransferStrategy};
use crate::{OffloadError, RuntimeConfig};
use offload_abi::{ArgList, MapArg, MapType, PTR_SIZE};
use offload_device::{BulkQueue, Device};
use parking_lot::Mutex;
use std::time::Instant;

/// Everything one region operation needs.
pub(crate) struct RegionContext<'a> {
    pub(crate) device: &'a Device,
    pub(crate) strategy: &'a dyn TransferStrategy,
    pub(crate) config: &'a RuntimeConfig,
    pub(crate) metrics: &'a Mutex<OffloadMetrics>,
}

impl RegionContext<'_> {
    /// Maps every argument, copies what must be copied and patches pointers.
    /// Deferred work of the strategy is flushed before returning. On error
    /// the deferred queue is dropped unflushed.
    ///
    /// # Safety
    /// Every host section named by `args` must be readable, and the pointer
    /// slot of every pointer-and-object argument must hold a pointer.
    pub(crate) unsafe fn data_begin(&self, args: &mut ArgList) -> Result<(), OffloadError> {
        let mut deferred = BulkQueue::new();
        for index in 0..args.len() {
            if !args.arg(index)?.kind().is_mapped() {
                continue;
            }
            let padded = heads_padded_struct(args, index)?;
            let mut return_base = None;
            for region in args.regions(index)? {
                if let Some(base) = self.map_region(&mut deferred, args, &region, padded)? {
                    return_base = Some(base);
                }
            }
            if let Some(base) = return_base {
                args.set_base(index, base)?;
            }
        }

        let start = Instant::now();
        let patched = self.strategy.flush(self.device, &mut deferred)?;
        if patched > 0 {
            self.record(Phase::PointerUpdate, start);
        }
        Ok(())
    }

    /// Releases every argument in reverse order, copying back and freeing
    /// device copies whose last reference goes away.
    ///
    /// # Safety
    /// Every host section named by `args` with `FROM` set must be writable,
    /// and so must every pointer slot restored from a shadow entry.
    pub(crate) unsafe fn data_end(&self, args: &ArgList) -> Result<(), OffloadError> {
        for index in (0..args.len()).rev() {
            if !args.arg(index)?.kind().is_mapped() {
                continue;
            }
            let padded = heads_padded_struct(args, index)?;
            for region in args.regions(index)? {
                self.unmap_region(args, &region, padded)?;
            }
        }
        Ok(())
    }

    /// Moves data for already-mapped sections without touching reference
    /// counts. Unmapped sections are skipped. Returns the sections moved.
    ///
    /// # Safety
    /// `TO` sections must be readable and `FROM` sections writable.
    pub(crate) unsafe fn data_update(&self, args: &ArgList) -> Result<usize, OffloadError> {
        let mut moved = 0;
        for index in 0..args.len() {
            if !args.arg(index)?.kind().is_mapped() {
                continue;
            }
            for region in args.regions(index)? {
                if !region.kind().is_mapped() {
                    continue;
                }
                let t = region.map_type;
                let (begin, size) = (region.begin, region.size);
                let Some(tgt) = self.device.lookup_tgt_ptr(begin, size) else {
                    tracing::debug!("update of unmapped [{begin:#x}, +{size}) skipped");
                    continue;
                };
                if t.contains(MapType::FROM) {
                    self.device.data_retrieve(host_bytes_mut(begin, size), tgt)?;
                    self.device.restore_shadows(begin, begin + size, false, |s| {
                        write_host_ptr(s.host_slot, s.host_value);
                    });
                }
                if t.contains(MapType::TO) {
                    self.device.data_submit(tgt, host_bytes(begin, size))?;
                    self.device.resubmit_shadows(begin, begin + size)?;
                }
                moved += 1;
            }
        }
        Ok(moved)
    }

    // ── Per-region steps ───────────────────────────────────────

    unsafe fn map_region(
        &self,
        deferred: &mut BulkQueue,
        args: &ArgList,
        region: &MapArg,
        padded: bool,
    ) -> Result<Option<usize>, OffloadError> {
        if !region.kind().is_mapped() {
            return Ok(None);
        }
        let t = region.map_type;
        let (begin, size) = self.section(region, padded);
        let is_implicit = t.contains(MapType::IMPLICIT);
        let mut update_ref = t.member_of().is_none();
        let mut base = region.base;

        // Pointer slot first; the pointee is mapped relative to the slot's value.
        let mut pointer = None;
        if t.contains(MapType::PTR_AND_OBJ) {
            let host_slot = region.base;
            let slot = self
                .device
                .get_or_alloc_tgt_ptr(host_slot, host_slot, PTR_SIZE, is_implicit, update_ref)?
                .ok_or(OffloadError::UnmappedAddress {
                    device: self.device.id(),
                    begin: host_slot,
                    size: PTR_SIZE,
                })?;
            base = read_host_ptr(host_slot);
            update_ref = true;
            pointer = Some((host_slot, slot.addr));
        }

        let mapped = self
            .device
            .get_or_alloc_tgt_ptr(begin, base, size, is_implicit, update_ref)?;
        let tgt = mapped.map(|m| m.addr);
        let is_new = mapped.is_some_and(|m| m.is_new);
        tracing::debug!(
            "device {}: begin [{begin:#x}, +{size}) type {:#x} -> {:?}{}",
            self.device.id(),
            t.bits(),
            tgt,
            if is_new { " (new)" } else { "" }
        );

        if t.contains(MapType::TO) {
            if let Some(tgt) = tgt {
                let copy = is_new
                    || t.contains(MapType::ALWAYS)
                    || (t.member_of().is_some() && self.parent_is_sole_owner(args, region)?);
                if copy {
                    self.strategy.submit(self.device, deferred, tgt, host_bytes(begin, size))?;
                }
            }
        }

        // Device code translates addresses itself when a table or offset
        // list is uploaded.
        if let Some((host_slot, tgt_slot)) = pointer {
            if !self.config.translates_on_device() {
                let start = Instant::now();
                self.strategy.patch(
                    self.device,
                    deferred,
                    PointerPatch {
                        host_slot,
                        host_value: base,
                        tgt_slot,
                        pointee_begin: begin,
                        delta: begin.wrapping_sub(base),
                        pointee_tgt: tgt,
                    },
                )?;
                self.record(Phase::PointerUpdate, start);
            }
        }

        if t.contains(MapType::RETURN_PARAM) {
            let delta = begin.wrapping_sub(base);
            return Ok(Some(tgt.map_or(0, |tgt| tgt.wrapping_sub(delta))));
        }
        Ok(None)
    }

    unsafe fn unmap_region(
        &self,
        args: &ArgList,
        region: &MapArg,
        padded: bool,
    ) -> Result<(), OffloadError> {
        if !region.kind().is_mapped() {
            return Ok(());
        }
        let t = region.map_type;
        let (begin, size) = self.section(region, padded);
        let is_member = t.member_of().is_some();
        let ptr_and_obj = t.contains(MapType::PTR_AND_OBJ);
        let force = t.contains(MapType::DELETE);

        match self.device.get_tgt_ptr_begin(begin, size, !is_member || ptr_and_obj) {
            Some(found) => {
                // Plain struct members never free the enclosing struct's entry.
                let del = (found.is_last || force) && !(is_member && !ptr_and_obj);
                let mut copied = false;
                if t.contains(MapType::FROM) {
                    let copy_member = is_member
                        && !ptr_and_obj
                        && self.parent_is_sole_owner(args, region)?;
                    if del || t.contains(MapType::ALWAYS) || copy_member {
                        self.device.data_retrieve(host_bytes_mut(begin, size), found.addr)?;
                        copied = true;
                    }
                }
                if (copied || del) && !self.config.translates_on_device() {
                    self.device.restore_shadows(begin, begin + size, del, |s| {
                        if copied {
                            write_host_ptr(s.host_slot, s.host_value);
                        }
                    });
                }
                tracing::debug!(
                    "device {}: end [{begin:#x}, +{size}) last={} delete={del} copied={copied}",
                    self.device.id(),
                    found.is_last
                );
                if del {
                    self.device.dealloc_tgt_ptr(begin, size, force)?;
                }
            }
            None if size == 0 => {}
            None => {
                return Err(OffloadError::UnmappedAddress {
                    device: self.device.id(),
                    begin,
                    size,
                })
            }
        }

        if ptr_and_obj && !is_member {
            self.release_pointer_slot(region.base)?;
        }
        Ok(())
    }

    /// Drops the reference a standalone pointer-and-object argument took on
    /// its pointer slot.
    fn release_pointer_slot(&self, host_slot: usize) -> Result<(), OffloadError> {
        let slot = self
            .device
            .get_tgt_ptr_begin(host_slot, PTR_SIZE, true)
            .ok_or(OffloadError::UnmappedAddress {
                device: self.device.id(),
                begin: host_slot,
                size: PTR_SIZE,
            })?;
        if slot.is_last {
            self.device.dealloc_tgt_ptr(host_slot, PTR_SIZE, false)?;
        }
        Ok(())
    }

    // ── Helpers ────────────────────────────────────────────────

    /// The section to map, padded down to the struct alignment for
    /// combined struct entries.
    fn section(&self, region: &MapArg, padded: bool) -> (usize, usize) {
        if !padded {
            return (region.begin, region.size);
        }
        let pad = region.begin % self.config.struct_alignment;
        if pad != 0 {
            tracing::debug!("padding combined entry at {:#x} by {pad} bytes", region.begin);
        }
        (region.begin - pad, region.size + pad)
    }

    /// True if the struct `region` is a member of is referenced exactly once.
    fn parent_is_sole_owner(&self, args: &ArgList, region: &MapArg) -> Result<bool, OffloadError> {
        let Some(parent) = region.map_type.member_of() else {
            return Ok(false);
        };
        let parent = args.arg(parent)?;
        let rc = self.device.map_entry_ref_count(parent.begin);
        if rc.is_none() {
            tracing::warn!("parent struct at {:#x} is not mapped", parent.begin);
        }
        Ok(rc.is_some_and(|rc| rc.get() == 1))
    }

    fn record(&self, phase: Phase, start: Instant) {
        if self.config.enable_profiling {
            self.metrics.lock().record_since(phase, start);
        }
    }
}

/// True if argument `index` is a combined struct entry that gets padded.
fn heads_padded_struct(args: &ArgList, index: usize) -> Result<bool, OffloadError> {
    let nested = args.arg(index)?.map_type.contains(MapType::NESTED);
    Ok(!nested && args.heads_struct(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{BulkTransfer, ImmediateTransfer};
    use offload_device::HostPlugin;
    use std::sync::Arc;

    struct Fixture {
        plugin: Arc<HostPlugin>,
        device: Device,
        config: RuntimeConfig,
        metrics: Mutex<OffloadMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            let plugin = Arc::new(HostPlugin::new(1));
            Self {
                device: Device::new(0, plugin.clone(), 0),
                plugin,
                config: RuntimeConfig::default(),
                metrics: Mutex::new(OffloadMetrics::new()),
            }
        }

        fn ctx<'a>(&'a self, strategy: &'a dyn TransferStrategy) -> RegionContext<'a> {
            RegionContext {
                device: &self.device,
                strategy,
                config: &self.config,
                metrics: &self.metrics,
            }
        }
    }

    #[test]
    fn test_refcount_without_transfers() {
        let f = Fixture::new();
        let s = ImmediateTransfer::new();
        let ctx = f.ctx(&s);
        let mut args = ArgList::from_args(vec![MapArg::new(0x1000, 0x1000, 0x10, MapType::empty())]);

        unsafe {
            ctx.data_begin(&mut args).unwrap();
            ctx.data_begin(&mut args).unwrap();
            assert_eq!(f.device.map_entry_ref_count(0x1000).unwrap().get(), 2);
            ctx.data_end(&args).unwrap();
            assert_eq!(f.device.mapping_count(), 1);
            ctx.data_end(&args).unwrap();
        }
        assert_eq!(f.device.mapping_count(), 0);
        assert_eq!(f.plugin.live_allocations(0), 0);
    }

    #[test]
    fn test_to_from_roundtrip() {
        let f = Fixture::new();
        let s = ImmediateTransfer::new();
        let ctx = f.ctx(&s);
        let mut data = [5u8; 32];
        let addr = data.as_mut_ptr() as usize;
        let mut args = ArgList::from_args(vec![MapArg::new(
            addr,
            addr,
            32,
            MapType::TO | MapType::FROM,
        )]);

        unsafe { ctx.data_begin(&mut args).unwrap() };
        let tgt = f.device.lookup_tgt_ptr(addr, 32).unwrap();
        assert_eq!(f.plugin.read_device(0, tgt, 32).unwrap(), vec![5; 32]);
        f.device.data_submit(tgt, &[6; 32]).unwrap();
        unsafe { ctx.data_end(&args).unwrap() };
        assert_eq!(data, [6; 32]);
    }

    #[test]
    fn test_end_of_unmapped_section_fails() {
        let f = Fixture::new();
        let s = ImmediateTransfer::new();
        let args = ArgList::from_args(vec![MapArg::new(0x1000, 0x1000, 8, MapType::FROM)]);
        let err = unsafe { f.ctx(&s).data_end(&args) }.unwrap_err();
        assert!(matches!(err, OffloadError::UnmappedAddress { begin: 0x1000, .. }));

        let empty = ArgList::from_args(vec![MapArg::new(0x1000, 0x1000, 0, MapType::FROM)]);
        unsafe { f.ctx(&s).data_end(&empty).unwrap() };
    }

    #[test]
    fn test_combined_entry_is_padded() {
        let f = Fixture::new();
        let s = ImmediateTransfer::new();
        let args_vec = vec![
            MapArg::new(0x1000, 0x1004, 12, MapType::TARGET_PARAM),
            MapArg::new(0x1000, 0x1004, 4, MapType::empty().with_member_of(0)),
        ];
        let mut args = ArgList::from_args(args_vec);
        unsafe { f.ctx(&s).data_begin(&mut args).unwrap() };
        let entries = f.device.snapshot_mappings();
        assert_eq!(entries.len(), 1);
        assert_eq!((entries[0].host_begin, entries[0].host_end), (0x1000, 0x1010));
        unsafe { f.ctx(&s).data_end(&args).unwrap() };
        assert_eq!(f.device.mapping_count(), 0);
    }

    #[test]
    fn test_return_param_writes_device_base() {
        let f = Fixture::new();
        let s = BulkTransfer::new();
        let mut args = ArgList::from_args(vec![MapArg::new(
            0x2000,
            0x2010,
            16,
            MapType::RETURN_PARAM,
        )]);
        unsafe { f.ctx(&s).data_begin(&mut args).unwrap() };
        let tgt = f.device.lookup_tgt_ptr(0x2010, 16).unwrap();
        assert_eq!(args.arg(0).unwrap().base, tgt - 0x10);
    }

    #[test]
    fn test_update_skips_unmapped() {
        let f = Fixture::new();
        let s = ImmediateTransfer::new();
        let args = ArgList::from_args(vec![MapArg::new(0x1000, 0x1000, 8, MapType::TO)]);
        assert_eq!(unsafe { f.ctx(&s).data_update(&args) }.unwrap(), 0);
        assert_eq!(f.device.transfer_stats().h2d_transfers, 0);
    }

    #[test]
    fn test_failed_bulk_begin_stages_nothing_for_later_regions() {
        let f = Fixture::new();
        let s = BulkTransfer::new();
        let mut data = [1u8; 32];
        let mut other = [2u8; 8];
        let a = data.as_mut_ptr() as usize;
        let b = other.as_mut_ptr() as usize;

        let mut overlapping = ArgList::from_args(vec![
            MapArg::new(a, a, 16, MapType::TO | MapType::FROM),
            MapArg::new(a + 8, a + 8, 16, MapType::TO),
        ]);
        let err = unsafe { f.ctx(&s).data_begin(&mut overlapping) }.unwrap_err();
        assert!(matches!(err, OffloadError::OverlapViolation { .. }));

        // The first section stays mapped; its device copy is now owned by
        // whoever writes it next.
        let tgt_a = f.device.lookup_tgt_ptr(a, 16).unwrap();
        f.device.data_submit(tgt_a, &[9; 16]).unwrap();

        let mut unrelated = ArgList::from_args(vec![MapArg::new(b, b, 8, MapType::TO)]);
        unsafe { f.ctx(&s).data_begin(&mut unrelated).unwrap() };

        assert_eq!(f.plugin.read_device(0, tgt_a, 16).unwrap(), vec![9; 16]);
        let tgt_b = f.device.lookup_tgt_ptr(b, 8).unwrap();
        assert_eq!(f.plugin.read_device(0, tgt_b, 8).unwrap(), vec![2; 8]);
        assert_eq!(f.device.transfer_stats().batched_submissions, 1);
    }
}
