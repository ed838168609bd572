// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! One target region launch with a type-state–enforced pipeline.
//!
//! ```text
//! RegionLaunch<Idle>
//!     │  .map()       data-begin, strategy flush
//!     ▼
//! RegionLaunch<Mapped>
//!     │  .stage()     translation uploads, kernel arguments
//!     ▼
//! RegionLaunch<Staged>
//!     │  .launch()    kernel run, scratch buffers freed
//!     ▼
//! RegionLaunch<Launched>
//!     │  .finish()    data-end
//!     ▼
//!    ()
//! ```
//!
//! Each state transition consumes the old value and returns a new one,
//! making invalid state sequences a compile error. A failure at any step
//! aborts the region without undoing earlier steps; only scratch buffers
//! are reclaimed, by [`ScratchAllocations`] on drop.

use crate::host::host_bytes;
use crate::metrics::Phase;
use crate::region::RegionContext;
use crate::OffloadError;
use offload_abi::{AbiError, ArgKind, ArgList, MapArg, MapType, PTR_SIZE};
use offload_device::{Device, LaunchKind};
use std::marker::PhantomData;
use std::time::Instant;

// ── Type-state markers ─────────────────────────────────────────

/// Nothing mapped yet.
#[derive(Debug)]
pub struct Idle;

/// Arguments mapped and flushed to the device.
#[derive(Debug)]
pub struct Mapped;

/// Kernel arguments built.
#[derive(Debug)]
pub struct Staged;

/// Kernel has run.
#[derive(Debug)]
pub struct Launched;

/// Sealed trait for launch states.
pub trait LaunchState: std::fmt::Debug {}
impl LaunchState for Idle {}
impl LaunchState for Mapped {}
impl LaunchState for Staged {}
impl LaunchState for Launched {}

// ── Scratch allocations ────────────────────────────────────────

/// Device buffers that live for one launch: private copies, the address
/// table and the offset list. Freed by [`release`](Self::release), or on drop if the launch
/// aborted first.
pub(crate) struct ScratchAllocations<'a> {
    device: &'a Device,
    allocations: Vec<usize>,
}

impl<'a> ScratchAllocations<'a> {
    pub fn new(device: &'a Device) -> Self {
        Self {
            device,
            allocations: Vec::new(),
        }
    }

    /// Allocates `size` bytes and tracks them.
    pub fn alloc(&mut self, size: usize, host_hint: usize) -> Result<usize, OffloadError> {
        let tgt = self.device.alloc_scratch(size, host_hint)?;
        self.allocations.push(tgt);
        Ok(tgt)
    }

    /// Tracks a buffer allocated elsewhere.
    pub fn adopt(&mut self, tgt: usize) {
        self.allocations.push(tgt);
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Frees every tracked buffer. All buffers are attempted; the first
    /// failure is returned.
    pub fn release(mut self) -> Result<(), OffloadError> {
        let mut first_err = None;
        for tgt in self.allocations.drain(..) {
            if let Err(e) = self.device.free_scratch(tgt) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), |e| Err(e.into()))
    }
}

impl Drop for ScratchAllocations<'_> {
    fn drop(&mut self) {
        for tgt in self.allocations.drain(..) {
            if let Err(e) = self.device.free_scratch(tgt) {
                tracing::warn!("device {}: scratch buffer {tgt:#x} leaked: {e}", self.device.id());
            }
        }
    }
}

// ── Launch ─────────────────────────────────────────────────────

/// One activation of a target region.
pub(crate) struct RegionLaunch<'a, S: LaunchState = Idle> {
    ctx: RegionContext<'a>,
    entry: usize,
    args: &'a mut ArgList,
    scratch: ScratchAllocations<'a>,
    kernel_args: Vec<usize>,
    offsets: Vec<isize>,
    table_segments: usize,
    _state: PhantomData<S>,
}

impl<'a, S: LaunchState> RegionLaunch<'a, S> {
    fn into_state<T: LaunchState>(self) -> RegionLaunch<'a, T> {
        RegionLaunch {
            ctx: self.ctx,
            entry: self.entry,
            args: self.args,
            scratch: self.scratch,
            kernel_args: self.kernel_args,
            offsets: self.offsets,
            table_segments: self.table_segments,
            _state: PhantomData,
        }
    }
}

impl<'a> RegionLaunch<'a, Idle> {
    pub(crate) fn new(ctx: RegionContext<'a>, entry: usize, args: &'a mut ArgList) -> Self {
        let scratch = ScratchAllocations::new(ctx.device);
        Self {
            ctx,
            entry,
            args,
            scratch,
            kernel_args: Vec::new(),
            offsets: Vec::new(),
            table_segments: 0,
            _state: PhantomData,
        }
    }

    /// Runs data-begin for the region's arguments.
    ///
    /// # Safety
    /// See [`RegionContext::data_begin`].
    pub(crate) unsafe fn map(self) -> Result<RegionLaunch<'a, Mapped>, OffloadError> {
        self.ctx.data_begin(self.args)?;
        Ok(self.into_state())
    }
}

impl<'a> RegionLaunch<'a, Mapped> {
    /// Uploads the address table and offset list if enabled and builds the
    /// kernel argument and offset vectors. Translation arguments follow the
    /// region's own: table pointer, segment count, optional mask literal,
    /// then the offset list pointer.
    ///
    /// # Safety
    /// First-private sections must be readable.
    pub(crate) unsafe fn stage(mut self) -> Result<RegionLaunch<'a, Staged>, OffloadError> {
        let device = self.ctx.device;
        let mut table = None;
        if self.ctx.config.address_table {
            let built = device.build_address_table();
            let uploaded = device.upload_address_table(&built)?;
            self.scratch.adopt(uploaded.tgt);
            table = Some(uploaded);
        }
        let mut offset_list = None;
        if let Some(w) = self.ctx.config.address_offset {
            let built = device.build_offset_list(w.mask, w.shift)?;
            let uploaded = device.upload_offset_list(&built)?;
            self.scratch.adopt(uploaded.tgt);
            offset_list = Some(uploaded);
        }

        let mut positions: Vec<Option<usize>> = vec![None; self.args.len()];
        for (index, arg) in self.args.iter().enumerate() {
            if !arg.map_type.contains(MapType::TARGET_PARAM) {
                if let ArgKind::LambdaCapture { parent } = arg.kind() {
                    self.patch_lambda_capture(index, arg, parent, &positions)?;
                }
                continue;
            }

            let (tgt, offset) = match arg.kind() {
                ArgKind::Literal => (arg.base, 0),
                ArgKind::Private { first_private } => {
                    let tgt = self.scratch.alloc(arg.size, arg.begin)?;
                    if first_private {
                        device.data_submit(tgt, host_bytes(arg.begin, arg.size))?;
                    }
                    (tgt, arg.base_offset())
                }
                ArgKind::PtrAndObj => (self.mapped(arg.base, PTR_SIZE)?, 0),
                ArgKind::Mapped | ArgKind::LambdaCapture { .. } => {
                    let tgt = match device.lookup_tgt_ptr(arg.begin, arg.size) {
                        Some(tgt) => tgt,
                        None if arg.size == 0 => 0,
                        None => self.mapped(arg.begin, arg.size)?,
                    };
                    (tgt, arg.base_offset())
                }
            };
            tracing::debug!(
                "device {}: kernel argument {} = {tgt:#x} {offset:+}",
                device.id(),
                self.kernel_args.len()
            );
            positions[index] = Some(self.kernel_args.len());
            self.kernel_args.push(tgt);
            self.offsets.push(offset);
        }

        if let Some(uploaded) = table {
            self.table_segments = uploaded.segments;
            self.kernel_args.push(uploaded.tgt);
            self.offsets.push(0);
            self.kernel_args.push(uploaded.segments);
            self.offsets.push(0);
            if let Some(mask) = self.ctx.config.address_mask {
                self.kernel_args.push(mask as usize);
                self.offsets.push(0);
            }
        }
        if let Some(uploaded) = offset_list {
            self.kernel_args.push(uploaded.tgt);
            self.offsets.push(0);
        }
        Ok(self.into_state())
    }

    /// Points a captured pointer inside a lambda object's device copy at
    /// the device copy of what it captured.
    fn patch_lambda_capture(
        &self,
        index: usize,
        arg: &MapArg,
        parent: Option<usize>,
        positions: &[Option<usize>],
    ) -> Result<(), OffloadError> {
        let invalid = |parent| OffloadError::InvalidArguments(AbiError::InvalidParent { index, parent });
        let parent = parent.ok_or_else(|| invalid(index))?;
        let position = positions
            .get(parent)
            .copied()
            .flatten()
            .ok_or_else(|| invalid(parent))?;
        let parent_arg = self.args.arg(parent)?;

        let tgt_base = self.kernel_args[position].wrapping_add_signed(self.offsets[position]);
        let tgt_slot = tgt_base.wrapping_add(arg.base.wrapping_sub(parent_arg.begin));
        let device = self.ctx.device;
        match device.lookup_tgt_ptr(arg.begin, arg.size) {
            Some(captured) => {
                tracing::debug!(
                    "device {}: lambda capture {captured:#x} written to {tgt_slot:#x}",
                    device.id()
                );
                device.data_submit(tgt_slot, &captured.to_ne_bytes())?;
            }
            None => {
                tracing::debug!("lambda capture {:#x} is not mapped, ignored", arg.begin);
            }
        }
        Ok(())
    }

    fn mapped(&self, begin: usize, size: usize) -> Result<usize, OffloadError> {
        self.ctx
            .device
            .lookup_tgt_ptr(begin, size)
            .ok_or(OffloadError::UnmappedAddress {
                device: self.ctx.device.id(),
                begin,
                size,
            })
    }
}

impl<'a> RegionLaunch<'a, Staged> {
    pub(crate) fn kernel_args(&self) -> (&[usize], &[isize]) {
        (&self.kernel_args, &self.offsets)
    }

    /// Runs the kernel, then frees the launch's scratch buffers.
    pub(crate) fn launch(mut self, kind: LaunchKind) -> Result<RegionLaunch<'a, Launched>, OffloadError> {
        let start = Instant::now();
        self.ctx
            .device
            .launch(self.entry, &self.kernel_args, &self.offsets, kind)?;
        if self.ctx.config.enable_profiling {
            self.ctx.metrics.lock().record_since(Phase::Kernel, start);
        }
        self.ctx.metrics.lock().record_launch(self.table_segments);

        let device = self.ctx.device;
        std::mem::replace(&mut self.scratch, ScratchAllocations::new(device)).release()?;
        Ok(self.into_state())
    }
}

impl RegionLaunch<'_, Launched> {
    /// Runs data-end for the region's arguments.
    ///
    /// # Safety
    /// See [`RegionContext::data_end`].
    pub(crate) unsafe fn finish(self) -> Result<(), OffloadError> {
        self.ctx.data_end(self.args)
    }
}

impl<S: LaunchState> std::fmt::Debug for RegionLaunch<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionLaunch")
            .field("state", &std::any::type_name::<S>())
            .field("device", &self.ctx.device.id())
            .field("entry", &format_args!("{:#x}", self.entry))
            .field("args", &self.args.len())
            .field("kernel_args", &self.kernel_args.len())
            .field("scratch", &self.scratch.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::OffloadMetrics;
    use crate::strategy::{ImmediateTransfer, TransferStrategy};
    use crate::RuntimeConfig;
    use offload_device::HostPlugin;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Fixture {
        plugin: Arc<HostPlugin>,
        device: Device,
        config: RuntimeConfig,
        metrics: Mutex<OffloadMetrics>,
        strategy: ImmediateTransfer,
    }

    impl Fixture {
        fn new(config: RuntimeConfig) -> Self {
            let plugin = Arc::new(HostPlugin::new(1));
            Self {
                device: Device::new(0, plugin.clone(), 0),
                plugin,
                config,
                metrics: Mutex::new(OffloadMetrics::new()),
                strategy: ImmediateTransfer::new(),
            }
        }

        fn ctx(&self) -> RegionContext<'_> {
            RegionContext {
                device: &self.device,
                strategy: &self.strategy as &dyn TransferStrategy,
                config: &self.config,
                metrics: &self.metrics,
            }
        }
    }

    #[test]
    fn test_scratch_freed_on_drop() {
        let f = Fixture::new(RuntimeConfig::default());
        {
            let mut scratch = ScratchAllocations::new(&f.device);
            scratch.alloc(64, 0).unwrap();
            scratch.alloc(8, 0).unwrap();
            assert_eq!(f.plugin.live_allocations(0), 2);
        }
        assert_eq!(f.plugin.live_allocations(0), 0);
    }

    #[test]
    fn test_scratch_release_reports_failure() {
        let f = Fixture::new(RuntimeConfig::default());
        let mut scratch = ScratchAllocations::new(&f.device);
        scratch.alloc(8, 0).unwrap();
        scratch.adopt(0x1234);
        assert!(scratch.release().is_err());
        assert_eq!(f.plugin.live_allocations(0), 0);
    }

    #[test]
    fn test_staged_arguments() {
        let f = Fixture::new(RuntimeConfig::default());
        let mut private = [3u8; 16];
        let p = private.as_mut_ptr() as usize;
        let mut args = ArgList::from_args(vec![
            MapArg::new(42, 42, 0, MapType::LITERAL | MapType::TARGET_PARAM),
            MapArg::new(0x1000, 0x1008, 8, MapType::TARGET_PARAM),
            MapArg::new(p, p, 16, MapType::PRIVATE | MapType::TO | MapType::TARGET_PARAM),
            MapArg::new(0x3000, 0x3000, 0, MapType::TARGET_PARAM),
        ]);

        let staged = unsafe {
            RegionLaunch::new(f.ctx(), 0, &mut args)
                .map()
                .unwrap()
                .stage()
                .unwrap()
        };
        let (kargs, offsets) = staged.kernel_args();
        assert_eq!(kargs.len(), 4);
        assert_eq!((kargs[0], offsets[0]), (42, 0));
        assert_eq!(kargs[1], f.device.lookup_tgt_ptr(0x1008, 8).unwrap());
        assert_eq!(offsets[1], -8);
        assert_eq!(f.plugin.read_device(0, kargs[2], 16).unwrap(), vec![3; 16]);
        assert_eq!((kargs[3], offsets[3]), (0, 0));

        drop(staged);
        // The private copy is gone, the mapping stays.
        assert_eq!(f.plugin.live_allocations(0), 1);
    }

    #[test]
    fn test_address_table_arguments_appended() {
        let f = Fixture::new(RuntimeConfig {
            address_table: true,
            address_mask: Some(0xfff),
            ..Default::default()
        });
        let mut args = ArgList::from_args(vec![MapArg::new(
            0x1000,
            0x1000,
            32,
            MapType::TARGET_PARAM,
        )]);
        let staged = unsafe {
            RegionLaunch::new(f.ctx(), 0, &mut args)
                .map()
                .unwrap()
                .stage()
                .unwrap()
        };
        let (kargs, _) = staged.kernel_args();
        assert_eq!(kargs.len(), 4);
        assert_eq!(kargs[2], 1);
        assert_eq!(kargs[3], 0xfff);
        let raw = f.plugin.read_device(0, kargs[1], 64).unwrap();
        let table = offload_device::AddressTable::from_device_bytes(&raw).unwrap();
        assert_eq!(table.translate(0x1010), Some(kargs[0] + 0x10));
    }

    #[test]
    fn test_offset_list_argument_appended_and_freed() {
        let f = Fixture::new(RuntimeConfig {
            address_offset: Some(crate::OffsetWindows {
                mask: 0xf000,
                shift: 12,
            }),
            ..Default::default()
        });
        let mut args = ArgList::from_args(vec![MapArg::new(
            0x1000,
            0x1000,
            32,
            MapType::TARGET_PARAM,
        )]);
        let staged = unsafe {
            RegionLaunch::new(f.ctx(), 0, &mut args)
                .map()
                .unwrap()
                .stage()
                .unwrap()
        };
        let (kargs, offsets) = staged.kernel_args();
        assert_eq!(kargs.len(), 2);
        assert_eq!(offsets[1], 0);
        let raw = f.plugin.read_device(0, kargs[1], (3 + 16) * 8).unwrap();
        let list = offload_device::OffsetList::from_device_bytes(&raw).unwrap();
        assert_eq!(list.translate(0x1010), kargs[0] + 0x10);
        assert_eq!(f.plugin.live_allocations(0), 2);

        drop(staged);
        assert_eq!(f.plugin.live_allocations(0), 1);
    }

    #[test]
    fn test_offset_conflict_fails_staging() {
        let f = Fixture::new(RuntimeConfig {
            address_offset: Some(crate::OffsetWindows {
                mask: 0xf000,
                shift: 12,
            }),
            ..Default::default()
        });
        let mut args = ArgList::from_args(vec![
            MapArg::new(0x1000, 0x1000, 16, MapType::TARGET_PARAM),
            MapArg::new(0x1800, 0x1800, 16, MapType::TARGET_PARAM),
        ]);
        let result = unsafe {
            RegionLaunch::new(f.ctx(), 0, &mut args)
                .map()
                .unwrap()
                .stage()
        };
        assert!(matches!(
            result,
            Err(OffloadError::TranslationConflict { device: 0, .. })
        ));
        assert_eq!(f.plugin.live_allocations(0), 2);
    }

    #[test]
    fn test_launch_failure_keeps_mappings() {
        let f = Fixture::new(RuntimeConfig::default());
        let bad = f.plugin.register_kernel("bad", |_| Err("boom".into()));
        let mut args = ArgList::from_args(vec![MapArg::new(0x1000, 0x1000, 8, MapType::TARGET_PARAM)]);
        let result = unsafe {
            RegionLaunch::new(f.ctx(), bad, &mut args)
                .map()
                .unwrap()
                .stage()
                .unwrap()
                .launch(LaunchKind::Single)
        };
        assert!(matches!(result, Err(OffloadError::LaunchFailure { .. })));
        assert_eq!(f.device.mapping_count(), 1);
        assert_eq!(f.plugin.live_allocations(0), 1);
    }
}
