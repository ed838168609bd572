// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The public offload entry points.
//!
//! [`OffloadRuntime`] ties a [`DeviceRegistry`], a transfer strategy and the
//! runtime configuration together. Every entry point first makes sure the
//! device is initialised and that registered libraries are loaded on it,
//! running their constructors the first time.
//!
//! # Example
//! ```
//! use offload_abi::{ArgList, MapArg, MapType};
//! use offload_device::HostPlugin;
//! use offload_runtime::{OffloadRuntime, RuntimeConfig};
//! use std::sync::Arc;
//!
//! let runtime = OffloadRuntime::with_plugin(RuntimeConfig::default(), Arc::new(HostPlugin::new(1))).unwrap();
//! let mut data = [1u32, 2, 3, 4];
//! let addr = data.as_mut_ptr() as usize;
//! let mut args = ArgList::from_args(vec![MapArg::new(addr, addr, 16, MapType::TO | MapType::FROM)]);
//!
//! unsafe {
//!     runtime.target_data_begin(-1, &mut args).unwrap();
//!     runtime.target_data_end(-1, &mut args).unwrap();
//! }
//! assert_eq!(data, [1, 2, 3, 4]);
//! ```

use crate::launch::RegionLaunch;
use crate::metrics::{OffloadMetrics, Phase};
use crate::region::RegionContext;
use crate::registry::{DeviceRegistry, LibraryId};
use crate::strategy::TransferStrategy;
use crate::{OffloadError, RuntimeConfig};
use offload_abi::{ArgList, BinaryDescriptor};
use offload_device::{Device, DevicePlugin, LaunchKind};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Device id selecting the configured default device.
pub const DEFAULT_DEVICE: i64 = -1;

/// Offload runtime over a set of devices.
pub struct OffloadRuntime {
    config: RuntimeConfig,
    registry: DeviceRegistry,
    strategy: Box<dyn TransferStrategy>,
    metrics: Mutex<OffloadMetrics>,
}

impl OffloadRuntime {
    /// Creates a runtime, validating `config` and building its strategy.
    pub fn new(config: RuntimeConfig, registry: DeviceRegistry) -> Result<Self, OffloadError> {
        config.validate()?;
        let strategy = config.create_strategy()?;
        tracing::info!(
            "offload runtime: {} devices, {} transfers, address table {}, offset list {}",
            registry.num_devices(),
            strategy.name(),
            if config.address_table { "on" } else { "off" },
            if config.address_offset.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            config,
            registry,
            strategy,
            metrics: Mutex::new(OffloadMetrics::new()),
        })
    }

    pub fn with_plugin(config: RuntimeConfig, plugin: Arc<dyn DevicePlugin>) -> Result<Self, OffloadError> {
        Self::new(config, DeviceRegistry::with_plugin(plugin))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Snapshot of the accumulated metrics.
    pub fn metrics(&self) -> OffloadMetrics {
        self.metrics.lock().clone()
    }

    /// Metrics snapshot as pretty-printed JSON.
    pub fn metrics_json(&self) -> Result<String, OffloadError> {
        serde_json::to_string_pretty(&self.metrics())
            .map_err(|e| OffloadError::ConfigError(format!("metrics serialisation failed: {e}")))
    }

    /// The device for `device_id`; [`DEFAULT_DEVICE`] picks the configured
    /// default.
    pub fn device(&self, device_id: i64) -> Result<&Device, OffloadError> {
        let id = if device_id == DEFAULT_DEVICE {
            self.config.default_device
        } else {
            usize::try_from(device_id).map_err(|_| OffloadError::DeviceNotReady {
                device: self.config.default_device,
                detail: format!("invalid device id {device_id}"),
            })?
        };
        self.registry.device(id)
    }

    // ── Libraries ──────────────────────────────────────────────

    pub fn register_library(&self, desc: &BinaryDescriptor) -> LibraryId {
        self.registry.register_library(desc)
    }

    pub fn unregister_library(&self, id: LibraryId) -> bool {
        self.registry.unregister_library(id)
    }

    // ── User mappings ──────────────────────────────────────────

    /// Maps `[host_begin, host_begin + size)` onto user-owned device memory
    /// at `tgt_begin`. The mapping is never evicted.
    pub fn associate_ptr(
        &self,
        device_id: i64,
        host_begin: usize,
        tgt_begin: usize,
        size: usize,
    ) -> Result<(), OffloadError> {
        let device = self.ready_device(device_id)?;
        Ok(device.associate_ptr(host_begin, tgt_begin, size)?)
    }

    pub fn disassociate_ptr(&self, device_id: i64, host_begin: usize) -> Result<(), OffloadError> {
        let device = self.ready_device(device_id)?;
        Ok(device.disassociate_ptr(host_begin)?)
    }

    /// Sets the loop trip count for the next team launch on the device.
    pub fn push_target_trip_count(&self, device_id: i64, count: u64) -> Result<(), OffloadError> {
        self.device(device_id)?.push_loop_trip_count(count);
        Ok(())
    }

    // ── Regions ────────────────────────────────────────────────

    /// Maps `args` onto the device, copying `TO` sections in.
    ///
    /// # Safety
    /// Every host section in `args` must be valid for reads for its size,
    /// and every pointer-and-object slot must hold a pointer.
    pub unsafe fn target_data_begin(&self, device_id: i64, args: &mut ArgList) -> Result<(), OffloadError> {
        let device = self.ready_device(device_id)?;
        let start = Instant::now();
        self.context(device).data_begin(args)?;
        self.record(Phase::DataBegin, start);
        Ok(())
    }

    /// Releases `args`, copying `FROM` sections back.
    ///
    /// # Safety
    /// Every host section in `args` with `FROM` set, and every pointer slot
    /// patched at begin, must be valid for writes.
    pub unsafe fn target_data_end(&self, device_id: i64, args: &mut ArgList) -> Result<(), OffloadError> {
        let device = self.ready_device(device_id)?;
        let start = Instant::now();
        self.context(device).data_end(args)?;
        self.record(Phase::DataEnd, start);
        Ok(())
    }

    /// Refreshes already-mapped sections in either direction. Returns the
    /// number of sections moved.
    ///
    /// # Safety
    /// `TO` sections must be valid for reads and `FROM` sections for writes.
    pub unsafe fn target_data_update(&self, device_id: i64, args: &mut ArgList) -> Result<usize, OffloadError> {
        let device = self.ready_device(device_id)?;
        let start = Instant::now();
        let moved = self.context(device).data_update(args)?;
        self.record(Phase::DataUpdate, start);
        Ok(moved)
    }

    /// Runs the kernel registered for `host_ptr` with `args`: maps them,
    /// launches, then releases them.
    ///
    /// # Safety
    /// The requirements of both [`target_data_begin`](Self::target_data_begin)
    /// and [`target_data_end`](Self::target_data_end) apply, and private
    /// arguments with `TO` set must be valid for reads.
    pub unsafe fn target(
        &self,
        device_id: i64,
        host_ptr: usize,
        args: &mut ArgList,
        kind: LaunchKind,
    ) -> Result<(), OffloadError> {
        let device = self.ready_device(device_id)?;
        let start = Instant::now();
        self.run_region(device, host_ptr, args, kind)?;
        self.record(Phase::Target, start);
        Ok(())
    }

    // ── Internals ──────────────────────────────────────────────

    fn context<'a>(&'a self, device: &'a Device) -> RegionContext<'a> {
        RegionContext {
            device,
            strategy: self.strategy.as_ref(),
            config: &self.config,
            metrics: &self.metrics,
        }
    }

    /// Resolves the device and loads pending libraries on it.
    fn ready_device(&self, device_id: i64) -> Result<&Device, OffloadError> {
        let device = self.device(device_id)?;
        self.registry.check_device_and_ctors(device, |ctor| {
            let mut no_args = ArgList::default();
            // SAFETY: an empty argument list touches no host memory.
            unsafe { self.run_region(device, ctor, &mut no_args, LaunchKind::Single) }
        })?;
        Ok(device)
    }

    unsafe fn run_region(
        &self,
        device: &Device,
        host_ptr: usize,
        args: &mut ArgList,
        kind: LaunchKind,
    ) -> Result<(), OffloadError> {
        let entry = self.registry.resolve_entry(device.id(), host_ptr)?;
        tracing::debug!(
            "device {}: target {host_ptr:#x} -> entry {entry:#x} with {} args",
            device.id(),
            args.len()
        );
        RegionLaunch::new(self.context(device), entry, args)
            .map()?
            .stage()?
            .launch(kind)?
            .finish()
    }

    fn record(&self, phase: Phase, start: Instant) {
        if self.config.enable_profiling {
            self.metrics.lock().record_since(phase, start);
        }
    }
}

impl std::fmt::Debug for OffloadRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadRuntime")
            .field("strategy", &self.strategy.name())
            .field("address_table", &self.config.address_table)
            .field("registry", &self.registry)
            .finish()
    }
}
