// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! An in-process plugin backed by host memory.
//!
//! [`HostPlugin`] emulates one or more accelerators. Each device owns a
//! separate synthetic address space; allocations are zero-filled host
//! buffers at addresses that never coincide with real host pointers, so a
//! missing translation shows up as an error instead of silently reading
//! host data.
//!
//! Kernels are Rust closures registered by name. Loading an image resolves
//! function entries to kernel handles and allocates storage for globals.
//!
//! ```text
//!  device 0: 0xd000_0000_0000 ┬─ block ─┬─ block ─┬ ...
//!  device 1: 0xd100_0000_0000 ┴─ block ─┴─────────┴ ...
//! ```

use crate::{AddressTable, DevicePlugin, PluginError, Segment, TransferChunk};
use offload_abi::{DeviceImage, OffloadEntry, TargetTable};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const DEVICE_BASE: usize = 0xd000_0000_0000;
const DEVICE_STRIDE: usize = 0x0100_0000_0000;
const KERNEL_BASE: usize = 0xc000_0000_0000;
const BLOCK_ALIGN: usize = 64;

/// A kernel body. Receives the launch context and reports failure as a string.
pub type Kernel = Arc<dyn Fn(&mut KernelContext<'_>) -> Result<(), String> + Send + Sync>;

// ── Device memory ──────────────────────────────────────────────

#[derive(Debug)]
struct DeviceMemory {
    next: usize,
    capacity: usize,
    used: usize,
    blocks: BTreeMap<usize, Vec<u8>>,
}

impl DeviceMemory {
    fn new(base: usize, capacity: usize) -> Self {
        Self {
            next: base,
            capacity,
            used: 0,
            blocks: BTreeMap::new(),
        }
    }

    fn alloc(&mut self, size: usize) -> Option<usize> {
        let size = size.max(1);
        if self.used + size > self.capacity {
            return None;
        }
        let addr = self.next;
        // One alignment unit of gap keeps separate blocks non-contiguous.
        self.next += size.div_ceil(BLOCK_ALIGN) * BLOCK_ALIGN + BLOCK_ALIGN;
        self.used += size;
        self.blocks.insert(addr, vec![0; size]);
        Some(addr)
    }

    fn free(&mut self, addr: usize) -> bool {
        match self.blocks.remove(&addr) {
            Some(block) => {
                self.used -= block.len();
                true
            }
            None => false,
        }
    }

    fn locate(&self, addr: usize, len: usize) -> Result<(usize, usize), String> {
        let (&start, block) = self
            .blocks
            .range(..=addr)
            .next_back()
            .ok_or_else(|| format!("device address {addr:#x} is not allocated"))?;
        let offset = addr - start;
        if offset + len > block.len() {
            return Err(format!(
                "access [{addr:#x}, +{len}) runs past the block at {start:#x} ({} bytes)",
                block.len()
            ));
        }
        Ok((start, offset))
    }

    fn read(&self, addr: usize, len: usize) -> Result<&[u8], String> {
        if len == 0 {
            return Ok(&[]);
        }
        let (start, offset) = self.locate(addr, len)?;
        Ok(&self.blocks[&start][offset..offset + len])
    }

    fn write(&mut self, addr: usize, bytes: &[u8]) -> Result<(), String> {
        if bytes.is_empty() {
            return Ok(());
        }
        let (start, offset) = self.locate(addr, bytes.len())?;
        let block = self
            .blocks
            .get_mut(&start)
            .ok_or_else(|| format!("block {start:#x} vanished"))?;
        block[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

// ── Kernel context ─────────────────────────────────────────────

/// What a kernel sees while it runs: its arguments and device memory.
pub struct KernelContext<'a> {
    memory: &'a mut DeviceMemory,
    args: Vec<usize>,
    /// Teams requested (1 for single-team regions).
    pub num_teams: i32,
    pub thread_limit: i32,
    /// Trip count pushed for this launch (0 if none).
    pub loop_trip_count: u64,
}

impl KernelContext<'_> {
    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Kernel argument `index` (already offset-adjusted).
    pub fn arg(&self, index: usize) -> Result<usize, String> {
        self.args
            .get(index)
            .copied()
            .ok_or_else(|| format!("kernel argument {index} missing ({} passed)", self.args.len()))
    }

    pub fn args(&self) -> &[usize] {
        &self.args
    }

    pub fn read_bytes(&self, addr: usize, len: usize) -> Result<Vec<u8>, String> {
        self.memory.read(addr, len).map(<[u8]>::to_vec)
    }

    pub fn write_bytes(&mut self, addr: usize, bytes: &[u8]) -> Result<(), String> {
        self.memory.write(addr, bytes)
    }

    pub fn read_u64(&self, addr: usize) -> Result<u64, String> {
        let bytes = self.memory.read(addr, 8)?;
        Ok(u64::from_ne_bytes(bytes.try_into().map_err(|_| "short read")?))
    }

    pub fn write_u64(&mut self, addr: usize, value: u64) -> Result<(), String> {
        self.memory.write(addr, &value.to_ne_bytes())
    }

    pub fn read_i64(&self, addr: usize) -> Result<i64, String> {
        self.read_u64(addr).map(|v| v as i64)
    }

    pub fn write_i64(&mut self, addr: usize, value: i64) -> Result<(), String> {
        self.write_u64(addr, value as u64)
    }

    /// Translates a host address through an uploaded address table, the
    /// way generated device code does when pointers were left unpatched.
    pub fn translate(&self, table_addr: usize, host_addr: usize) -> Result<usize, String> {
        let header = self.memory.read(table_addr, std::mem::size_of::<Segment>())?;
        let count = bytemuck::pod_read_unaligned::<Segment>(header).host_begin as usize;
        let bytes = self
            .memory
            .read(table_addr, (count + 1) * std::mem::size_of::<Segment>())?;
        AddressTable::from_device_bytes(bytes)?
            .translate(host_addr)
            .ok_or_else(|| format!("host address {host_addr:#x} not in address table"))
    }

    /// Translates a host address through an uploaded offset list: mask,
    /// shift, one offset load.
    pub fn translate_offset(&self, list_addr: usize, host_addr: usize) -> Result<usize, String> {
        let mask = self.read_u64(list_addr)?;
        let shift = self.read_u64(list_addr + 8)?;
        let windows = self.read_u64(list_addr + 16)?;
        let window = (host_addr as u64 & mask)
            .checked_shr(u32::try_from(shift).map_err(|_| format!("bad shift {shift}"))?)
            .unwrap_or(0);
        if window >= windows {
            return Err(format!("host address {host_addr:#x} falls outside the offset list"));
        }
        let offset = self.read_i64(list_addr + 24 + window as usize * 8)?;
        Ok((host_addr as i64).wrapping_add(offset) as usize)
    }
}

// ── Plugin ─────────────────────────────────────────────────────

/// In-process plugin emulating `num_devices` accelerators.
///
/// # Example
/// ```
/// use offload_device::{DevicePlugin, HostPlugin};
///
/// let plugin = HostPlugin::new(1);
/// let tgt = plugin.data_alloc(0, 16, 0).unwrap();
/// plugin.data_submit(0, tgt, &[7u8; 16]).unwrap();
/// let mut back = [0u8; 16];
/// plugin.data_retrieve(0, &mut back, tgt).unwrap();
/// assert_eq!(back, [7u8; 16]);
/// ```
pub struct HostPlugin {
    devices: Vec<Mutex<DeviceMemory>>,
    initialised: Vec<AtomicBool>,
    kernels: RwLock<Vec<(String, Kernel)>>,
    launches: AtomicU64,
    batches: AtomicU64,
}

impl HostPlugin {
    /// Creates a plugin with effectively unbounded device memory.
    pub fn new(num_devices: usize) -> Self {
        Self::with_capacity(num_devices, usize::MAX / 4)
    }

    /// Creates a plugin whose devices each hold at most `capacity` bytes.
    pub fn with_capacity(num_devices: usize, capacity: usize) -> Self {
        Self {
            devices: (0..num_devices)
                .map(|d| Mutex::new(DeviceMemory::new(DEVICE_BASE + d * DEVICE_STRIDE, capacity)))
                .collect(),
            initialised: (0..num_devices).map(|_| AtomicBool::new(false)).collect(),
            kernels: RwLock::new(Vec::new()),
            launches: AtomicU64::new(0),
            batches: AtomicU64::new(0),
        }
    }

    /// Registers a kernel body under `name`, returning its device handle.
    pub fn register_kernel<F>(&self, name: impl Into<String>, body: F) -> usize
    where
        F: Fn(&mut KernelContext<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        let mut kernels = self.kernels.write();
        kernels.push((name.into(), Arc::new(body)));
        KERNEL_BASE + kernels.len() - 1
    }

    /// Builds the image describing `host_entries` for this plugin.
    pub fn image_for(host_entries: &[OffloadEntry]) -> DeviceImage {
        DeviceImage {
            entries: host_entries
                .iter()
                .map(|e| OffloadEntry {
                    name: e.name.clone(),
                    addr: 0,
                    size: e.size,
                })
                .collect(),
        }
    }

    /// Reads device memory directly (for inspection in tests and tools).
    pub fn read_device(&self, device: i32, tgt: usize, len: usize) -> Result<Vec<u8>, PluginError> {
        let mem = self.memory(device)?.lock();
        mem.read(tgt, len).map(<[u8]>::to_vec).map_err(PluginError)
    }

    /// Live allocations on `device`.
    pub fn live_allocations(&self, device: i32) -> usize {
        self.memory(device).map(|m| m.lock().blocks.len()).unwrap_or(0)
    }

    /// Bytes currently allocated on `device`.
    pub fn used_bytes(&self, device: i32) -> usize {
        self.memory(device).map(|m| m.lock().used).unwrap_or(0)
    }

    pub fn is_initialised(&self, device: i32) -> bool {
        usize::try_from(device)
            .ok()
            .and_then(|d| self.initialised.get(d))
            .is_some_and(|f| f.load(Ordering::Acquire))
    }

    /// Kernel launches served so far.
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    /// Batched submissions served so far.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    fn memory(&self, device: i32) -> Result<&Mutex<DeviceMemory>, PluginError> {
        usize::try_from(device)
            .ok()
            .and_then(|d| self.devices.get(d))
            .ok_or_else(|| PluginError(format!("no such device {device}")))
    }

    fn kernel(&self, entry: usize) -> Result<Kernel, PluginError> {
        let kernels = self.kernels.read();
        entry
            .checked_sub(KERNEL_BASE)
            .and_then(|i| kernels.get(i))
            .map(|(_, k)| Arc::clone(k))
            .ok_or_else(|| PluginError(format!("no kernel at {entry:#x}")))
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        device: i32,
        entry: usize,
        args: &[usize],
        offsets: &[isize],
        num_teams: i32,
        thread_limit: i32,
        loop_trip_count: u64,
    ) -> Result<(), PluginError> {
        if args.len() != offsets.len() {
            return Err(PluginError(format!(
                "{} arguments but {} offsets",
                args.len(),
                offsets.len()
            )));
        }
        let kernel = self.kernel(entry)?;
        let mut mem = self.memory(device)?.lock();
        let mut ctx = KernelContext {
            memory: &mut *mem,
            args: args
                .iter()
                .zip(offsets)
                .map(|(&a, &o)| a.wrapping_add_signed(o))
                .collect(),
            num_teams,
            thread_limit,
            loop_trip_count,
        };
        self.launches.fetch_add(1, Ordering::Relaxed);
        (*kernel)(&mut ctx).map_err(PluginError)
    }
}

impl DevicePlugin for HostPlugin {
    fn name(&self) -> &str {
        "host"
    }

    fn number_of_devices(&self) -> usize {
        self.devices.len()
    }

    fn init_device(&self, device: i32) -> Result<(), PluginError> {
        self.memory(device)?;
        self.initialised[device as usize].store(true, Ordering::Release);
        tracing::debug!("host plugin: device {device} initialised");
        Ok(())
    }

    fn load_binary(&self, device: i32, image: &DeviceImage) -> Result<TargetTable, PluginError> {
        let mut entries = Vec::with_capacity(image.entries.len());
        for e in &image.entries {
            let addr = if e.is_global() {
                self.memory(device)?
                    .lock()
                    .alloc(e.size)
                    .ok_or_else(|| PluginError(format!("no room for global '{}'", e.name)))?
            } else {
                let kernels = self.kernels.read();
                let index = kernels
                    .iter()
                    .position(|(name, _)| *name == e.name)
                    .ok_or_else(|| PluginError(format!("kernel '{}' not registered", e.name)))?;
                KERNEL_BASE + index
            };
            entries.push(OffloadEntry {
                name: e.name.clone(),
                addr,
                size: e.size,
            });
        }
        Ok(TargetTable { entries })
    }

    fn data_alloc(&self, device: i32, size: usize, _host_hint: usize) -> Option<usize> {
        self.memory(device).ok()?.lock().alloc(size)
    }

    fn data_delete(&self, device: i32, tgt: usize) -> Result<(), PluginError> {
        if self.memory(device)?.lock().free(tgt) {
            Ok(())
        } else {
            Err(PluginError(format!("{tgt:#x} is not an allocation")))
        }
    }

    fn data_submit(&self, device: i32, tgt: usize, src: &[u8]) -> Result<(), PluginError> {
        self.memory(device)?.lock().write(tgt, src).map_err(PluginError)
    }

    fn data_retrieve(&self, device: i32, dst: &mut [u8], tgt: usize) -> Result<(), PluginError> {
        let mem = self.memory(device)?.lock();
        let src = mem.read(tgt, dst.len()).map_err(PluginError)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn data_submit_batch(&self, device: i32, chunks: &[TransferChunk<'_>]) -> Result<(), PluginError> {
        let mut mem = self.memory(device)?.lock();
        for chunk in chunks {
            mem.write(chunk.tgt, chunk.bytes).map_err(PluginError)?;
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn run_region(
        &self,
        device: i32,
        entry: usize,
        args: &[usize],
        offsets: &[isize],
    ) -> Result<(), PluginError> {
        self.launch(device, entry, args, offsets, 1, 1, 0)
    }

    fn run_team_region(
        &self,
        device: i32,
        entry: usize,
        args: &[usize],
        offsets: &[isize],
        num_teams: i32,
        thread_limit: i32,
        loop_trip_count: u64,
    ) -> Result<(), PluginError> {
        self.launch(device, entry, args, offsets, num_teams, thread_limit, loop_trip_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_accounting() {
        let p = HostPlugin::new(1);
        let a = p.data_alloc(0, 100, 0).unwrap();
        let b = p.data_alloc(0, 28, 0).unwrap();
        assert!(b > a + 100, "blocks are separated");
        assert_eq!(p.live_allocations(0), 2);
        assert_eq!(p.used_bytes(0), 128);
        p.data_delete(0, a).unwrap();
        assert_eq!(p.used_bytes(0), 28);
        assert!(p.data_delete(0, a).is_err());
    }

    #[test]
    fn test_capacity_limit() {
        let p = HostPlugin::with_capacity(1, 64);
        assert!(p.data_alloc(0, 48, 0).is_some());
        assert!(p.data_alloc(0, 32, 0).is_none());
    }

    #[test]
    fn test_out_of_bounds_access() {
        let p = HostPlugin::new(1);
        let a = p.data_alloc(0, 8, 0).unwrap();
        assert!(p.data_submit(0, a + 4, &[0u8; 8]).is_err());
        assert!(p.data_submit(0, 0x1000, &[0u8; 1]).is_err());
    }

    #[test]
    fn test_devices_are_separate() {
        let p = HostPlugin::new(2);
        let a = p.data_alloc(0, 8, 0).unwrap();
        let b = p.data_alloc(1, 8, 0).unwrap();
        assert_ne!(a, b);
        assert!(p.read_device(1, a, 8).is_err());
        assert!(p.data_alloc(2, 8, 0).is_none());
    }

    #[test]
    fn test_kernel_sees_offset_arguments() {
        let p = HostPlugin::new(1);
        let buf = p.data_alloc(0, 16, 0).unwrap();
        let handle = p.register_kernel("store", |ctx| {
            let addr = ctx.arg(0)?;
            ctx.write_u64(addr, 42)
        });
        // Argument points 8 bytes before the buffer; the offset moves it back in.
        p.run_region(0, handle, &[buf - 8], &[8]).unwrap();
        let bytes = p.read_device(0, buf, 8).unwrap();
        assert_eq!(u64::from_ne_bytes(bytes.try_into().unwrap()), 42);
        assert_eq!(p.launches(), 1);
    }

    #[test]
    fn test_kernel_failure_is_reported() {
        let p = HostPlugin::new(1);
        let handle = p.register_kernel("boom", |_| Err("boom".into()));
        let err = p.run_team_region(0, handle, &[], &[], 4, 64, 0).unwrap_err();
        assert_eq!(err, PluginError::new("boom"));
        assert!(p.run_region(0, handle + 1, &[], &[]).is_err());
    }

    #[test]
    fn test_load_binary_resolves_kernels_and_globals() {
        let p = HostPlugin::new(1);
        let handle = p.register_kernel("k", |_| Ok(()));
        let host = vec![OffloadEntry::function("k", 0x10), OffloadEntry::global("g", 0x20, 16)];
        let table = p.load_binary(0, &HostPlugin::image_for(&host)).unwrap();
        assert_eq!(table.entries[0].addr, handle);
        assert_eq!(table.entries[1].size, 16);
        assert_eq!(p.read_device(0, table.entries[1].addr, 16).unwrap(), vec![0; 16]);

        let missing = vec![OffloadEntry::function("nope", 0x30)];
        assert!(p.load_binary(0, &HostPlugin::image_for(&missing)).is_err());
    }

    #[test]
    fn test_batch_counts_once() {
        let p = HostPlugin::new(1);
        let a = p.data_alloc(0, 16, 0).unwrap();
        let chunks = [
            TransferChunk { tgt: a, bytes: &[1u8; 8] },
            TransferChunk { tgt: a + 8, bytes: &[2u8; 8] },
        ];
        p.data_submit_batch(0, &chunks).unwrap();
        assert_eq!(p.batches(), 1);
        let bytes = p.read_device(0, a, 16).unwrap();
        assert_eq!(&bytes[..8], &[1u8; 8]);
        assert_eq!(&bytes[8..], &[2u8; 8]);
    }
}
