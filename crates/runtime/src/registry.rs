// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Devices and registered libraries.
//!
//! [`DeviceRegistry`] owns one [`Device`] per accelerator exposed by the
//! plugins it was built from, the translation tables of every registered
//! library and a cache from host entry addresses to table slots.
//!
//! Lock order: a device's pending-globals lock, then the libraries lock;
//! the entry cache lock, then the libraries lock. Registration takes the
//! libraries lock alone and flags devices afterwards.

use crate::OffloadError;
use offload_abi::{BinaryDescriptor, TranslationTable};
use offload_device::{Device, DevicePlugin};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle of a registered library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LibraryId(u64);

#[derive(Debug)]
struct Library {
    id: LibraryId,
    table: TranslationTable,
    ctors: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
struct EntrySlot {
    library: LibraryId,
    index: usize,
}

/// All devices plus library bookkeeping.
pub struct DeviceRegistry {
    devices: Vec<Device>,
    libraries: Mutex<Vec<Library>>,
    entry_cache: Mutex<HashMap<usize, EntrySlot>>,
    next_library: AtomicU64,
}

impl DeviceRegistry {
    /// Creates one device per device each plugin exposes, numbered in
    /// plugin order.
    pub fn new(plugins: Vec<Arc<dyn DevicePlugin>>) -> Self {
        let mut devices = Vec::new();
        for plugin in plugins {
            for rtl_device in 0..plugin.number_of_devices() {
                let id = devices.len();
                tracing::debug!("device {id} is {} device {rtl_device}", plugin.name());
                devices.push(Device::new(id, Arc::clone(&plugin), rtl_device as i32));
            }
        }
        Self {
            devices,
            libraries: Mutex::new(Vec::new()),
            entry_cache: Mutex::new(HashMap::new()),
            next_library: AtomicU64::new(0),
        }
    }

    pub fn with_plugin(plugin: Arc<dyn DevicePlugin>) -> Self {
        Self::new(vec![plugin])
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, id: usize) -> Result<&Device, OffloadError> {
        self.devices.get(id).ok_or_else(|| OffloadError::DeviceNotReady {
            device: id,
            detail: format!("only {} devices available", self.devices.len()),
        })
    }

    // ── Libraries ──────────────────────────────────────────────

    /// Registers a library. Every device loads it lazily on its next use.
    pub fn register_library(&self, desc: &BinaryDescriptor) -> LibraryId {
        let id = LibraryId(self.next_library.fetch_add(1, Ordering::Relaxed));
        self.libraries.lock().push(Library {
            id,
            table: TranslationTable::new(desc, self.devices.len()),
            ctors: desc.ctors.clone(),
        });
        for device in &self.devices {
            *device.pending_globals() = true;
        }
        tracing::info!(
            "registered library {:?} with {} entries and {} constructors",
            id,
            desc.host_entries.len(),
            desc.ctors.len()
        );
        id
    }

    /// Forgets a library and its cached entries. Returns false if unknown.
    pub fn unregister_library(&self, id: LibraryId) -> bool {
        let removed = {
            let mut libraries = self.libraries.lock();
            let before = libraries.len();
            libraries.retain(|lib| lib.id != id);
            libraries.len() != before
        };
        if removed {
            self.entry_cache.lock().retain(|_, slot| slot.library != id);
            tracing::info!("unregistered library {id:?}");
        }
        removed
    }

    pub fn num_libraries(&self) -> usize {
        self.libraries.lock().len()
    }

    /// Initialises `device` and, if libraries were registered since its
    /// last use, loads them and runs their constructors through `run_ctor`.
    ///
    /// Loading maps every global variable of a freshly loaded image with
    /// an infinite count; globals that are already mapped are skipped.
    pub fn check_device_and_ctors<F>(&self, device: &Device, mut run_ctor: F) -> Result<(), OffloadError>
    where
        F: FnMut(usize) -> Result<(), OffloadError>,
    {
        device.initialize()?;
        let mut pending = device.pending_globals();
        if !*pending {
            return Ok(());
        }
        let ctors = self.load_libraries(device)?;
        for ctor in ctors {
            tracing::debug!("device {}: running constructor {ctor:#x}", device.id());
            run_ctor(ctor)?;
        }
        *pending = false;
        Ok(())
    }

    fn load_libraries(&self, device: &Device) -> Result<Vec<usize>, OffloadError> {
        let id = device.id();
        let not_ready = |detail: String| OffloadError::DeviceNotReady { device: id, detail };
        let mut libraries = self.libraries.lock();
        let mut ctors = Vec::new();

        for lib in libraries.iter_mut() {
            if lib.table.is_loaded(id) {
                continue;
            }
            let Some(image) = lib.table.images.get(id).and_then(Option::as_ref) else {
                continue;
            };
            let target = device
                .plugin()
                .load_binary(device.rtl_device(), image)
                .map_err(|e| not_ready(format!("loading image failed: {e}")))?;
            if target.entries.len() != lib.table.host_entries.len() {
                return Err(not_ready(format!(
                    "image has {} entries but the host table has {}",
                    target.entries.len(),
                    lib.table.host_entries.len()
                )));
            }

            let mut globals = 0;
            for (host, tgt) in lib.table.host_entries.iter().zip(&target.entries) {
                if host.is_global() && device.map_global(host.addr, tgt.addr, host.size)? {
                    globals += 1;
                }
            }
            tracing::info!(
                "device {id}: loaded library {:?} ({} entries, {globals} globals mapped)",
                lib.id,
                target.entries.len()
            );
            lib.table.targets[id] = Some(target);
            ctors.extend(lib.ctors.iter().copied());
        }
        Ok(ctors)
    }

    // ── Entry resolution ───────────────────────────────────────

    /// Device address of the kernel registered for `host_ptr` on `device`.
    pub fn resolve_entry(&self, device: usize, host_ptr: usize) -> Result<usize, OffloadError> {
        let exhausted = || OffloadError::EntryTableExhausted { host_ptr };
        let slot = {
            let mut cache = self.entry_cache.lock();
            match cache.get(&host_ptr) {
                Some(slot) => *slot,
                None => {
                    let libraries = self.libraries.lock();
                    let slot = libraries
                        .iter()
                        .find_map(|lib| {
                            lib.table.entry_index(host_ptr).map(|index| EntrySlot {
                                library: lib.id,
                                index,
                            })
                        })
                        .ok_or_else(exhausted)?;
                    cache.insert(host_ptr, slot);
                    slot
                }
            }
        };

        let libraries = self.libraries.lock();
        libraries
            .iter()
            .find(|lib| lib.id == slot.library)
            .and_then(|lib| lib.table.target_entry(device, slot.index))
            .map(|entry| entry.addr)
            .ok_or_else(exhausted)
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // One lock at a time; resolve_entry nests them the other way round.
        let libraries = self.libraries.lock().len();
        let cached_entries = self.entry_cache.lock().len();
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.len())
            .field("libraries", &libraries)
            .field("cached_entries", &cached_entries)
            .finish()
    }
}
