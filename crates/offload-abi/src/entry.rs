// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Offload entries and translation tables.
//!
//! A registered library contributes a list of host entries (kernel
//! functions with size zero, global variables with their byte size) and one
//! optional device image per device. Loading an image on a device yields a
//! [`TargetTable`] whose entries line up index-for-index with the host
//! entries.

/// A named host or device symbol.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OffloadEntry {
    pub name: String,
    pub addr: usize,
    /// Zero for functions, byte size for global variables.
    pub size: usize,
}

impl OffloadEntry {
    /// A kernel entry point.
    pub fn function(name: impl Into<String>, addr: usize) -> Self {
        Self {
            name: name.into(),
            addr,
            size: 0,
        }
    }

    /// A global variable.
    pub fn global(name: impl Into<String>, addr: usize, size: usize) -> Self {
        Self {
            name: name.into(),
            addr,
            size,
        }
    }

    pub fn is_global(&self) -> bool {
        self.size > 0
    }
}

/// Device code for one device, as handed to the driver plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceImage {
    pub entries: Vec<OffloadEntry>,
}

/// The entries of an image after it was loaded on a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TargetTable {
    pub entries: Vec<OffloadEntry>,
}

/// Everything a library registers with the runtime.
#[derive(Debug, Clone, Default)]
pub struct BinaryDescriptor {
    pub host_entries: Vec<OffloadEntry>,
    /// One optional image per device id.
    pub images: Vec<Option<DeviceImage>>,
    /// Host entry addresses of constructors to run once per device.
    pub ctors: Vec<usize>,
}

impl BinaryDescriptor {
    pub fn new(host_entries: Vec<OffloadEntry>) -> Self {
        Self {
            host_entries,
            ..Default::default()
        }
    }

    /// Attaches the image for device `device`.
    pub fn with_image(mut self, device: usize, image: DeviceImage) -> Self {
        if self.images.len() <= device {
            self.images.resize(device + 1, None);
        }
        self.images[device] = Some(image);
        self
    }

    /// Registers a constructor entry.
    pub fn with_ctor(mut self, host_addr: usize) -> Self {
        self.ctors.push(host_addr);
        self
    }
}

/// Host entries of one library together with their per-device counterparts.
#[derive(Debug, Clone)]
pub struct TranslationTable {
    pub host_entries: Vec<OffloadEntry>,
    pub images: Vec<Option<DeviceImage>>,
    pub targets: Vec<Option<TargetTable>>,
}

impl TranslationTable {
    /// Creates an unloaded table sized for `num_devices`.
    pub fn new(desc: &BinaryDescriptor, num_devices: usize) -> Self {
        let mut images = desc.images.clone();
        images.resize(num_devices, None);
        Self {
            host_entries: desc.host_entries.clone(),
            images,
            targets: vec![None; num_devices],
        }
    }

    /// Index of the host entry at `host_addr`.
    pub fn entry_index(&self, host_addr: usize) -> Option<usize> {
        self.host_entries.iter().position(|e| e.addr == host_addr)
    }

    /// True if the table has been loaded on `device`.
    pub fn is_loaded(&self, device: usize) -> bool {
        self.targets.get(device).is_some_and(|t| t.is_some())
    }

    /// Device entry `index` on `device`, if loaded.
    pub fn target_entry(&self, device: usize, index: usize) -> Option<&OffloadEntry> {
        self.targets
            .get(device)?
            .as_ref()?
            .entries
            .get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_images_by_device() {
        let desc = BinaryDescriptor::new(vec![OffloadEntry::function("k", 0x10)])
            .with_image(2, DeviceImage::default());
        assert_eq!(desc.images.len(), 3);
        assert!(desc.images[0].is_none());
        assert!(desc.images[2].is_some());
    }

    #[test]
    fn test_translation_table_lookup() {
        let desc = BinaryDescriptor::new(vec![
            OffloadEntry::function("k0", 0x10),
            OffloadEntry::global("g", 0x20, 8),
        ]);
        let mut table = TranslationTable::new(&desc, 2);
        assert_eq!(table.entry_index(0x20), Some(1));
        assert_eq!(table.entry_index(0x30), None);
        assert!(!table.is_loaded(0));

        table.targets[0] = Some(TargetTable {
            entries: vec![OffloadEntry::function("k0", 0xa0), OffloadEntry::global("g", 0xb0, 8)],
        });
        assert!(table.is_loaded(0));
        assert_eq!(table.target_entry(0, 0).map(|e| e.addr), Some(0xa0));
        assert!(table.target_entry(1, 0).is_none());
    }

    #[test]
    fn test_entry_serialises() {
        let e = OffloadEntry::global("counter", 0x40, 4);
        let json = serde_json::to_string(&e).unwrap();
        let back: OffloadEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
        assert!(back.is_global());
    }
}
