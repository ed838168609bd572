// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Device-side address translation tables.
//!
//! Instead of patching pointers, a launch can hand the kernel a table of
//! every live mapping. Device code then translates any host address it
//! meets by binary search over the table.
//!
//! # Wire format
//!
//! ```text
//!  ┌───────────────────────────── header ─────────────────────────────┐
//!  │ host_begin = count │ host_end = 0 │ tgt_begin = 0 │ bias = 0     │
//!  ├───────────────────────────── segment 0 ──────────────────────────┤
//!  │ host_begin         │ host_end     │ tgt_begin     │ tgt - host   │
//!  ├──────────────────────────────── ... ─────────────────────────────┤
//! ```
//!
//! Segments follow the header sorted by ascending `host_begin`. All fields
//! are 64-bit, native endian.

use crate::{Device, DeviceError};
use memory_map::MappingEntry;

/// One translated section, laid out as the device reads it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Segment {
    pub host_begin: u64,
    pub host_end: u64,
    pub tgt_begin: u64,
    /// `tgt_begin - host_begin`, wrapping.
    pub bias: i64,
}

impl Segment {
    pub fn from_entry(entry: &MappingEntry) -> Self {
        Self {
            host_begin: entry.host_begin as u64,
            host_end: entry.host_end as u64,
            tgt_begin: entry.tgt_begin as u64,
            bias: (entry.tgt_begin as i64).wrapping_sub(entry.host_begin as i64),
        }
    }

    pub fn contains(&self, host_addr: u64) -> bool {
        (self.host_begin..self.host_end).contains(&host_addr)
    }
}

/// A sorted segment list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressTable {
    segments: Vec<Segment>,
}

impl AddressTable {
    /// Builds the table from live mappings in any order.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a MappingEntry>) -> Self {
        let mut segments: Vec<Segment> = entries.into_iter().map(Segment::from_entry).collect();
        segments.sort_by_key(|s| s.host_begin);
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Size of the serialised table, header included.
    pub fn byte_len(&self) -> usize {
        (self.segments.len() + 1) * std::mem::size_of::<Segment>()
    }

    /// Translates `host_addr` with the same binary search device code uses.
    pub fn translate(&self, host_addr: usize) -> Option<usize> {
        let addr = host_addr as u64;
        let (mut lo, mut hi) = (0usize, self.segments.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let s = &self.segments[mid];
            if addr < s.host_begin {
                hi = mid;
            } else if addr >= s.host_end {
                lo = mid + 1;
            } else {
                return Some((addr as i64).wrapping_add(s.bias) as usize);
            }
        }
        None
    }

    /// Serialises the header and segments.
    pub fn to_device_bytes(&self) -> Vec<u8> {
        let header = Segment {
            host_begin: self.segments.len() as u64,
            ..Segment::default()
        };
        let mut bytes = Vec::with_capacity(self.byte_len());
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.segments));
        bytes
    }

    /// Parses a serialised table.
    pub fn from_device_bytes(bytes: &[u8]) -> Result<Self, String> {
        let width = std::mem::size_of::<Segment>();
        if bytes.len() < width || bytes.len() % width != 0 {
            return Err(format!("address table of {} bytes is malformed", bytes.len()));
        }
        let mut records = bytes
            .chunks_exact(width)
            .map(bytemuck::pod_read_unaligned::<Segment>);
        let count = records.next().map_or(0, |h| h.host_begin as usize);
        let segments: Vec<Segment> = records.collect();
        if segments.len() != count {
            return Err(format!(
                "address table header announces {count} segments, found {}",
                segments.len()
            ));
        }
        Ok(Self { segments })
    }
}

/// An address table resident in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadedTable {
    pub tgt: usize,
    pub segments: usize,
}

impl Device {
    /// Snapshots the live mappings into a table.
    pub fn build_address_table(&self) -> AddressTable {
        self.with_mappings(|map| AddressTable::from_entries(map.iter()))
    }

    /// Copies `table` into a fresh device buffer. The caller frees it with
    /// [`free_scratch`](Device::free_scratch) after the launch.
    pub fn upload_address_table(&self, table: &AddressTable) -> Result<UploadedTable, DeviceError> {
        let bytes = table.to_device_bytes();
        let tgt = self.alloc_scratch(bytes.len(), 0)?;
        if let Err(e) = self.data_submit(tgt, &bytes) {
            if let Err(free_err) = self.free_scratch(tgt) {
                tracing::warn!("leaking address table at {tgt:#x}: {free_err}");
            }
            return Err(e);
        }
        tracing::debug!(
            "device {}: address table with {} segments at {tgt:#x}",
            self.id(),
            table.len()
        );
        Ok(UploadedTable {
            tgt,
            segments: table.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HostPlugin;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn entry(begin: usize, end: usize, tgt: usize) -> MappingEntry {
        MappingEntry::new(begin, begin, end, tgt)
    }

    #[test]
    fn test_sorted_and_translates() {
        let entries = [
            entry(0x3000, 0x3010, 0xd300),
            entry(0x1000, 0x1100, 0xd100),
            entry(0x2000, 0x2008, 0xd200),
        ];
        let table = AddressTable::from_entries(&entries);
        let begins: Vec<_> = table.segments().iter().map(|s| s.host_begin).collect();
        assert_eq!(begins, vec![0x1000, 0x2000, 0x3000]);
        assert_eq!(table.translate(0x1080), Some(0xd180));
        assert_eq!(table.translate(0x2007), Some(0xd207));
        assert_eq!(table.translate(0x2008), None);
        assert_eq!(table.translate(0x0fff), None);
    }

    #[test]
    fn test_wire_format() {
        let table = AddressTable::from_entries(&[entry(0x1000, 0x1010, 0xd000)]);
        let bytes = table.to_device_bytes();
        assert_eq!(bytes.len(), 64);
        assert_eq!(u64::from_ne_bytes(bytes[..8].try_into().unwrap()), 1);
        assert_eq!(AddressTable::from_device_bytes(&bytes).unwrap(), table);
        assert!(AddressTable::from_device_bytes(&bytes[..40]).is_err());
        assert!(AddressTable::from_device_bytes(&bytes[..32]).is_err());
    }

    #[test]
    fn test_upload_from_device_mappings() {
        let plugin = Arc::new(HostPlugin::new(1));
        let dev = Device::new(0, plugin.clone(), 0);
        let a = dev.get_or_alloc_tgt_ptr(0x1000, 0x1000, 16, false, true).unwrap().unwrap();
        dev.get_or_alloc_tgt_ptr(0x5000, 0x5000, 16, false, true).unwrap();

        let table = dev.build_address_table();
        assert_eq!(table.len(), 2);
        let uploaded = dev.upload_address_table(&table).unwrap();
        assert_eq!(uploaded.segments, 2);
        let raw = plugin.read_device(0, uploaded.tgt, table.byte_len()).unwrap();
        let back = AddressTable::from_device_bytes(&raw).unwrap();
        assert_eq!(back.translate(0x1004), Some(a.addr + 4));
        dev.free_scratch(uploaded.tgt).unwrap();
    }

    proptest! {
        #[test]
        fn prop_translate_matches_linear_scan(
            sizes in proptest::collection::vec(1usize..64, 1..40),
            query in 0usize..6000
        ) {
            let mut entries = Vec::new();
            let mut cursor = 0x100;
            for (i, size) in sizes.iter().enumerate() {
                entries.push(entry(cursor, cursor + size, 0xd000_0000 + i * 0x1000));
                cursor += size + 16;
            }
            let table = AddressTable::from_entries(&entries);
            let expected = entries
                .iter()
                .find(|e| e.contains(query))
                .map(|e| e.tgt_for(query));
            prop_assert_eq!(table.translate(query), expected);
        }
    }
}
