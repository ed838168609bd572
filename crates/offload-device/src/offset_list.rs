// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Window-offset translation lists.
//!
//! The cheaper sibling of the address table: host addresses are grouped
//! into windows selected by `(addr & mask) >> shift`, and every mapping in
//! a window must share one `tgt - host` offset. Device code translates with
//! a mask, a shift and one load.
//!
//! # Wire format
//!
//! ```text
//!  ┌──────┬───────┬─────────┬──────────┬─────┬──────────────────────┐
//!  │ mask │ shift │ windows │ offset 0 │ ... │ offset (windows - 1) │
//!  └──────┴───────┴─────────┴──────────┴─────┴──────────────────────┘
//! ```
//!
//! Every field is 64 bits, native endian. Offsets are signed; windows with
//! no mapping hold zero.

use crate::{Device, DeviceError, UploadedTable};
use memory_map::MappingEntry;

const HEADER_WORDS: usize = 3;

/// Two mappings in one window that disagree on the offset.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "host section at {host_begin:#x} needs offset {requested:#x} in window {window}, \
     which already uses {existing:#x}"
)]
pub struct OffsetConflict {
    pub window: usize,
    pub host_begin: usize,
    pub existing: i64,
    pub requested: i64,
}

/// One offset per address window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetList {
    mask: u64,
    shift: u32,
    offsets: Vec<i64>,
    used: Vec<bool>,
}

impl OffsetList {
    /// An empty list with `(mask >> shift) + 1` windows.
    pub fn new(mask: u64, shift: u32) -> Self {
        let windows = mask.checked_shr(shift).unwrap_or(0) as usize + 1;
        Self {
            mask,
            shift,
            offsets: vec![0; windows],
            used: vec![false; windows],
        }
    }

    /// Builds the list from live mappings. A mapping spanning several
    /// windows claims all of them.
    pub fn from_entries<'a>(
        mask: u64,
        shift: u32,
        entries: impl IntoIterator<Item = &'a MappingEntry>,
    ) -> Result<Self, OffsetConflict> {
        let mut list = Self::new(mask, shift);
        for e in entries {
            let offset = (e.tgt_begin as i64).wrapping_sub(e.host_begin as i64);
            let mut addr = e.host_begin as u64;
            let end = (e.host_end as u64).max(addr + 1);
            for _ in 0..list.windows() {
                list.claim(list.window(addr as usize), e.host_begin, offset)?;
                let next = (addr.checked_shr(shift).unwrap_or(0) + 1)
                    .checked_shl(shift)
                    .unwrap_or(u64::MAX);
                if next >= end || next <= addr {
                    break;
                }
                addr = next;
            }
        }
        Ok(list)
    }

    fn claim(&mut self, window: usize, host_begin: usize, offset: i64) -> Result<(), OffsetConflict> {
        if self.used[window] && self.offsets[window] != offset {
            return Err(OffsetConflict {
                window,
                host_begin,
                existing: self.offsets[window],
                requested: offset,
            });
        }
        self.used[window] = true;
        self.offsets[window] = offset;
        Ok(())
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    pub fn windows(&self) -> usize {
        self.offsets.len()
    }

    /// Windows holding at least one mapping.
    pub fn used_windows(&self) -> usize {
        self.used.iter().filter(|u| **u).count()
    }

    pub fn window(&self, host_addr: usize) -> usize {
        (host_addr as u64 & self.mask).checked_shr(self.shift).unwrap_or(0) as usize
    }

    /// Translates `host_addr` the way device code does. Addresses in unused
    /// windows come back unchanged.
    pub fn translate(&self, host_addr: usize) -> usize {
        (host_addr as i64).wrapping_add(self.offsets[self.window(host_addr)]) as usize
    }

    pub fn byte_len(&self) -> usize {
        (HEADER_WORDS + self.offsets.len()) * std::mem::size_of::<u64>()
    }

    pub fn to_device_bytes(&self) -> Vec<u8> {
        let mut words: Vec<u64> = Vec::with_capacity(HEADER_WORDS + self.offsets.len());
        words.extend([self.mask, u64::from(self.shift), self.offsets.len() as u64]);
        words.extend(self.offsets.iter().map(|o| *o as u64));
        bytemuck::cast_slice(&words).to_vec()
    }

    /// Parses a serialised list. Window usage is not part of the wire form;
    /// windows with a non-zero offset are reported as used.
    pub fn from_device_bytes(bytes: &[u8]) -> Result<Self, String> {
        let width = std::mem::size_of::<u64>();
        if bytes.len() < HEADER_WORDS * width || bytes.len() % width != 0 {
            return Err(format!("offset list of {} bytes is malformed", bytes.len()));
        }
        let words: Vec<u64> = bytes
            .chunks_exact(width)
            .map(bytemuck::pod_read_unaligned::<u64>)
            .collect();
        let (mask, shift, windows) = (words[0], words[1], words[2] as usize);
        let offsets: Vec<i64> = words[HEADER_WORDS..].iter().map(|w| *w as i64).collect();
        if offsets.len() != windows {
            return Err(format!(
                "offset list header announces {windows} windows, found {}",
                offsets.len()
            ));
        }
        let shift = u32::try_from(shift).map_err(|_| format!("offset list shift {shift} is invalid"))?;
        Ok(Self {
            mask,
            shift,
            used: offsets.iter().map(|o| *o != 0).collect(),
            offsets,
        })
    }
}

impl Device {
    /// Snapshots the live mappings into an offset list.
    pub fn build_offset_list(&self, mask: u64, shift: u32) -> Result<OffsetList, DeviceError> {
        self.with_mappings(|map| OffsetList::from_entries(mask, shift, map.iter()))
            .map_err(|source| DeviceError::OffsetConflict {
                device: self.id(),
                source,
            })
    }

    /// Copies `list` into a fresh device buffer. The caller frees it with
    /// [`free_scratch`](Device::free_scratch) after the launch.
    pub fn upload_offset_list(&self, list: &OffsetList) -> Result<UploadedTable, DeviceError> {
        let bytes = list.to_device_bytes();
        let tgt = self.alloc_scratch(bytes.len(), 0)?;
        if let Err(e) = self.data_submit(tgt, &bytes) {
            if let Err(free_err) = self.free_scratch(tgt) {
                tracing::warn!("leaking offset list at {tgt:#x}: {free_err}");
            }
            return Err(e);
        }
        tracing::debug!(
            "device {}: offset list with {}/{} windows in use at {tgt:#x}",
            self.id(),
            list.used_windows(),
            list.windows()
        );
        Ok(UploadedTable {
            tgt,
            segments: list.used_windows(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HostPlugin;
    use std::sync::Arc;

    fn entry(begin: usize, end: usize, tgt: usize) -> MappingEntry {
        MappingEntry::new(begin, begin, end, tgt)
    }

    #[test]
    fn test_windows_translate_by_offset() {
        let entries = [
            entry(0x1000_0100, 0x1000_0200, 0xd000_0100),
            entry(0x1000_0800, 0x1000_0810, 0xd000_0800),
            entry(0x3000_0000, 0x3000_0040, 0x5000_0000),
        ];
        let list = OffsetList::from_entries(0xf000_0000, 28, &entries).unwrap();
        assert_eq!(list.windows(), 16);
        assert_eq!(list.used_windows(), 2);
        assert_eq!(list.translate(0x1000_0104), 0xd000_0104);
        assert_eq!(list.translate(0x3000_0010), 0x5000_0010);
        assert_eq!(list.translate(0x2000_0000), 0x2000_0000);
    }

    #[test]
    fn test_conflicting_offsets_in_one_window() {
        let entries = [
            entry(0x1000_0000, 0x1000_0010, 0xd000_0000),
            entry(0x1000_0100, 0x1000_0110, 0xe000_0000),
        ];
        let err = OffsetList::from_entries(0xf000_0000, 28, &entries).unwrap_err();
        assert_eq!(err.window, 1);
        assert_eq!(err.host_begin, 0x1000_0100);
    }

    #[test]
    fn test_section_spanning_windows_claims_both() {
        let entries = [entry(0x0ff0, 0x1010, 0x9ff0)];
        let list = OffsetList::from_entries(0xf000, 12, &entries).unwrap();
        assert_eq!(list.used_windows(), 2);
        assert_eq!(list.translate(0x1008), 0xa008);

        let clash = [entry(0x0ff0, 0x1010, 0x9ff0), entry(0x1800, 0x1810, 0x1800)];
        assert!(OffsetList::from_entries(0xf000, 12, &clash).is_err());
    }

    #[test]
    fn test_wire_format() {
        let list = OffsetList::from_entries(0x30, 4, &[entry(0x10, 0x18, 0x110)]).unwrap();
        let bytes = list.to_device_bytes();
        assert_eq!(bytes.len(), list.byte_len());
        assert_eq!(bytes.len(), 7 * 8);
        let back = OffsetList::from_device_bytes(&bytes).unwrap();
        assert_eq!(back, list);
        assert_eq!(back.translate(0x14), 0x114);
        assert!(OffsetList::from_device_bytes(&bytes[..40]).is_err());
        assert!(OffsetList::from_device_bytes(&bytes[..20]).is_err());
    }

    #[test]
    fn test_upload_from_device_mappings() {
        let plugin = Arc::new(HostPlugin::new(1));
        let dev = Device::new(0, plugin.clone(), 0);
        let a = dev.get_or_alloc_tgt_ptr(0x1000, 0x1000, 16, false, true).unwrap().unwrap();

        let list = dev.build_offset_list(0xf000, 12).unwrap();
        let uploaded = dev.upload_offset_list(&list).unwrap();
        assert_eq!(uploaded.segments, 1);
        let raw = plugin.read_device(0, uploaded.tgt, list.byte_len()).unwrap();
        let back = OffsetList::from_device_bytes(&raw).unwrap();
        assert_eq!(back.translate(0x1004), a.addr + 4);
        dev.free_scratch(uploaded.tgt).unwrap();

        dev.get_or_alloc_tgt_ptr(0x1800, 0x1800, 16, false, true).unwrap();
        assert!(matches!(
            dev.build_offset_list(0xf000, 12),
            Err(DeviceError::OffsetConflict { device: 0, .. })
        ));
    }
}
