// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Raw access to host memory named by argument addresses.
//!
//! Every function here trusts the address it is given. The public entry
//! points of [`OffloadRuntime`](crate::OffloadRuntime) are `unsafe` for
//! exactly this reason.

use offload_abi::PTR_SIZE;

/// Borrows `len` host bytes at `addr`.
///
/// # Safety
/// `[addr, addr + len)` must be readable for the lifetime `'a` and not be
/// written through any other path meanwhile.
pub(crate) unsafe fn host_bytes<'a>(addr: usize, len: usize) -> &'a [u8] {
    if len == 0 {
        return &[];
    }
    std::slice::from_raw_parts(addr as *const u8, len)
}

/// Mutably borrows `len` host bytes at `addr`.
///
/// # Safety
/// `[addr, addr + len)` must be writable for the lifetime `'a` and not be
/// accessed through any other path meanwhile.
pub(crate) unsafe fn host_bytes_mut<'a>(addr: usize, len: usize) -> &'a mut [u8] {
    if len == 0 {
        return &mut [];
    }
    std::slice::from_raw_parts_mut(addr as *mut u8, len)
}

/// Reads the pointer stored at `slot`.
///
/// # Safety
/// `slot` must be readable for `PTR_SIZE` bytes. No alignment is required.
pub(crate) unsafe fn read_host_ptr(slot: usize) -> usize {
    let mut raw = [0u8; PTR_SIZE];
    raw.copy_from_slice(host_bytes(slot, PTR_SIZE));
    usize::from_ne_bytes(raw)
}

/// Stores `value` at `slot`.
///
/// # Safety
/// `slot` must be writable for `PTR_SIZE` bytes. No alignment is required.
pub(crate) unsafe fn write_host_ptr(slot: usize, value: usize) {
    host_bytes_mut(slot, PTR_SIZE).copy_from_slice(&value.to_ne_bytes());
}
