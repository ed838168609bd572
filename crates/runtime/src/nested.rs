// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Nested descriptors that read host memory.

use crate::host::read_host_ptr;
use offload_abi::{MapArg, MapType, NestedDescriptor, PTR_SIZE};

/// Expands an array of host pointers into the array itself followed by one
/// pointer-and-object region per non-null element.
///
/// The seed argument names the array: `begin` is its first slot and `size`
/// its length in bytes. Every element points at `elem_size` bytes. Elements
/// inherit the seed's `TO`, `FROM`, `ALWAYS` and `DELETE` flags.
#[derive(Debug, Clone)]
pub struct PointerArrayDescriptor {
    elem_size: usize,
}

impl PointerArrayDescriptor {
    /// # Safety
    /// Whenever the runtime expands this descriptor, the seed argument's
    /// section must be a readable array of host pointers.
    pub unsafe fn new(elem_size: usize) -> Self {
        Self { elem_size }
    }
}

impl NestedDescriptor for PointerArrayDescriptor {
    fn regions<'a>(
        &'a self,
        seed: &MapArg,
    ) -> Result<Box<dyn Iterator<Item = MapArg> + 'a>, String> {
        if seed.size % PTR_SIZE != 0 {
            return Err(format!(
                "pointer array of {} bytes is not a whole number of pointers",
                seed.size
            ));
        }
        let inherited =
            seed.map_type & (MapType::TO | MapType::FROM | MapType::ALWAYS | MapType::DELETE);
        let elem_size = self.elem_size;
        let array = *seed;
        let elements = (0..seed.size / PTR_SIZE).filter_map(move |i| {
            let slot = array.begin + i * PTR_SIZE;
            // SAFETY: the constructor's contract covers every slot of the seed.
            let pointee = unsafe { read_host_ptr(slot) };
            (pointee != 0)
                .then(|| MapArg::new(slot, pointee, elem_size, inherited | MapType::PTR_AND_OBJ))
        });
        Ok(Box::new(std::iter::once(array).chain(elements)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expands_array_then_elements() {
        let a = [1u32; 4];
        let b = [2u32; 4];
        let ptrs: [usize; 3] = [a.as_ptr() as usize, 0, b.as_ptr() as usize];
        let begin = ptrs.as_ptr() as usize;
        let seed = MapArg::new(begin, begin, 3 * PTR_SIZE, MapType::TO | MapType::FROM);

        let d = unsafe { PointerArrayDescriptor::new(16) };
        let regions: Vec<MapArg> = d.regions(&seed).unwrap().collect();
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0], seed);
        assert_eq!(regions[1].base, begin);
        assert_eq!(regions[1].begin, a.as_ptr() as usize);
        assert_eq!(regions[2].base, begin + 2 * PTR_SIZE);
        assert!(regions[2].map_type.contains(MapType::PTR_AND_OBJ | MapType::FROM));
        assert_eq!(regions[2].size, 16);
    }

    #[test]
    fn test_rejects_ragged_array() {
        let d = unsafe { PointerArrayDescriptor::new(4) };
        let seed = MapArg::new(0x1000, 0x1000, PTR_SIZE + 1, MapType::TO);
        assert!(d.regions(&seed).is_err());
    }
}
