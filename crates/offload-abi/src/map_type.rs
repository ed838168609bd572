// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Map-type flags attached to every offload argument.
//!
//! The low bits are independent flags; the top sixteen bits hold the
//! `MEMBER_OF` field, which stores the parent argument index plus one
//! (zero means "not a member").
//!
//! ```text
//!  63            48 47                    13 12 11 ... 1 0
//! ┌────────────────┬────────────────────────┬──┬──┬─────┬──┐
//! │  MEMBER_OF + 1 │        reserved        │HN│N │ ... │TO│
//! └────────────────┴────────────────────────┴──┴──┴─────┴──┘
//! ```

use bitflags::bitflags;

bitflags! {
    /// Flags describing how one argument is mapped around a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapType: u64 {
        /// Copy host data to the device on entry.
        const TO = 0x001;
        /// Copy device data back to the host on exit.
        const FROM = 0x002;
        /// Copy regardless of the reference count.
        const ALWAYS = 0x004;
        /// Force removal of the mapping on exit.
        const DELETE = 0x008;
        /// The argument is a pointer slot plus the object it points at.
        const PTR_AND_OBJ = 0x010;
        /// The argument is passed to the kernel.
        const TARGET_PARAM = 0x020;
        /// Write the device base address back into the argument.
        const RETURN_PARAM = 0x040;
        /// The argument gets a fresh per-launch device copy.
        const PRIVATE = 0x080;
        /// The argument is passed by value.
        const LITERAL = 0x100;
        /// The mapping was inferred by the compiler.
        const IMPLICIT = 0x200;
        /// The argument's regions come from an attached nested descriptor.
        const NESTED = 0x1000;
        /// The argument list carries at least one nested descriptor.
        const HAS_NESTED = 0x2000;
        /// Parent argument index plus one.
        const MEMBER_OF = 0xffff_0000_0000_0000;
    }
}

const MEMBER_OF_SHIFT: u32 = 48;

impl MapType {
    /// Builds a flag set from raw compiler-emitted bits, keeping unknown bits.
    pub fn from_raw(bits: u64) -> Self {
        Self::from_bits_retain(bits)
    }

    /// Returns the parent argument index if this argument is a struct member.
    pub fn member_of(self) -> Option<usize> {
        let field = (self.bits() & Self::MEMBER_OF.bits()) >> MEMBER_OF_SHIFT;
        if field == 0 {
            None
        } else {
            Some(field as usize - 1)
        }
    }

    /// Returns a copy of `self` marked as a member of argument `parent`.
    pub fn with_member_of(self, parent: usize) -> Self {
        let field = ((parent as u64) + 1) << MEMBER_OF_SHIFT;
        Self::from_bits_retain((self.bits() & !Self::MEMBER_OF.bits()) | field)
    }

    /// True for the lambda-capture encoding (`PTR_AND_OBJ | LITERAL | IMPLICIT`).
    pub fn is_lambda_capture(self) -> bool {
        self.contains(Self::PTR_AND_OBJ | Self::LITERAL | Self::IMPLICIT)
    }
}
