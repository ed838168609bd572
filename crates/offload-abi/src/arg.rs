// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Offload arguments and their classification.
//!
//! An argument is classified exactly once into an [`ArgKind`]; every phase
//! of a region (data begin, launch argument construction, data end) then
//! matches on the kind instead of re-testing flag combinations.

use crate::{AbiError, MapType, NestedDescriptor};
use std::sync::Arc;

/// One argument tuple as emitted by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapArg {
    /// Base address of the enclosing object (or the literal value).
    pub base: usize,
    /// First byte of the section to map.
    pub begin: usize,
    /// Section length in bytes.
    pub size: usize,
    /// Map-type flags.
    pub map_type: MapType,
}

/// How an argument participates in a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Passed to the kernel by value; never mapped.
    Literal,
    /// A fresh device copy per launch; `first_private` copies the host data in.
    Private { first_private: bool },
    /// A captured pointer inside a lambda object, patched relative to its parent.
    LambdaCapture { parent: Option<usize> },
    /// A pointer slot plus the object it points at.
    PtrAndObj,
    /// A plain mapped section.
    Mapped,
}

impl ArgKind {
    /// True for the kinds that create or reuse entries in the mapping table.
    pub fn is_mapped(self) -> bool {
        matches!(self, Self::PtrAndObj | Self::Mapped)
    }
}

impl MapArg {
    /// Creates an argument tuple.
    pub fn new(base: usize, begin: usize, size: usize, map_type: MapType) -> Self {
        Self {
            base,
            begin,
            size,
            map_type,
        }
    }

    /// One past the last byte of the section.
    pub fn end(&self) -> usize {
        self.begin.wrapping_add(self.size)
    }

    /// Signed distance from `begin` back to `base`, as handed to kernels.
    pub fn base_offset(&self) -> isize {
        self.base.wrapping_sub(self.begin) as isize
    }

    /// Classifies the argument.
    ///
    /// The lambda-capture encoding overlaps `LITERAL` and `PTR_AND_OBJ`,
    /// so it is tested first.
    pub fn kind(&self) -> ArgKind {
        let t = self.map_type;
        if t.is_lambda_capture() {
            ArgKind::LambdaCapture {
                parent: t.member_of(),
            }
        } else if t.contains(MapType::LITERAL) {
            ArgKind::Literal
        } else if t.contains(MapType::PRIVATE) {
            ArgKind::Private {
                first_private: t.contains(MapType::TO),
            }
        } else if t.contains(MapType::PTR_AND_OBJ) {
            ArgKind::PtrAndObj
        } else {
            ArgKind::Mapped
        }
    }
}

/// A validated argument list plus any nested descriptors it consumes.
#[derive(Debug, Clone, Default)]
pub struct ArgList {
    args: Vec<MapArg>,
    descriptors: Vec<Arc<dyn NestedDescriptor>>,
    /// Descriptor slot for each `NESTED` argument, in argument order.
    nested_slots: Vec<Option<usize>>,
}

impl ArgList {
    /// Builds a list from the four compiler-emitted parallel arrays.
    pub fn new(
        bases: &[usize],
        begins: &[usize],
        sizes: &[usize],
        types: &[u64],
    ) -> Result<Self, AbiError> {
        let n = bases.len();
        if begins.len() != n || sizes.len() != n || types.len() != n {
            return Err(AbiError::LengthMismatch {
                bases: n,
                begins: begins.len(),
                sizes: sizes.len(),
                types: types.len(),
            });
        }
        let args = (0..n)
            .map(|i| MapArg::new(bases[i], begins[i], sizes[i], MapType::from_raw(types[i])))
            .collect();
        Ok(Self::from_args(args))
    }

    /// Builds a list from already-typed arguments.
    pub fn from_args(args: Vec<MapArg>) -> Self {
        let mut next_slot = 0;
        let nested_slots = args
            .iter()
            .map(|a| {
                a.map_type.contains(MapType::NESTED).then(|| {
                    next_slot += 1;
                    next_slot - 1
                })
            })
            .collect();
        Self {
            args,
            descriptors: Vec::new(),
            nested_slots,
        }
    }

    /// Attaches the next nested descriptor. Descriptors are consumed by
    /// `NESTED` arguments in argument order.
    pub fn with_descriptor(mut self, descriptor: Arc<dyn NestedDescriptor>) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &MapArg> + '_ {
        self.args.iter()
    }

    /// Returns argument `index`.
    pub fn arg(&self, index: usize) -> Result<&MapArg, AbiError> {
        self.args.get(index).ok_or(AbiError::IndexOutOfRange {
            index,
            len: self.args.len(),
        })
    }

    /// Overwrites the base of argument `index` (used for `RETURN_PARAM`).
    pub fn set_base(&mut self, index: usize, base: usize) -> Result<(), AbiError> {
        let len = self.args.len();
        let arg = self
            .args
            .get_mut(index)
            .ok_or(AbiError::IndexOutOfRange { index, len })?;
        arg.base = base;
        Ok(())
    }

    /// Returns the parent of a struct member, checking it precedes the member.
    pub fn parent_of(&self, index: usize) -> Result<Option<&MapArg>, AbiError> {
        match self.arg(index)?.map_type.member_of() {
            None => Ok(None),
            Some(parent) if parent < index => Ok(Some(&self.args[parent])),
            Some(parent) => Err(AbiError::InvalidParent { index, parent }),
        }
    }

    /// True when argument `index` heads a combined struct entry, i.e. it is
    /// not itself a member and the next argument is a member of it.
    pub fn heads_struct(&self, index: usize) -> bool {
        let Some(arg) = self.args.get(index) else {
            return false;
        };
        if arg.map_type.member_of().is_some() {
            return false;
        }
        self.args
            .get(index + 1)
            .and_then(|next| next.map_type.member_of())
            == Some(index)
    }

    /// True if the first argument advertises nested descriptors.
    pub fn has_nested(&self) -> bool {
        self.args
            .first()
            .is_some_and(|a| a.map_type.contains(MapType::HAS_NESTED))
    }

    /// Returns the regions argument `index` stands for: the argument itself,
    /// or a fresh expansion of its nested descriptor.
    pub fn regions(&self, index: usize) -> Result<ArgRegions<'_>, AbiError> {
        let arg = *self.arg(index)?;
        let Some(slot) = self.nested_slots[index] else {
            return Ok(ArgRegions {
                inner: RegionsInner::Single(Some(arg)),
            });
        };
        let descriptor = self
            .descriptors
            .get(slot)
            .ok_or(AbiError::MissingDescriptor { index })?;
        let regions = descriptor
            .regions(&arg)
            .map_err(|detail| AbiError::Descriptor { index, detail })?;
        Ok(ArgRegions {
            inner: RegionsInner::Nested(regions),
        })
    }
}

/// The regions produced for one argument. Finite and single-pass.
pub struct ArgRegions<'a> {
    inner: RegionsInner<'a>,
}

enum RegionsInner<'a> {
    Single(Option<MapArg>),
    Nested(Box<dyn Iterator<Item = MapArg> + 'a>),
}

impl Iterator for ArgRegions<'_> {
    type Item = MapArg;

    fn next(&mut self) -> Option<MapArg> {
        match &mut self.inner {
            RegionsInner::Single(arg) => arg.take(),
            RegionsInner::Nested(it) => it.next().map(|mut region| {
                region.map_type.remove(MapType::NESTED | MapType::HAS_NESTED);
                region
            }),
        }
    }
}
