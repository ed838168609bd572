// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Nested region descriptors.
//!
//! A `NESTED` argument does not describe one section: it carries a
//! descriptor that, seeded with the argument, yields a finite sequence of
//! further sections. Each call to [`NestedDescriptor::regions`] starts a new
//! single-pass expansion, so the data-begin and data-end phases of a region
//! each walk the sequence once.

use crate::MapArg;
use std::fmt;

/// A source of nested regions for one argument.
pub trait NestedDescriptor: Send + Sync + fmt::Debug {
    /// Starts a fresh expansion seeded from `seed`.
    fn regions<'a>(
        &'a self,
        seed: &MapArg,
    ) -> Result<Box<dyn Iterator<Item = MapArg> + 'a>, String>;
}

/// A descriptor replaying a precomputed list of regions.
#[derive(Debug, Clone, Default)]
pub struct RegionList {
    regions: Vec<MapArg>,
}

impl RegionList {
    pub fn new(regions: Vec<MapArg>) -> Self {
        Self { regions }
    }
}

impl NestedDescriptor for RegionList {
    fn regions<'a>(
        &'a self,
        _seed: &MapArg,
    ) -> Result<Box<dyn Iterator<Item = MapArg> + 'a>, String> {
        Ok(Box::new(self.regions.iter().copied()))
    }
}
