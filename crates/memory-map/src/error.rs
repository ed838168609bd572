// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the mapping tables.

/// Errors raised when inserting into a [`MappingTable`](crate::MappingTable).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// The section partially overlaps an existing entry.
    #[error("section [{begin:#x}, {end:#x}) partially overlaps mapped section [{existing_begin:#x}, {existing_end:#x})")]
    Overlap {
        begin: usize,
        end: usize,
        existing_begin: usize,
        existing_end: usize,
    },

    /// Attempted to map a zero-length section.
    #[error("cannot map an empty section at {begin:#x}")]
    EmptySection { begin: usize },
}
