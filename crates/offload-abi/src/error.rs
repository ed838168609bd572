// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for argument-list construction and expansion.

/// Errors raised while validating or expanding a call-site argument list.
#[derive(Debug, thiserror::Error)]
pub enum AbiError {
    /// The four parallel argument arrays do not have the same length.
    #[error("argument arrays disagree in length: {bases} bases, {begins} begins, {sizes} sizes, {types} types")]
    LengthMismatch {
        bases: usize,
        begins: usize,
        sizes: usize,
        types: usize,
    },

    /// An argument index is out of range.
    #[error("argument index {index} out of range ({len} arguments)")]
    IndexOutOfRange { index: usize, len: usize },

    /// A `NESTED` argument has no descriptor attached for it.
    #[error("argument {index} is nested but no descriptor was attached for it")]
    MissingDescriptor { index: usize },

    /// A `MEMBER_OF` field names a parent that does not precede the member.
    #[error("argument {index} is a member of {parent}, which is not an earlier argument")]
    InvalidParent { index: usize, parent: usize },

    /// A nested descriptor could not produce its regions.
    #[error("nested descriptor failed for argument {index}: {detail}")]
    Descriptor { index: usize, detail: String },
}
