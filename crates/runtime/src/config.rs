// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Runtime configuration loaded from TOML files or constructed programmatically.
//!
//! # TOML Format
//! ```toml
//! transfer_mode = "bulk"
//! address_table = false
//! struct_alignment = 8
//! default_device = 0
//! enable_profiling = true
//!
//! # Optional: hand kernels a per-window offset list
//! [address_offset]
//! mask = 0xf000000000
//! shift = 36
//! ```

use crate::strategy::{BulkTransfer, ImmediateTransfer, TransferStrategy};
use crate::OffloadError;
use std::path::Path;

/// Most windows an offset list may have.
pub const MAX_OFFSET_WINDOWS: u64 = 4096;

/// Window selection for offset-list translation: a host address belongs to
/// window `(addr & mask) >> shift`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OffsetWindows {
    pub mask: u64,
    pub shift: u32,
}

impl OffsetWindows {
    pub fn windows(&self) -> u64 {
        self.mask.checked_shr(self.shift).unwrap_or(0) + 1
    }
}

/// Configuration for the offload runtime.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How data-begin moves bytes: `"immediate"` or `"bulk"`.
    pub transfer_mode: String,
    /// Upload a translation table at launch instead of patching pointers.
    pub address_table: bool,
    /// Literal appended after the table arguments when `address_table` is set.
    pub address_mask: Option<u64>,
    /// Alignment combined struct entries are padded down to.
    pub struct_alignment: usize,
    /// Device used when a call passes device id `-1`.
    pub default_device: usize,
    /// Whether to record per-phase timings.
    pub enable_profiling: bool,
    /// Upload a per-window offset list at launch instead of patching
    /// pointers. Appended after any table arguments.
    pub address_offset: Option<OffsetWindows>,
}

impl RuntimeConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, OffloadError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OffloadError::ConfigError(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, OffloadError> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| OffloadError::ConfigError(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialises configuration to TOML.
    pub fn to_toml(&self) -> Result<String, OffloadError> {
        toml::to_string_pretty(self)
            .map_err(|e| OffloadError::ConfigError(format!("TOML serialise error: {e}")))
    }

    /// True if kernels translate host addresses themselves, so embedded
    /// pointers are left unpatched.
    pub fn translates_on_device(&self) -> bool {
        self.address_table || self.address_offset.is_some()
    }

    pub fn validate(&self) -> Result<(), OffloadError> {
        if !self.struct_alignment.is_power_of_two() {
            return Err(OffloadError::ConfigError(format!(
                "struct_alignment must be a power of two, got {}",
                self.struct_alignment
            )));
        }
        if let Some(w) = self.address_offset {
            if w.mask == 0 || w.shift >= 64 {
                return Err(OffloadError::ConfigError(format!(
                    "address_offset needs a non-zero mask and a shift below 64, got {:#x} >> {}",
                    w.mask, w.shift
                )));
            }
            if w.windows() > MAX_OFFSET_WINDOWS {
                return Err(OffloadError::ConfigError(format!(
                    "address_offset selects {} windows, at most {MAX_OFFSET_WINDOWS} allowed",
                    w.windows()
                )));
            }
        }
        self.create_strategy().map(|_| ())
    }

    /// Creates the transfer strategy named by `transfer_mode`.
    pub fn create_strategy(&self) -> Result<Box<dyn TransferStrategy>, OffloadError> {
        match self.transfer_mode.to_lowercase().as_str() {
            "immediate" => Ok(Box::new(ImmediateTransfer::new())),
            "bulk" => Ok(Box::new(BulkTransfer::new())),
            other => Err(OffloadError::ConfigError(format!(
                "unknown transfer mode '{other}'; expected 'immediate' or 'bulk'"
            ))),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            transfer_mode: "immediate".to_string(),
            address_table: false,
            address_mask: None,
            struct_alignment: 8,
            default_device: 0,
            enable_profiling: true,
            address_offset: None,
        }
    }
}
