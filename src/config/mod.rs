/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration module
//!
//! Handles loading and parsing of YAML configuration files:
//! - Logging settings
//! - UDP listen address
//! - Upstream transport options

use crate::config::types::Config;
use crate::core::error::Result;
use std::fs;
use std::path::Path;

pub mod types;

/// Load and parse configuration from YAML file
///
/// # Errors
/// Returns an error if the file cannot be read, if YAML parsing fails, or if validation fails.
pub fn init(file: &Path) -> Result<Config> {
    let string = fs::read_to_string(file)?;
    let config: Config = serde_yml::from_str(&string)?;

    config.validate()?;

    Ok(config)
}
