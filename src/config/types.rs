/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration structure definitions
//!
//! Defines the schema for dotpool configuration files (YAML format).

use crate::network::upstream::UpstreamConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Invalid listen address: {0}")]
    InvalidListen(String),

    #[error("Upstream address cannot be empty")]
    EmptyUpstreamAddr,

    #[error("Unsupported upstream scheme in {0} (expected tcp:// or tls://)")]
    UnsupportedScheme(String),

    #[error("Upstream idle_timeout must be at least 1 second")]
    ZeroIdleTimeout,
}

/// Main configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging configuration (level, file output)
    #[serde(default)]
    pub log: LogConfig,

    /// UDP address the forwarder listens on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// The single upstream every query is forwarded to
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Validate configuration
    ///
    /// Upstream address parsing proper happens when the transport is built;
    /// this only rejects configurations that can never work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log.level.to_lowercase().as_str() {
            "off" | "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(ConfigError::InvalidLogLevel(self.log.level.clone())),
        }

        if self.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListen(self.listen.clone()));
        }

        let addr = self.upstream.addr.trim();
        if addr.is_empty() {
            return Err(ConfigError::EmptyUpstreamAddr);
        }
        if addr.contains("://") && !(addr.starts_with("tcp://") || addr.starts_with("tls://")) {
            return Err(ConfigError::UnsupportedScheme(addr.to_string()));
        }
        if self.upstream.idle_timeout == Some(0) {
            return Err(ConfigError::ZeroIdleTimeout);
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: off, trace, debug, info, warn, error
    #[serde(default = "default_level")]
    pub level: String,

    /// Optional file path for log output (in addition to console)
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: default_level(),
            file: None,
        }
    }
}

/// Default log level
fn default_level() -> String {
    "info".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:5353".to_string()
}
