/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Unified error handling module for dotpool
//!
//! Provides a centralized error type that can represent every failure the
//! transport layer and its ambient plumbing can produce. Transport failures
//! are split the way callers need to react to them:
//!
//! - [`DnsError::Dial`]: a new connection could not be opened (never retried here)
//! - [`DnsError::TransportClosed`]: the transport was closed before the call
//! - [`DnsError::ConnectionClosed`]: the connection died under the query
//! - [`DnsError::Protocol`]: malformed framing or message content

use crate::config::types::ConfigError;
use thiserror::Error;

/// Main error type for dotpool
///
/// It can be constructed from various error types using the `From` trait implementations.
#[derive(Debug, Error)]
pub enum DnsError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing or serialization failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network address parsing error
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// Tokio runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Opening a new upstream connection failed (TCP connect or TLS handshake)
    #[error("dial error: {0}")]
    Dial(String),

    /// Exchange attempted on a transport that has been closed
    #[error("transport closed")]
    TransportClosed,

    /// The connection carrying the query was closed, with its close cause
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// No response arrived within the configured query timeout
    #[error("dns query timeout")]
    Timeout,

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Protocol(String),

    /// DNS protocol error reported by hickory
    #[error("DNS Hickory protocol error: {0}")]
    HickoryProtocol(#[from] hickory_proto::ProtoError),
}

#[allow(unused)]
impl DnsError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        DnsError::Config(msg.into())
    }

    /// Create a runtime error
    pub fn runtime<S: Into<String>>(msg: S) -> Self {
        DnsError::Runtime(msg.into())
    }

    /// Create a dial error
    pub fn dial<S: Into<String>>(msg: S) -> Self {
        DnsError::Dial(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        DnsError::Protocol(msg.into())
    }

    /// Create a connection closed error carrying the close cause
    pub fn connection_closed<S: Into<String>>(cause: S) -> Self {
        DnsError::ConnectionClosed(cause.into())
    }

    /// Copy of a connection close error for every query waiting on that connection
    ///
    /// Protocol errors keep their class, anything else is reported as a
    /// closed connection carrying the original message as its cause.
    pub fn to_close_error(&self) -> DnsError {
        match self {
            DnsError::Protocol(msg) => DnsError::Protocol(msg.clone()),
            DnsError::ConnectionClosed(cause) => DnsError::ConnectionClosed(cause.clone()),
            other => DnsError::ConnectionClosed(other.to_string()),
        }
    }
}

/// Allow conversion from ConfigError to DnsError
impl From<ConfigError> for DnsError {
    fn from(e: ConfigError) -> Self {
        DnsError::Config(e.to_string())
    }
}

/// Convenient type alias for Results using DnsError
pub type Result<T> = std::result::Result<T, DnsError>;
