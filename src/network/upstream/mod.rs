/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Upstream DNS resolver infrastructure
//!
//! One upstream is a single fixed server reached over plain TCP or DNS over
//! TLS. Queries go through an [`AdaptiveTransport`] that pools connections
//! and pipelines queries when configured to.
//!
//! # Supported Protocols
//! - **TCP**: DNS over TCP (port 53)
//! - **DoT**: DNS over TLS (port 853)

use crate::core::error::{DnsError, Result};
use crate::network::transport::DnsCodec;
use crate::network::upstream::dialer::{SocketOptions, StreamDialer, TcpDialer, TlsDialer};
use crate::network::upstream::pool::transport::{AdaptiveTransport, TransportOptions};
use async_trait::async_trait;
use hickory_proto::op::Message;
use serde::Deserialize;
use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::{Host, Url};

pub mod dialer;
pub mod pool;

/// Supported upstream connection types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionType {
    TCP,
    DoT,
}

impl ConnectionType {
    /// Returns the default port for each connection type
    pub fn default_port(&self) -> u16 {
        match self {
            ConnectionType::TCP => 53,
            ConnectionType::DoT => 853,
        }
    }
}

/// Configuration for building an upstream DNS server connection
///
/// Deserialized from the `upstream` section of the configuration file.
///
/// # Examples
///
/// ```yaml
/// addr: "tls://1.1.1.1:853"
/// server_name: "cloudflare-dns.com"
/// pipeline: true
/// max_queries_per_connection: 16
/// ```
#[derive(Deserialize, Debug, Clone, Default)]
pub struct UpstreamConfig {
    /// Optional tag for identifying this upstream in logs
    pub tag: Option<String>,

    /// DNS server address in URL format
    ///
    /// - `tcp://9.9.9.9:53` or `9.9.9.9` - DNS over TCP
    /// - `tls://dns.google:853` - DNS over TLS (DoT)
    pub addr: String,

    /// TLS SNI and certificate name, defaults to the host of `addr`
    pub server_name: Option<String>,

    /// Direct IP address to connect to, bypassing hostname resolution
    pub dial_addr: Option<IpAddr>,

    /// Allow several outstanding queries per connection
    pub pipeline: Option<bool>,

    /// In-flight cap per pipelined connection, 0 = uncapped
    pub max_queries_per_connection: Option<usize>,

    /// Idle connection lifetime in seconds, overrides the derived default
    pub idle_timeout: Option<u64>,

    /// Skip TCP keep-alive and let every connection close itself when idle
    pub disable_keep_alive: Option<bool>,

    /// TCP keep-alive idle time in seconds
    pub tcp_keep_alive: Option<u64>,

    /// TCP keep-alive retry interval in seconds
    pub tcp_keep_alive_interval: Option<u64>,

    /// Keep plain TCP connections for reuse (TLS connections are always reused)
    pub reuse: Option<bool>,

    /// Dial and per-query timeout in seconds
    pub timeout: Option<u64>,

    /// Skip TLS certificate verification (**INSECURE**, testing only!)
    pub insecure_skip_verify: Option<bool>,

    /// Linux SO_MARK socket option for policy routing
    pub so_mark: Option<u32>,

    /// Linux SO_BINDTODEVICE, bind sockets to a network interface
    pub bind_to_device: Option<String>,
}

impl UpstreamConfig {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
    const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);
    const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(75);
    const NO_KEEP_ALIVE_IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

    fn timeout(&self) -> Duration {
        self.timeout
            .map(Duration::from_secs)
            .unwrap_or(Self::DEFAULT_TIMEOUT)
    }

    fn keep_alive(&self) -> (Duration, Duration) {
        (
            self.tcp_keep_alive
                .map(Duration::from_secs)
                .unwrap_or(Self::DEFAULT_KEEP_ALIVE),
            self.tcp_keep_alive_interval
                .map(Duration::from_secs)
                .unwrap_or(Self::DEFAULT_KEEP_ALIVE_INTERVAL),
        )
    }

    /// Connection reuse policy for this upstream
    pub fn transport_options(&self, connection_type: ConnectionType) -> TransportOptions {
        let pipeline = self.pipeline.unwrap_or(false);
        let disable_keep_alive = self.disable_keep_alive.unwrap_or(false);
        let reuse = connection_type == ConnectionType::DoT || pipeline || self.reuse.unwrap_or(false);

        let idle_timeout = match self.idle_timeout {
            Some(secs) => Duration::from_secs(secs),
            None if disable_keep_alive => Self::NO_KEEP_ALIVE_IDLE_TIMEOUT,
            None => {
                let (idle, interval) = self.keep_alive();
                idle + interval
            }
        };

        TransportOptions {
            reuse,
            pipeline,
            max_queries_per_connection: if pipeline {
                self.max_queries_per_connection.unwrap_or(0)
            } else {
                0
            },
            idle_timeout,
            disable_keep_alive,
            timeout: self.timeout(),
        }
    }

    fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            keep_alive: (!self.disable_keep_alive.unwrap_or(false)).then(|| self.keep_alive()),
            so_mark: self.so_mark,
            bind_to_device: self.bind_to_device.clone(),
        }
    }
}

/// Parsed form of `UpstreamConfig::addr`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAddr {
    pub connection_type: ConnectionType,
    pub host: String,
    pub port: u16,
}

/// Detect the connection type, host and port from the config address
///
/// An address without scheme is treated as plain TCP.
pub fn detect_connection_type(addr: &str) -> Result<UpstreamAddr> {
    let addr = addr.trim();
    if !addr.contains("//") {
        return detect_connection_type(&format!("tcp://{}", addr));
    }

    let url = Url::parse(addr)
        .map_err(|e| DnsError::config(format!("Invalid upstream URL '{}': {}", addr, e)))?;

    let connection_type = match url.scheme() {
        "tcp" => ConnectionType::TCP,
        "tls" => ConnectionType::DoT,
        other => {
            return Err(DnsError::config(format!(
                "Invalid upstream URL scheme: {}",
                other
            )));
        }
    };

    let host = match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        _ => {
            return Err(DnsError::config(format!(
                "Invalid upstream URL, no host specified: {}",
                addr
            )));
        }
    };

    let port = url.port().unwrap_or(connection_type.default_port());

    debug!(
        "Detected upstream: scheme={}, type={:?}, host={}, port={}",
        url.scheme(),
        connection_type,
        host,
        port
    );

    Ok(UpstreamAddr {
        connection_type,
        host,
        port,
    })
}

#[async_trait]
pub trait Upstream: Send + Sync + Debug {
    /// Prepare the upstream (address resolution, background reclamation)
    async fn start(&self) -> Result<()>;

    /// Send a DNS query and wait for the response
    async fn query(&self, request: Message) -> Result<Message>;

    /// Stop accepting queries and release pooled connections
    fn close(&self) -> Result<()>;

    /// Return the connection type of this upstream
    fn connection_type(&self) -> ConnectionType;
}

/// Pooled upstream resolver implementation
#[derive(Debug)]
pub struct PooledUpstream {
    connection_type: ConnectionType,
    transport: Arc<AdaptiveTransport<DnsCodec>>,
}

#[async_trait]
impl Upstream for PooledUpstream {
    async fn start(&self) -> Result<()> {
        self.transport.start().await
    }

    async fn query(&self, request: Message) -> Result<Message> {
        self.transport.exchange(request).await
    }

    fn close(&self) -> Result<()> {
        self.transport.close()
    }

    fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }
}

/// Builder for creating upstream instances
pub struct UpstreamBuilder;

impl UpstreamBuilder {
    /// Build an upstream instance from configuration
    pub fn with_upstream_config(config: &UpstreamConfig) -> Result<PooledUpstream> {
        let addr = detect_connection_type(&config.addr)?;
        let timeout = config.timeout();
        let options = config.transport_options(addr.connection_type);
        let tag = config.tag.clone().unwrap_or_else(|| config.addr.clone());

        let tcp = TcpDialer::new(
            addr.host.clone(),
            config.dial_addr,
            addr.port,
            timeout,
            config.socket_options(),
        );

        let dialer: Arc<dyn StreamDialer> = match addr.connection_type {
            ConnectionType::TCP => Arc::new(tcp),
            ConnectionType::DoT => {
                let server_name = config.server_name.as_deref().unwrap_or(&addr.host);
                Arc::new(TlsDialer::new(
                    tcp,
                    server_name,
                    config.insecure_skip_verify.unwrap_or(false),
                    timeout,
                )?)
            }
        };

        info!(
            tag = %tag,
            connection_type = ?addr.connection_type,
            host = %addr.host,
            port = addr.port,
            "Creating upstream"
        );

        Ok(PooledUpstream {
            connection_type: addr.connection_type,
            transport: AdaptiveTransport::new(tag, dialer, options),
        })
    }
}
