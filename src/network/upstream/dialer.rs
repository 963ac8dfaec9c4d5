/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Stream dialers used by the pooled transport
//!
//! A dialer opens one new byte stream to a fixed upstream address. The
//! transport never retries a failed dial; every error surfaces as
//! [`DnsError::Dial`].

use crate::core::error::{DnsError, Result};
use crate::network::tls_config::{insecure_client_config, secure_client_config};
use crate::network::transport::BoxedStream;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// ALPN identifier for DNS over TLS (RFC 7858)
const DOT_ALPN: &[u8] = b"dot";

/// Capability to open a new stream to the upstream
#[async_trait]
pub trait StreamDialer: Send + Sync + Debug + 'static {
    /// Warm-up run once when the transport starts
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Open a fresh stream
    async fn dial(&self) -> Result<BoxedStream>;
}

/// Socket level options applied to every dialed TCP connection
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    /// Keep-alive idle time and retry interval, `None` disables keep-alive
    pub keep_alive: Option<(Duration, Duration)>,
    pub so_mark: Option<u32>,
    pub bind_to_device: Option<String>,
}

/// Plain TCP dialer
pub struct TcpDialer {
    server_name: String,
    dial_ip: Option<IpAddr>,
    port: u16,
    timeout: Duration,
    socket_options: SocketOptions,
    /// Address resolved once and reused for every dial
    remote: OnceCell<SocketAddr>,
}

impl Debug for TcpDialer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpDialer")
            .field("server_name", &self.server_name)
            .field("port", &self.port)
            .field("remote", &self.remote.get())
            .finish()
    }
}

impl TcpDialer {
    pub fn new(
        server_name: String,
        dial_ip: Option<IpAddr>,
        port: u16,
        timeout: Duration,
        socket_options: SocketOptions,
    ) -> Self {
        Self {
            server_name,
            dial_ip,
            port,
            timeout,
            socket_options,
            remote: OnceCell::new(),
        }
    }

    /// Remote socket address: explicit IP, literal IP host, or system resolver
    async fn remote_addr(&self) -> Result<SocketAddr> {
        self.remote
            .get_or_try_init(|| async {
                if let Some(ip) = self.dial_ip {
                    return Ok(SocketAddr::new(ip, self.port));
                }
                if let Ok(ip) = self.server_name.parse::<IpAddr>() {
                    return Ok(SocketAddr::new(ip, self.port));
                }

                let mut addrs = lookup_host((self.server_name.as_str(), self.port))
                    .await
                    .map_err(|e| {
                        DnsError::dial(format!(
                            "System DNS resolution failed for '{}': {}",
                            self.server_name, e
                        ))
                    })?;
                let addr = addrs.next().ok_or_else(|| {
                    DnsError::dial(format!(
                        "System DNS returned no addresses for '{}'",
                        self.server_name
                    ))
                })?;
                info!(
                    server_name = %self.server_name,
                    resolved = %addr,
                    "Resolved upstream hostname using system DNS"
                );
                Ok::<SocketAddr, DnsError>(addr)
            })
            .await
            .copied()
    }

    fn configure_socket(&self, socket_addr: SocketAddr) -> std::io::Result<Socket> {
        let socket = Socket::new(
            Domain::for_address(socket_addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;

        socket.set_nonblocking(true)?;
        socket.set_tcp_nodelay(true)?;

        if let Some((idle, interval)) = self.socket_options.keep_alive {
            let keep_alive = TcpKeepalive::new().with_time(idle);
            #[cfg(any(target_os = "linux", target_os = "macos", windows))]
            let keep_alive = keep_alive.with_interval(interval);
            #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
            let _ = interval;
            socket.set_tcp_keepalive(&keep_alive)?;
        }

        // Linux-specific socket options for policy routing
        #[cfg(target_os = "linux")]
        if let Some(so_mark) = self.socket_options.so_mark {
            socket.set_mark(so_mark)?;
        }

        #[cfg(target_os = "linux")]
        if let Some(ref device) = self.socket_options.bind_to_device {
            socket.bind_device(Some(device.as_bytes()))?;
        }

        Ok(socket)
    }

    pub(crate) async fn connect(&self) -> Result<TcpStream> {
        let socket_addr = self.remote_addr().await?;
        let socket = self
            .configure_socket(socket_addr)
            .map_err(|e| DnsError::dial(format!("configure socket for {}: {}", socket_addr, e)))?;

        let std_stream: std::net::TcpStream = socket.into();
        let socket = TcpSocket::from_std_stream(std_stream);

        match timeout(self.timeout, socket.connect(socket_addr)).await {
            Ok(Ok(stream)) => {
                debug!(remote = %socket_addr, "Established TCP connection to upstream");
                Ok(stream)
            }
            Ok(Err(e)) => Err(DnsError::dial(format!("connect to {}: {}", socket_addr, e))),
            Err(_) => Err(DnsError::dial(format!("connect to {}: timeout", socket_addr))),
        }
    }
}

#[async_trait]
impl StreamDialer for TcpDialer {
    async fn initialize(&self) -> Result<()> {
        self.remote_addr().await.map(|_| ())
    }

    async fn dial(&self) -> Result<BoxedStream> {
        Ok(Box::new(self.connect().await?))
    }
}

/// DNS over TLS dialer: TCP connect followed by a bounded TLS handshake
pub struct TlsDialer {
    tcp: TcpDialer,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    timeout: Duration,
}

impl Debug for TlsDialer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsDialer")
            .field("tcp", &self.tcp)
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl TlsDialer {
    pub fn new(
        tcp: TcpDialer,
        server_name: &str,
        insecure_skip_verify: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let mut config = if insecure_skip_verify {
            insecure_client_config()
        } else {
            secure_client_config()
        };
        config.alpn_protocols = vec![DOT_ALPN.to_vec()];

        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| DnsError::config(format!("Invalid TLS server name: {}", server_name)))?;

        Ok(Self {
            tcp,
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
            timeout,
        })
    }
}

#[async_trait]
impl StreamDialer for TlsDialer {
    async fn initialize(&self) -> Result<()> {
        self.tcp.initialize().await
    }

    async fn dial(&self) -> Result<BoxedStream> {
        let stream = self.tcp.connect().await?;

        match timeout(
            self.timeout,
            self.connector.connect(self.server_name.clone(), stream),
        )
        .await
        {
            Ok(Ok(tls_stream)) => {
                debug!(server_name = ?self.server_name, "TLS handshake completed");
                Ok(Box::new(tls_stream))
            }
            Ok(Err(e)) => Err(DnsError::dial(format!("TLS handshake: {}", e))),
            Err(_) => Err(DnsError::dial("TLS handshake: timeout")),
        }
    }
}
