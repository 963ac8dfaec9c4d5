/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! dotpool - a small UDP DNS forwarder on top of the pooled upstream transport
//!
//! - Receives DNS queries on the configured UDP address
//! - Forwards each one through a single pooled TCP/DoT upstream
//! - Answers SERVFAIL when the upstream fails
//! - Graceful shutdown on Ctrl+C

use dotpool::config;
use dotpool::core::error::{DnsError, Result};
use dotpool::network::tls_config::install_default_provider;
use dotpool::network::upstream::{PooledUpstream, Upstream, UpstreamBuilder};
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::{runtime, signal};
use tracing::{debug, error, info, warn};

/// Largest datagram accepted on the listening socket
const MAX_UDP_MESSAGE: usize = 65535;

/// Application entry point
fn main() -> Result<()> {
    init_runtime()
}

/// Initialize and run the Tokio runtime with multi-threading enabled
fn init_runtime() -> Result<()> {
    let mut tokio_runtime = runtime::Builder::new_multi_thread();
    tokio_runtime.enable_all().thread_name("dotpool-worker");
    let tokio_runtime = tokio_runtime
        .build()
        .map_err(|err| DnsError::runtime(format!("Failed to initialize Tokio runtime: {err}")))?;
    tokio_runtime.block_on(run_async_main())
}

/// Main async runtime loop
///
/// Sets up signal handlers, builds the upstream and serves until Ctrl+C.
async fn run_async_main() -> Result<()> {
    // Create shutdown channel for graceful termination
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C signal, initiating graceful shutdown");
        let _ = shutdown_tx.send(());
    });

    let mut runtime = dotpool::core::init();
    let options = runtime.options.clone();

    let config = match config::init(&options.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration initialization failed: {}", e);
            std::process::exit(1);
        }
    };

    // Override log level from command line if provided
    let mut log_config = config.log.clone();
    if let Some(level) = options.log_level {
        log_config.level = level;
    }

    // Keep the guard so buffered log lines are flushed on exit
    runtime.log_guard = Some(dotpool::core::init_log(log_config)?);
    info!("Loaded configuration from: {:?}", options.config);

    install_default_provider();
    let upstream = Arc::new(UpstreamBuilder::with_upstream_config(&config.upstream)?);
    upstream.start().await?;

    let socket = Arc::new(UdpSocket::bind(&config.listen).await?);
    info!(listen = %config.listen, "dotpool forwarder started");

    let mut buf = vec![0u8; MAX_UDP_MESSAGE];
    loop {
        let (len, src) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "error receiving message on udp socket");
                    continue;
                }
            },
            _ = &mut shutdown_rx => break,
        };

        let request = match Message::from_bytes(&buf[..len]) {
            Ok(request) => request,
            Err(e) => {
                debug!(%src, error = %e, "Dropping malformed query");
                continue;
            }
        };

        let upstream = upstream.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            handle_request(request, src, upstream, socket).await;
        });
    }

    info!("Closing upstream for shutdown");
    upstream.close()?;
    info!("Graceful shutdown complete");
    Ok(())
}

async fn handle_request(
    request: Message,
    src: SocketAddr,
    upstream: Arc<PooledUpstream>,
    socket: Arc<UdpSocket>,
) {
    debug!(%src, id = request.id(), queries = ?request.queries(), "dns request");

    let response = match upstream.query(request.clone()).await {
        Ok(response) => response,
        Err(e) => {
            warn!(%src, id = request.id(), error = %e, "Upstream query failed");
            build_servfail_response(&request)
        }
    };

    match response.to_bytes() {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, src).await {
                warn!(%src, error = %e, "Failed to send response");
            }
        }
        Err(e) => warn!(%src, error = %e, "Failed to serialize response"),
    }
}

fn build_servfail_response(request: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_op_code(request.op_code());
    response.set_message_type(MessageType::Response);
    response.set_response_code(ResponseCode::ServFail);
    *response.queries_mut() = request.queries().to_vec();
    response
}
