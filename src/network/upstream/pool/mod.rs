/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Connection pooling infrastructure for stream upstreams
//!
//! # Components
//!
//! ## Expiring pool (`expiring.rs`)
//! - Generic container of idle resources, each with a deadline
//! - Earliest deadline out first, background reclamation of expired items
//!
//! ## Reusable connection (`conn_stream.rs`)
//! - One persistent TCP/TLS stream with reader and writer tasks
//! - Correlates out-of-order responses by rewritten query ID
//! - Atomic in-flight counter with reservation support
//!
//! ## Adaptive transport (`transport.rs`)
//! - Routes each exchange to an idle, active or freshly dialed connection
//! - Keeps capped pipelined connections in an active registry
//! - Learns whether the upstream really pipelines (`detector.rs`)

mod request_map;

pub mod conn_stream;
pub mod detector;
pub mod expiring;
pub mod transport;

use crate::network::transport::QueryCodec;
use crate::network::upstream::pool::conn_stream::ReusableConn;
use std::sync::Arc;

/// Whoever hands connections out gets them back through this seam
///
/// Called by a connection when its in-flight count drops to zero.
pub(crate) trait ConnOwner<C: QueryCodec>: Send + Sync + 'static {
    fn release(&self, conn: &Arc<ReusableConn<C>>);
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory upstreams speaking the length-prefixed framing

    use crate::core::error::{DnsError, Result};
    use crate::network::transport::BoxedStream;
    use crate::network::upstream::dialer::StreamDialer;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, duplex, split};
    use tokio::sync::mpsc::unbounded_channel;

    #[derive(Debug, Clone, Copy)]
    pub enum Behavior {
        /// Echo every frame after the delay, replies run concurrently
        Echo(Duration),
        /// Collect this many frames, then answer them newest first
        ReverseBatch(usize),
        /// Read everything, answer nothing
        Silent,
        /// Answer this many frames, drop the stream on the next one
        DropAfter(usize),
        /// Answer this many frames, then keep reading without answering
        SilentAfter(usize),
    }

    #[derive(Debug, Default)]
    pub struct ServerStats {
        outstanding: AtomicUsize,
        max_outstanding: AtomicUsize,
        wire_ids: Mutex<Vec<u16>>,
    }

    impl ServerStats {
        pub fn max_outstanding(&self) -> usize {
            self.max_outstanding.load(Ordering::SeqCst)
        }

        pub fn wire_ids(&self) -> Vec<u16> {
            self.wire_ids.lock().unwrap().clone()
        }
    }

    async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Option<Vec<u8>> {
        let mut len = [0u8; 2];
        reader.read_exact(&mut len).await.ok()?;
        let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
        reader.read_exact(&mut body).await.ok()?;
        Some(body)
    }

    pub async fn serve(stream: DuplexStream, behavior: Behavior, stats: Arc<ServerStats>) {
        let (mut reader, mut writer) = split(stream);
        let (tx, mut rx) = unbounded_channel::<Vec<u8>>();

        let writer_stats = stats.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                writer_stats.outstanding.fetch_sub(1, Ordering::SeqCst);
                let mut frame = (body.len() as u16).to_be_bytes().to_vec();
                frame.extend_from_slice(&body);
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        let mut answered = 0usize;
        let mut batch = Vec::new();
        while let Some(body) = read_frame(&mut reader).await {
            if let Behavior::DropAfter(limit) = behavior
                && answered >= limit
            {
                break;
            }

            let id = u16::from_be_bytes([body[0], body[1]]);
            stats.wire_ids.lock().unwrap().push(id);
            let now = stats.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
            stats.max_outstanding.fetch_max(now, Ordering::SeqCst);

            match behavior {
                Behavior::Echo(delay) if delay.is_zero() => {
                    let _ = tx.send(body);
                }
                Behavior::Echo(delay) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(body);
                    });
                }
                Behavior::ReverseBatch(size) => {
                    batch.push(body);
                    if batch.len() == size {
                        for body in batch.drain(..).rev() {
                            let _ = tx.send(body);
                        }
                    }
                }
                Behavior::Silent => {}
                Behavior::DropAfter(_) => {
                    answered += 1;
                    let _ = tx.send(body);
                }
                Behavior::SilentAfter(limit) => {
                    if answered < limit {
                        answered += 1;
                        let _ = tx.send(body);
                    }
                }
            }
        }

        if matches!(behavior, Behavior::DropAfter(_)) {
            // Tear the whole stream down, not just the read half
            writer_task.abort();
        }
        drop(tx);
    }

    /// Dialer handing out in-memory streams, one server task per dial
    #[derive(Debug)]
    pub struct MockDialer {
        default: Behavior,
        script: Mutex<VecDeque<Behavior>>,
        dials: AtomicUsize,
        initialized: AtomicBool,
        refuse: AtomicBool,
        servers: Mutex<Vec<Arc<ServerStats>>>,
    }

    impl MockDialer {
        pub fn new(default: Behavior) -> Arc<Self> {
            Self::scripted(default, Vec::new())
        }

        /// The first dials follow `script`, later ones `default`
        pub fn scripted(default: Behavior, script: Vec<Behavior>) -> Arc<Self> {
            Arc::new(Self {
                default,
                script: Mutex::new(script.into()),
                dials: AtomicUsize::new(0),
                initialized: AtomicBool::new(false),
                refuse: AtomicBool::new(false),
                servers: Mutex::new(Vec::new()),
            })
        }

        pub fn refuse_dials(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }

        pub fn dial_count(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }

        pub fn is_initialized(&self) -> bool {
            self.initialized.load(Ordering::SeqCst)
        }

        pub fn servers(&self) -> Vec<Arc<ServerStats>> {
            self.servers.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StreamDialer for MockDialer {
        async fn initialize(&self) -> Result<()> {
            self.initialized.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn dial(&self) -> Result<BoxedStream> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(DnsError::dial("connect to mock upstream: refused"));
            }
            self.dials.fetch_add(1, Ordering::SeqCst);

            let behavior = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.default);
            let (client, server) = duplex(64 * 1024);
            let stats = Arc::new(ServerStats::default());
            self.servers.lock().unwrap().push(stats.clone());
            tokio::spawn(serve(server, behavior, stats));
            Ok(Box::new(client))
        }
    }
}
