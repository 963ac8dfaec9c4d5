/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::core::error::{DnsError, Result};
use crate::network::transport::stream_transport::{
    StreamTransport, StreamTransportReader, StreamTransportWriter, encode_frame,
};
use crate::network::transport::{BoxedStream, QueryCodec};
use crate::network::upstream::pool::ConnOwner;
use crate::network::upstream::pool::detector::PipelineDetector;
use crate::network::upstream::pool::request_map::RequestMap;
use bytes::Bytes;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{Mutex, Notify, oneshot, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Per-connection behaviour derived from the transport options
#[derive(Debug, Clone)]
pub struct ConnOptions {
    /// Allow several outstanding queries; otherwise exchanges are serialized
    pub pipeline: bool,
    /// In-flight cap enforced by reservations, 0 = uncapped
    pub max_queries: usize,
    /// Per-query response timeout
    pub timeout: Duration,
    /// Close the connection after this long without an exchange
    pub idle_timeout: Option<Duration>,
}

/// One persistent upstream stream carrying one or more exchanges
///
/// Queries are written by a dedicated writer task from an unbounded queue of
/// complete frames and responses are demultiplexed by a reader task through
/// the [`RequestMap`]. Every outgoing query gets a fresh wire ID; the
/// caller's ID is restored on the response.
pub struct ReusableConn<C: QueryCodec> {
    id: u32,
    options: ConnOptions,
    sender: UnboundedSender<Bytes>,
    request_map: RequestMap<C::Message>,
    active_queries: AtomicUsize,
    /// Held for the whole round trip when pipelining is off
    serial: Mutex<()>,
    /// Flips to true exactly once
    closed: watch::Sender<bool>,
    idle_reset: Notify,
    owner: Option<Weak<dyn ConnOwner<C>>>,
    detector: Option<Arc<PipelineDetector>>,
}

impl<C: QueryCodec> Debug for ReusableConn<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReusableConn")
            .field("id", &self.id)
            .field("active_queries", &self.active_queries())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<C: QueryCodec> ReusableConn<C> {
    /// Wrap a freshly dialed stream and start its background tasks
    ///
    /// `owner` is told when the in-flight count drops back to zero; a
    /// connection without owner is single use and closed by whoever dialed it.
    pub(crate) fn spawn(
        id: u32,
        stream: BoxedStream,
        options: ConnOptions,
        owner: Option<Weak<dyn ConnOwner<C>>>,
        detector: Option<Arc<PipelineDetector>>,
    ) -> Arc<Self> {
        let (reader, writer) = StreamTransport::new(stream).into_split::<C>();
        let (sender, receiver) = unbounded_channel();
        let idle_timeout = options.idle_timeout;

        debug!(
            conn_id = id,
            pipeline = options.pipeline,
            max_queries = options.max_queries,
            "Upstream connection ready"
        );

        let conn = Arc::new(Self {
            id,
            options,
            sender,
            request_map: RequestMap::new(),
            active_queries: AtomicUsize::new(0),
            serial: Mutex::new(()),
            closed: watch::channel(false).0,
            idle_reset: Notify::new(),
            owner,
            detector,
        });

        tokio::spawn(conn.clone().listen_responses(reader));
        tokio::spawn(conn.clone().send_requests(writer, receiver));
        if let Some(idle_timeout) = idle_timeout {
            tokio::spawn(conn.clone().watch_idle(idle_timeout));
        }

        conn
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Queries currently reserved or in flight
    #[inline]
    pub fn active_queries(&self) -> usize {
        self.active_queries.load(Ordering::Acquire)
    }

    /// Non-blocking check of the close signal
    #[inline]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        wait_closed(&mut closed).await;
    }

    /// Send a query and wait for its response, counting it as in flight
    pub async fn exchange(self: &Arc<Self>, query: C::Message) -> Result<C::Message> {
        self.active_queries.fetch_add(1, Ordering::AcqRel);
        self.exchange_reserved(query, false).await
    }

    /// Like [`exchange`](Self::exchange), but any failure closes the
    /// connection before its slot is released, so the owner never gets it back
    pub async fn exchange_or_discard(self: &Arc<Self>, query: C::Message) -> Result<C::Message> {
        self.active_queries.fetch_add(1, Ordering::AcqRel);
        self.exchange_reserved(query, true).await
    }

    /// Same as [`exchange`](Self::exchange) for a query already accounted for by
    /// [`try_reserve`](Self::try_reserve)
    pub async fn exchange_without_increment(
        self: &Arc<Self>,
        query: C::Message,
    ) -> Result<C::Message> {
        self.exchange_reserved(query, false).await
    }

    /// Take one slot of the in-flight budget if `cap` allows it (0 = no cap)
    pub(crate) fn try_reserve(&self, cap: usize) -> bool {
        self.active_queries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (cap == 0 || count < cap).then_some(count + 1)
            })
            .is_ok()
    }

    pub fn close(&self) {
        self.close_with_error(DnsError::connection_closed("closed locally"));
    }

    /// Close once, failing every pending query with a copy of `error`
    pub(crate) fn close_with_error(&self, error: DnsError) {
        let first = self
            .closed
            .send_if_modified(|closed| !std::mem::replace(closed, true));
        if !first {
            return;
        }
        debug!(conn_id = self.id, reason = %error, "Closing upstream connection");
        self.request_map.close(&error);
    }

    async fn exchange_reserved(
        self: &Arc<Self>,
        query: C::Message,
        discard_on_error: bool,
    ) -> Result<C::Message> {
        // Created before the first await so a dropped caller still releases the slot
        let _in_flight = InFlight { conn: self.clone() };
        self.idle_reset.notify_one();

        let result = if self.options.pipeline {
            self.round_trip(query).await
        } else {
            let _serial = self.serial.lock().await;
            self.round_trip(query).await
        };

        self.idle_reset.notify_one();
        if discard_on_error && let Err(e) = &result {
            self.close_with_error(DnsError::connection_closed(format!(
                "discarded after failed exchange: {}",
                e
            )));
        }
        result
    }

    async fn round_trip(&self, mut query: C::Message) -> Result<C::Message> {
        let original_id = C::message_id(&query);
        let (tx, rx) = oneshot::channel();
        let query_id = self.request_map.store(tx)?;
        let mut pending = PendingQuery {
            map: &self.request_map,
            id: query_id,
            armed: true,
        };

        C::set_message_id(&mut query, query_id);
        let frame = encode_frame::<C>(&query)?;
        if self.sender.send(frame).is_err() {
            return Err(DnsError::connection_closed(
                "write request: connection writer stopped",
            ));
        }

        debug!(
            conn_id = self.id,
            query_id,
            active_queries = self.active_queries(),
            "Sent query upstream"
        );

        match timeout(self.options.timeout, rx).await {
            Ok(received) => {
                // Whoever completed the oneshot already removed the entry
                pending.armed = false;
                match received {
                    Ok(Ok(mut response)) => {
                        C::set_message_id(&mut response, original_id);
                        Ok(response)
                    }
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(DnsError::connection_closed("response channel dropped")),
                }
            }
            Err(_) => {
                warn!(
                    conn_id = self.id,
                    query_id,
                    timeout_ms = self.options.timeout.as_millis() as u64,
                    "Query timed out waiting for upstream response"
                );
                Err(DnsError::Timeout)
            }
        }
    }

    fn finish_query(self: &Arc<Self>) {
        let previous = self
            .active_queries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });

        match previous {
            Ok(1) => {
                if let Some(owner) = self.owner.as_ref().and_then(Weak::upgrade) {
                    owner.release(self);
                }
            }
            Ok(_) => {}
            Err(_) => warn!(
                conn_id = self.id,
                "In-flight counter underflow (exchange without reservation)"
            ),
        }
    }

    /// Background task: demultiplex responses to their waiters
    async fn listen_responses(self: Arc<Self>, mut reader: StreamTransportReader<BoxedStream, C>) {
        let mut closed = self.closed.subscribe();
        let mut last_id = 0u16;

        loop {
            select! {
                res = reader.read_message() => match res {
                    Ok(response) => self.dispatch_response(response, &mut last_id),
                    Err(e) => {
                        debug!(conn_id = self.id, error = %e, "Upstream read failed");
                        self.close_with_error(e);
                        break;
                    }
                },
                _ = wait_closed(&mut closed) => break,
            }
        }

        debug!(conn_id = self.id, "Response listener exited");
    }

    fn dispatch_response(&self, response: C::Message, last_id: &mut u16) {
        let id = C::message_id(&response);
        let Some(tx) = self.request_map.take(id) else {
            // Typically the answer to a query that already timed out
            warn!(conn_id = self.id, query_id = id, "Discarded response for unknown query ID");
            return;
        };

        if self.options.pipeline
            && let Some(detector) = &self.detector
        {
            detector.record_response(*last_id, id);
        }
        *last_id = id;

        if tx.send(Ok(response)).is_err() {
            debug!(conn_id = self.id, query_id = id, "Waiter gone before response delivery");
        }
    }

    /// Background task: write queued frames in order
    async fn send_requests(
        self: Arc<Self>,
        mut writer: StreamTransportWriter<BoxedStream>,
        mut receiver: UnboundedReceiver<Bytes>,
    ) {
        let mut closed = self.closed.subscribe();

        loop {
            select! {
                frame = receiver.recv() => {
                    let Some(frame) = frame else { break };
                    select! {
                        res = writer.write_frame(&frame) => {
                            if let Err(e) = res {
                                debug!(conn_id = self.id, error = %e, "Upstream write failed");
                                self.close_with_error(e);
                                break;
                            }
                        }
                        _ = wait_closed(&mut closed) => break,
                    }
                }
                _ = wait_closed(&mut closed) => break,
            }
        }

        // Best effort: a peer that stopped reading must not pin this task
        let _ = timeout(Duration::from_secs(1), writer.shutdown()).await;
        debug!(conn_id = self.id, "Request writer exited");
    }

    /// Background task: close the connection after a quiet period
    async fn watch_idle(self: Arc<Self>, idle_timeout: Duration) {
        let mut closed = self.closed.subscribe();

        loop {
            select! {
                _ = self.idle_reset.notified() => {}
                _ = sleep(idle_timeout) => {
                    if self.active_queries() == 0 {
                        debug!(
                            conn_id = self.id,
                            idle_ms = idle_timeout.as_millis() as u64,
                            "Closing idle upstream connection"
                        );
                        self.close_with_error(DnsError::connection_closed("idle timeout"));
                        break;
                    }
                }
                _ = wait_closed(&mut closed) => break,
            }
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Releases one in-flight slot on every exit path
struct InFlight<C: QueryCodec> {
    conn: Arc<ReusableConn<C>>,
}

impl<C: QueryCodec> Drop for InFlight<C> {
    fn drop(&mut self) {
        self.conn.finish_query();
    }
}

/// Removes a query ID that never got an answer (timeout or dropped caller)
struct PendingQuery<'a, M> {
    map: &'a RequestMap<M>,
    id: u16,
    armed: bool,
}

impl<M> Drop for PendingQuery<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            self.map.take(self.id);
        }
    }
}
