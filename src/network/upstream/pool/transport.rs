/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Adaptive pooled transport
//!
//! Picks a connection for every exchange according to how the upstream is
//! configured:
//!
//! 1. No reuse: dial, run one query, close.
//! 2. Pipelining without a per-connection cap: take any idle connection or dial.
//! 3. Pipelining with a cap: prefer an active connection with nothing in
//!    flight, then an idle one, then an active one with spare capacity, and
//!    only then dial. Capped connections live in the active registry while
//!    they carry queries and go back to the idle pool when they drain.
//! 4. No pipelining: take an idle connection and fall back to exactly one
//!    fresh connection if it turns out to be dead.
//!
//! Lock order is active registry before idle pool; the reclamation loop of
//! the idle pool never touches the registry.

use crate::core::error::{DnsError, Result};
use crate::network::transport::QueryCodec;
use crate::network::upstream::dialer::StreamDialer;
use crate::network::upstream::pool::ConnOwner;
use crate::network::upstream::pool::conn_stream::{ConnOptions, ReusableConn};
use crate::network::upstream::pool::detector::PipelineDetector;
use crate::network::upstream::pool::expiring::ExpiringPool;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

type ConnList<C> = Vec<Arc<ReusableConn<C>>>;

/// Connection reuse policy of one transport
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Keep connections after use; without it every query gets its own connection
    pub reuse: bool,
    /// Allow several outstanding queries per connection
    pub pipeline: bool,
    /// In-flight cap per pipelined connection, 0 = uncapped (forced to 0 without pipelining)
    pub max_queries_per_connection: usize,
    /// How long an unused connection may sit in the idle pool
    pub idle_timeout: Duration,
    /// Also close each connection on its own after `idle_timeout` without traffic
    pub disable_keep_alive: bool,
    /// Per-query response timeout
    pub timeout: Duration,
}

pub struct AdaptiveTransport<C: QueryCodec> {
    this: Weak<Self>,
    tag: String,
    dialer: Arc<dyn StreamDialer>,
    options: TransportOptions,
    /// Absent when connections are not reused
    idle_pool: Option<ExpiringPool<Arc<ReusableConn<C>>>>,
    active_conns: Mutex<ConnList<C>>,
    detector: Arc<PipelineDetector>,
    closed: AtomicBool,
    next_conn_id: AtomicU32,
}

impl<C: QueryCodec> Debug for AdaptiveTransport<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveTransport")
            .field("tag", &self.tag)
            .field("dialer", &self.dialer)
            .field("options", &self.options)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<C: QueryCodec> AdaptiveTransport<C> {
    pub fn new(
        tag: impl Into<String>,
        dialer: Arc<dyn StreamDialer>,
        mut options: TransportOptions,
    ) -> Arc<Self> {
        if !options.pipeline {
            options.max_queries_per_connection = 0;
        }

        let idle_pool = options.reuse.then(|| {
            ExpiringPool::new(options.idle_timeout, |conn: Arc<ReusableConn<C>>| {
                debug!(conn_id = conn.id(), "Closing expired idle connection");
                conn.close();
            })
        });

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            tag: tag.into(),
            dialer,
            options,
            idle_pool,
            active_conns: Mutex::new(Vec::new()),
            detector: Arc::new(PipelineDetector::new()),
            closed: AtomicBool::new(false),
            next_conn_id: AtomicU32::new(0),
        })
    }

    /// Warm up the dialer and start idle connection reclamation
    pub async fn start(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DnsError::TransportClosed);
        }

        self.dialer.initialize().await?;
        if let Some(idle_pool) = &self.idle_pool {
            idle_pool.start();
        }

        info!(
            tag = %self.tag,
            reuse = self.options.reuse,
            pipeline = self.options.pipeline,
            max_queries = self.options.max_queries_per_connection,
            idle_timeout_ms = self.options.idle_timeout.as_millis() as u64,
            "Upstream transport started"
        );
        Ok(())
    }

    /// Send one query and wait for the matching response
    pub async fn exchange(&self, query: C::Message) -> Result<C::Message> {
        if self.is_closed() {
            return Err(DnsError::TransportClosed);
        }

        let Some(idle_pool) = &self.idle_pool else {
            return self.exchange_single_use(query).await;
        };

        if !self.options.pipeline {
            self.exchange_with_fallback(idle_pool, query).await
        } else if self.options.max_queries_per_connection == 0 {
            self.exchange_uncapped(idle_pool, query).await
        } else {
            self.exchange_capped(idle_pool, query).await
        }
    }

    /// Stop accepting queries and close every idle connection
    ///
    /// Queries already in flight finish on their connections, which are then
    /// closed instead of being pooled.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!(tag = %self.tag, "Closing upstream transport");
        if let Some(idle_pool) = &self.idle_pool {
            idle_pool.close();
        }
        Ok(())
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the upstream has been observed answering queries out of order
    pub fn pipeline_detected(&self) -> bool {
        self.detector.is_detected()
    }

    pub fn idle_connections(&self) -> usize {
        self.idle_pool.as_ref().map_or(0, ExpiringPool::len)
    }

    pub fn active_connections(&self) -> usize {
        self.lock_active().len()
    }

    #[inline]
    fn capped(&self) -> bool {
        self.options.pipeline && self.options.max_queries_per_connection > 0
    }

    #[inline]
    fn lock_active(&self) -> MutexGuard<'_, ConnList<C>> {
        self.active_conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn conn_options(&self) -> ConnOptions {
        ConnOptions {
            pipeline: self.options.pipeline,
            max_queries: self.options.max_queries_per_connection,
            timeout: self.options.timeout,
            idle_timeout: (self.options.reuse && self.options.disable_keep_alive)
                .then_some(self.options.idle_timeout),
        }
    }

    async fn dial_conn(&self, pooled: bool) -> Result<Arc<ReusableConn<C>>> {
        let stream = self.dialer.dial().await.map_err(|e| match e {
            DnsError::Dial(_) => e,
            other => DnsError::dial(other.to_string()),
        })?;

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let owner = pooled.then(|| {
            let owner: Weak<dyn ConnOwner<C>> = self.this.clone();
            owner
        });
        let detector = self.options.pipeline.then(|| self.detector.clone());

        debug!(tag = %self.tag, conn_id, pooled, "Dialed new upstream connection");
        Ok(ReusableConn::spawn(
            conn_id,
            stream,
            self.conn_options(),
            owner,
            detector,
        ))
    }

    /// Pop idle connections until one that is still open turns up
    fn get_valid_conn_from_pool(
        &self,
        idle_pool: &ExpiringPool<Arc<ReusableConn<C>>>,
    ) -> Option<Arc<ReusableConn<C>>> {
        while let Some(conn) = idle_pool.get() {
            if !conn.is_closed() {
                debug!(conn_id = conn.id(), "Reusing idle upstream connection");
                return Some(conn);
            }
            debug!(conn_id = conn.id(), "Dropping closed connection from idle pool");
        }
        None
    }

    /// Rule 1: one connection per query
    async fn exchange_single_use(&self, query: C::Message) -> Result<C::Message> {
        let conn = self.dial_conn(false).await?;
        let _single_use = CloseOnDrop(conn.clone());
        conn.exchange(query).await
    }

    /// Rule 2: pipelining, no cap
    async fn exchange_uncapped(
        &self,
        idle_pool: &ExpiringPool<Arc<ReusableConn<C>>>,
        query: C::Message,
    ) -> Result<C::Message> {
        let conn = match self.get_valid_conn_from_pool(idle_pool) {
            Some(conn) => conn,
            None => self.dial_conn(true).await?,
        };
        conn.exchange(query).await
    }

    /// Rule 3: pipelining with a per-connection cap
    async fn exchange_capped(
        &self,
        idle_pool: &ExpiringPool<Arc<ReusableConn<C>>>,
        query: C::Message,
    ) -> Result<C::Message> {
        let cap = self.options.max_queries_per_connection;

        let conn = match self
            .find_and_reserve_active_conn(cap)
            .or_else(|| self.promote_idle_conn(idle_pool, cap))
            .or_else(|| self.reserve_least_loaded_conn(cap))
        {
            Some(conn) => conn,
            None => self.dial_active_conn(cap).await?,
        };

        // Reserved above, no await in between
        conn.exchange_without_increment(query).await
    }

    /// Rule 4: no pipelining, one transparent retry for a stale idle connection
    async fn exchange_with_fallback(
        &self,
        idle_pool: &ExpiringPool<Arc<ReusableConn<C>>>,
        query: C::Message,
    ) -> Result<C::Message> {
        if let Some(conn) = self.get_valid_conn_from_pool(idle_pool) {
            // A failed connection is closed before release so it is never pooled again
            match conn.exchange_or_discard(query.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => debug!(
                    tag = %self.tag,
                    conn_id = conn.id(),
                    error = %e,
                    "Idle connection failed, retrying on a new connection"
                ),
            }
        }

        let conn = self.dial_conn(true).await?;
        conn.exchange(query).await
    }

    /// Reserve the least loaded active connection, but only if it is fully idle
    ///
    /// A scan that runs into closed connections compacts the registry and
    /// reserves nothing.
    fn find_and_reserve_active_conn(&self, cap: usize) -> Option<Arc<ReusableConn<C>>> {
        let mut active = self.lock_active();

        let mut best: Option<(usize, usize)> = None;
        let mut found_closed = false;
        for (index, conn) in active.iter().enumerate() {
            if conn.is_closed() {
                found_closed = true;
                continue;
            }
            let count = conn.active_queries();
            if best.is_none_or(|(_, best_count)| count < best_count) {
                best = Some((index, count));
            }
        }

        if found_closed {
            let before = active.len();
            active.retain(|conn| !conn.is_closed());
            debug!(
                tag = %self.tag,
                removed = before - active.len(),
                "Compacted active connection registry"
            );
            return None;
        }

        match best {
            Some((index, 0)) if active[index].try_reserve(cap) => {
                let conn = active[index].clone();
                debug!(conn_id = conn.id(), "Reserved idle active connection");
                Some(conn)
            }
            _ => None,
        }
    }

    /// Move an idle pool connection into the active registry, reserved
    fn promote_idle_conn(
        &self,
        idle_pool: &ExpiringPool<Arc<ReusableConn<C>>>,
        cap: usize,
    ) -> Option<Arc<ReusableConn<C>>> {
        let conn = self.get_valid_conn_from_pool(idle_pool)?;
        if !conn.try_reserve(cap) {
            warn!(conn_id = conn.id(), "Idle connection still busy, returning it");
            idle_pool.put(conn);
            return None;
        }
        self.add_active_conn(&conn);
        Some(conn)
    }

    /// Reserve the least loaded active connection that still has room
    fn reserve_least_loaded_conn(&self, cap: usize) -> Option<Arc<ReusableConn<C>>> {
        let active = self.lock_active();
        let conn = active
            .iter()
            .filter(|conn| !conn.is_closed())
            .min_by_key(|conn| conn.active_queries())?;

        if conn.try_reserve(cap) {
            debug!(
                conn_id = conn.id(),
                active_queries = conn.active_queries(),
                "Sharing active connection"
            );
            Some(conn.clone())
        } else {
            None
        }
    }

    async fn dial_active_conn(&self, cap: usize) -> Result<Arc<ReusableConn<C>>> {
        let conn = self.dial_conn(true).await?;
        let reserved = conn.try_reserve(cap);
        debug_assert!(reserved, "fresh connection must have capacity");
        self.add_active_conn(&conn);
        Ok(conn)
    }

    fn add_active_conn(&self, conn: &Arc<ReusableConn<C>>) {
        let mut active = self.lock_active();
        if !active.iter().any(|c| Arc::ptr_eq(c, conn)) {
            active.push(conn.clone());
        }
    }

    fn return_idle_conn(&self, conn: &Arc<ReusableConn<C>>) {
        if conn.is_closed() {
            return;
        }
        let Some(idle_pool) = &self.idle_pool else {
            conn.close();
            return;
        };
        if self.is_closed() {
            conn.close();
            return;
        }

        idle_pool.put(conn.clone());
        debug!(
            conn_id = conn.id(),
            idle = idle_pool.len(),
            "Connection returned to idle pool"
        );

        // close() may have drained the pool between the check and the put
        if self.is_closed() {
            idle_pool.close();
        }
    }
}

impl<C: QueryCodec> ConnOwner<C> for AdaptiveTransport<C> {
    fn release(&self, conn: &Arc<ReusableConn<C>>) {
        if !self.capped() {
            self.return_idle_conn(conn);
            return;
        }

        let mut active = self.lock_active();
        // Reserved again between the decrement and this lock
        if conn.active_queries() != 0 {
            return;
        }
        // A late release for a connection someone else already pooled
        if !remove_active_conn(&mut active, conn) {
            return;
        }
        self.return_idle_conn(conn);
    }
}

/// Returns false when `conn` was not registered
fn remove_active_conn<C: QueryCodec>(
    active: &mut ConnList<C>,
    conn: &Arc<ReusableConn<C>>,
) -> bool {
    match active.iter().position(|c| Arc::ptr_eq(c, conn)) {
        Some(index) => {
            active.swap_remove(index);
            true
        }
        None => false,
    }
}

/// Closes a single-use connection on every exit path
struct CloseOnDrop<C: QueryCodec>(Arc<ReusableConn<C>>);

impl<C: QueryCodec> Drop for CloseOnDrop<C> {
    fn drop(&mut self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::test_codec::{EchoCodec, EchoMessage};
    use crate::network::upstream::pool::testing::{Behavior, MockDialer};
    use futures::future::join_all;
    use tokio::time::sleep;

    fn options(reuse: bool, pipeline: bool, max_queries: usize) -> TransportOptions {
        TransportOptions {
            reuse,
            pipeline,
            max_queries_per_connection: max_queries,
            idle_timeout: Duration::from_secs(2),
            disable_keep_alive: false,
            timeout: Duration::from_secs(2),
        }
    }

    fn transport(
        dialer: &Arc<MockDialer>,
        options: TransportOptions,
    ) -> Arc<AdaptiveTransport<EchoCodec>> {
        AdaptiveTransport::new("test", dialer.clone(), options)
    }

    fn spawn_query(
        transport: &Arc<AdaptiveTransport<EchoCodec>>,
        id: u16,
    ) -> tokio::task::JoinHandle<Result<EchoMessage>> {
        let transport = transport.clone();
        tokio::spawn(async move {
            let payload = id.to_le_bytes();
            let response = transport.exchange(EchoMessage::new(id, &payload)).await?;
            assert_eq!(response, EchoMessage::new(id, &payload));
            Ok(response)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_concurrent_queries_use_two_capped_connections() {
        let dialer = MockDialer::new(Behavior::Echo(Duration::from_millis(50)));
        let transport = transport(&dialer, options(true, true, 2));
        transport.start().await.unwrap();

        let handles: Vec<_> = (1..=3).map(|id| spawn_query(&transport, id)).collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(dialer.dial_count(), 2);
        assert_eq!(transport.active_connections(), 0);
        assert_eq!(transport.idle_connections(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_never_exceeded_under_load() {
        for cap in [1usize, 3] {
            let dialer = MockDialer::new(Behavior::Echo(Duration::from_millis(5)));
            let transport = transport(&dialer, options(true, true, cap));
            transport.start().await.unwrap();

            let handles: Vec<_> = (0..64).map(|id| spawn_query(&transport, id)).collect();
            for result in join_all(handles).await {
                result.unwrap().unwrap();
            }

            let servers = dialer.servers();
            assert!(!servers.is_empty());
            for server in servers {
                assert!(
                    server.max_outstanding() <= cap,
                    "cap {} exceeded: {}",
                    cap,
                    server.max_outstanding()
                );
            }
            transport.close().unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_connection_reservations_respect_cap() {
        let dialer = MockDialer::new(Behavior::Silent);
        let transport = transport(&dialer, options(true, true, 2));

        let _handles: Vec<_> = (1..=5).map(|id| spawn_query(&transport, id)).collect();
        tokio::task::yield_now().await;

        // 5 queries with cap 2 need 3 connections
        assert_eq!(dialer.dial_count(), 3);
        for conn in transport.lock_active().iter() {
            assert!(conn.active_queries() <= 2);
        }
    }

    #[tokio::test]
    async fn test_stale_idle_connection_falls_back_to_new_one() {
        let dialer = MockDialer::scripted(
            Behavior::Echo(Duration::ZERO),
            vec![Behavior::DropAfter(1)],
        );
        let transport = transport(&dialer, options(true, false, 0));
        transport.start().await.unwrap();

        transport.exchange(EchoMessage::new(1, b"first")).await.unwrap();
        assert_eq!(transport.idle_connections(), 1);

        // The pooled connection dies only once the next query reaches the peer
        let response = transport.exchange(EchoMessage::new(2, b"second")).await.unwrap();
        assert_eq!(response, EchoMessage::new(2, b"second"));
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_closed_idle_connection_is_skipped() {
        let dialer = MockDialer::new(Behavior::Echo(Duration::ZERO));
        let transport = transport(&dialer, options(true, true, 0));

        transport.exchange(EchoMessage::new(1, b"a")).await.unwrap();
        let idle_pool = transport.idle_pool.as_ref().unwrap();
        let conn = idle_pool.get().unwrap();
        conn.close();
        idle_pool.put(conn);

        transport.exchange(EchoMessage::new(2, b"b")).await.unwrap();
        assert_eq!(dialer.dial_count(), 2);
        assert_eq!(transport.idle_connections(), 1);
    }

    #[tokio::test]
    async fn test_uncapped_pipeline_reuses_idle_connection() {
        let dialer = MockDialer::new(Behavior::Echo(Duration::ZERO));
        let transport = transport(&dialer, options(true, true, 0));

        for id in 1..=3 {
            transport.exchange(EchoMessage::new(id, b"q")).await.unwrap();
        }
        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(transport.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_capped_pipeline_promotes_idle_connection() {
        let dialer = MockDialer::new(Behavior::Echo(Duration::ZERO));
        let transport = transport(&dialer, options(true, true, 4));

        transport.exchange(EchoMessage::new(1, b"a")).await.unwrap();
        assert_eq!(transport.idle_connections(), 1);
        assert_eq!(transport.active_connections(), 0);

        transport.exchange(EchoMessage::new(2, b"b")).await.unwrap();
        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(transport.idle_connections(), 1);
    }

    #[tokio::test]
    async fn test_without_reuse_every_query_dials() {
        let dialer = MockDialer::new(Behavior::Echo(Duration::ZERO));
        let transport = transport(&dialer, options(false, false, 0));

        transport.exchange(EchoMessage::new(1, b"a")).await.unwrap();
        transport.exchange(EchoMessage::new(2, b"b")).await.unwrap();
        assert_eq!(dialer.dial_count(), 2);
        assert_eq!(transport.idle_connections(), 0);
    }

    #[tokio::test]
    async fn test_dial_error_surfaces() {
        let dialer = MockDialer::new(Behavior::Echo(Duration::ZERO));
        dialer.refuse_dials(true);
        let transport = transport(&dialer, options(true, true, 2));

        let result = transport.exchange(EchoMessage::new(1, b"a")).await;
        assert!(matches!(result, Err(DnsError::Dial(_))));
        assert_eq!(transport.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_closed_transport_fails_fast_and_drains_idle_pool() {
        let dialer = MockDialer::new(Behavior::Echo(Duration::ZERO));
        let transport = transport(&dialer, options(true, false, 0));
        transport.start().await.unwrap();
        assert!(dialer.is_initialized());

        transport.exchange(EchoMessage::new(1, b"a")).await.unwrap();
        let idle_pool = transport.idle_pool.as_ref().unwrap();
        let conn = idle_pool.get().unwrap();
        idle_pool.put(conn.clone());

        transport.close().unwrap();
        transport.close().unwrap();
        assert!(conn.is_closed());
        assert_eq!(transport.idle_connections(), 0);

        let result = transport.exchange(EchoMessage::new(2, b"b")).await;
        assert!(matches!(result, Err(DnsError::TransportClosed)));
        assert_eq!(dialer.dial_count(), 1);
        assert!(matches!(transport.start().await, Err(DnsError::TransportClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_query_survives_close() {
        let dialer = MockDialer::new(Behavior::Echo(Duration::from_millis(100)));
        let transport = transport(&dialer, options(true, true, 2));

        let handle = spawn_query(&transport, 7);
        tokio::task::yield_now().await;
        transport.close().unwrap();

        handle.await.unwrap().unwrap();
        assert_eq!(transport.idle_connections(), 0);
        assert_eq!(transport.active_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_reclaimed_after_timeout() {
        let dialer = MockDialer::new(Behavior::Echo(Duration::ZERO));
        let transport = transport(&dialer, options(true, false, 0));
        transport.start().await.unwrap();

        transport.exchange(EchoMessage::new(1, b"a")).await.unwrap();
        let idle_pool = transport.idle_pool.as_ref().unwrap();
        let conn = idle_pool.get().unwrap();
        idle_pool.put(conn.clone());

        sleep(Duration::from_secs(2) + Duration::from_millis(10)).await;
        assert_eq!(transport.idle_connections(), 0);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_reordered_responses_mark_pipeline_detected() {
        let dialer = MockDialer::new(Behavior::ReverseBatch(4));
        let transport = transport(&dialer, options(true, true, 4));
        assert!(!transport.pipeline_detected());

        let handles: Vec<_> = (1..=4).map(|id| spawn_query(&transport, id)).collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(dialer.dial_count(), 1);
        assert!(transport.pipeline_detected());
    }

    #[tokio::test]
    async fn test_late_release_does_not_pool_connection_twice() {
        let dialer = MockDialer::new(Behavior::Echo(Duration::ZERO));
        let transport = transport(&dialer, options(true, true, 2));

        transport.exchange(EchoMessage::new(1, b"a")).await.unwrap();
        let idle_pool = transport.idle_pool.as_ref().unwrap();
        let conn = idle_pool.get().unwrap();
        idle_pool.put(conn.clone());

        // First caller's release arrives after a second caller reserved,
        // finished and already pooled the connection
        transport.release(&conn);
        assert_eq!(transport.idle_connections(), 1);

        let handles: Vec<_> = (2..=3).map(|id| spawn_query(&transport, id)).collect();
        for result in join_all(handles).await {
            result.unwrap().unwrap();
        }
        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(transport.idle_connections(), 1);
        assert!(!conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_idle_connection_is_not_pooled_again() {
        let dialer = MockDialer::scripted(
            Behavior::Echo(Duration::ZERO),
            vec![Behavior::SilentAfter(1)],
        );
        let transport = transport(&dialer, options(true, false, 0));

        transport.exchange(EchoMessage::new(1, b"first")).await.unwrap();
        let idle_pool = transport.idle_pool.as_ref().unwrap();
        let stale = idle_pool.get().unwrap();
        idle_pool.put(stale.clone());

        let response = transport.exchange(EchoMessage::new(2, b"second")).await.unwrap();
        assert_eq!(response, EchoMessage::new(2, b"second"));
        assert_eq!(dialer.dial_count(), 2);
        assert!(stale.is_closed());

        assert_eq!(transport.idle_connections(), 1);
        let pooled = idle_pool.get().unwrap();
        assert!(!Arc::ptr_eq(&pooled, &stale));
    }

    #[test]
    fn test_max_queries_forced_to_zero_without_pipeline() {
        let dialer = MockDialer::new(Behavior::Silent);
        let transport = transport(&dialer, options(true, false, 8));
        assert_eq!(transport.options.max_queries_per_connection, 0);
        assert!(!transport.capped());
    }
}
