/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Deadline-ordered pool of reusable resources with background reclamation
//!
//! Every resident item carries an expiry deadline of `put time + expire`.
//! [`ExpiringPool::get`] hands out the item with the earliest deadline, which
//! with a single `expire` offset means the oldest insertion first. A single
//! background task sleeps until the nearest deadline and passes due items to
//! the reclaim callback; it is woken early by `put` and by `close`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::select;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, warn};

/// Lower bound for the empty-pool re-check interval
const MIN_EMPTY_POLL: Duration = Duration::from_secs(1);

struct Entry<T> {
    value: T,
    expires_at: Instant,
    /// Insertion sequence, breaks deadline ties in FIFO order
    seq: u64,
}

// BinaryHeap is a max-heap, and we want the earliest deadline on top.
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .expires_at
            .cmp(&self.expires_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

struct PoolState<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    closed: bool,
}

type ReclaimFn<T> = Box<dyn Fn(T) + Send + Sync>;

struct PoolShared<T> {
    expire: Duration,
    on_reclaim: ReclaimFn<T>,
    state: Mutex<PoolState<T>>,
    wakeup: Notify,
}

impl<T> PoolShared<T> {
    #[inline]
    fn lock_state(&self) -> MutexGuard<'_, PoolState<T>> {
        // The callback never runs under this lock, a poisoned state is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Generic expiring pool, see the module docs
pub struct ExpiringPool<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Debug for ExpiringPool<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringPool")
            .field("expire", &self.shared.expire)
            .field("len", &self.len())
            .finish()
    }
}

impl<T: Send + 'static> ExpiringPool<T> {
    /// Create an empty pool; no background work starts until [`start`](Self::start)
    pub fn new<F>(expire: Duration, on_reclaim: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(PoolShared {
                expire,
                on_reclaim: Box::new(on_reclaim),
                state: Mutex::new(PoolState {
                    heap: BinaryHeap::new(),
                    next_seq: 0,
                    closed: false,
                }),
                wakeup: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the reclamation loop on the current tokio runtime
    ///
    /// Calling it a second time, or after `close`, only logs a warning.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            warn!("Expiring pool already started");
            return;
        }
        if self.shared.lock_state().closed {
            warn!("Expiring pool started after close, reclamation disabled");
            return;
        }
        *task = Some(tokio::spawn(reclaim_loop(self.shared.clone())));
    }

    /// Insert `value` with deadline `now + expire`
    pub fn put(&self, value: T) {
        {
            let mut state = self.shared.lock_state();
            let seq = state.next_seq;
            state.next_seq = seq.wrapping_add(1);
            state.heap.push(Entry {
                value,
                expires_at: Instant::now() + self.shared.expire,
                seq,
            });
        }
        self.shared.wakeup.notify_one();
    }

    /// Remove and return the item with the nearest deadline, if any
    pub fn get(&self) -> Option<T> {
        self.shared.lock_state().heap.pop().map(|entry| entry.value)
    }

    /// Number of resident items
    pub fn len(&self) -> usize {
        self.shared.lock_state().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the reclamation loop and reclaim every resident item
    ///
    /// Items are removed under the lock before their callbacks run, so an item
    /// is reclaimed exactly once even when this races with the loop. A `put`
    /// after `close` is still accepted; such items are only released by a
    /// later `get`, another `close`, or dropping the pool.
    pub fn close(&self) {
        let drained: Vec<T> = {
            let mut state = self.shared.lock_state();
            state.closed = true;
            let mut drained = Vec::with_capacity(state.heap.len());
            while let Some(entry) = state.heap.pop() {
                drained.push(entry.value);
            }
            drained
        };
        self.shared.wakeup.notify_one();

        if !drained.is_empty() {
            debug!(count = drained.len(), "Expiring pool closed, reclaiming resident items");
        }
        for value in drained {
            (self.shared.on_reclaim)(value);
        }

        // The loop exits on its own once it observes `closed`
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl<T: Send + 'static> Drop for ExpiringPool<T> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn reclaim_loop<T: Send + 'static>(shared: Arc<PoolShared<T>>) {
    loop {
        let next_deadline = {
            let state = shared.lock_state();
            if state.closed {
                break;
            }
            state.heap.peek().map(|entry| entry.expires_at)
        };

        match next_deadline {
            None => {
                // Empty: wait for a put, falling back to a periodic re-check
                select! {
                    _ = shared.wakeup.notified() => {}
                    _ = sleep(shared.expire.max(MIN_EMPTY_POLL)) => {}
                }
                continue;
            }
            Some(deadline) if deadline > Instant::now() => {
                select! {
                    _ = shared.wakeup.notified() => {}
                    _ = sleep_until(deadline) => {}
                }
                continue;
            }
            Some(_) => {}
        }

        // Re-validate: a get may have taken the head while we were sleeping
        let due = {
            let mut state = shared.lock_state();
            if state.closed {
                break;
            }
            match state.heap.peek() {
                Some(entry) if entry.expires_at <= Instant::now() => {
                    state.heap.pop().map(|entry| entry.value)
                }
                _ => None,
            }
        };

        if let Some(value) = due {
            debug!("Reclaiming expired pooled item");
            (shared.on_reclaim)(value);
        }
    }

    debug!("Expiring pool reclaim loop exited");
}
