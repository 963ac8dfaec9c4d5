/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Request/response correlation map for one channel
//!
//! Hands out wire IDs sequentially (wrapping, skipping IDs still in flight)
//! and maps each to the oneshot sender of the waiting query. Once closed, all
//! pending waiters receive the close cause and every later `store` fails, so
//! a query can never be registered on a channel whose reader is gone.

use crate::core::error::{DnsError, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot::Sender;

/// Size of the 16-bit ID space
const MAX_IDS: usize = u16::MAX as usize + 1;

pub(crate) type ResponseSender<M> = Sender<Result<M>>;

#[derive(Debug)]
struct Slots<M> {
    pending: HashMap<u16, ResponseSender<M>>,
    last_id: u16,
    closed: Option<DnsError>,
}

#[derive(Debug)]
pub(crate) struct RequestMap<M> {
    slots: Mutex<Slots<M>>,
}

impl<M> RequestMap<M> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                pending: HashMap::new(),
                last_id: 0,
                closed: None,
            }),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Slots<M>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter and return its wire ID
    pub fn store(&self, tx: ResponseSender<M>) -> Result<u16> {
        let mut slots = self.lock();
        if let Some(error) = &slots.closed {
            return Err(error.to_close_error());
        }
        if slots.pending.len() >= MAX_IDS {
            return Err(DnsError::protocol("request map exhausted: all query IDs in flight"));
        }

        let mut id = slots.last_id;
        loop {
            id = id.wrapping_add(1);
            if !slots.pending.contains_key(&id) {
                break;
            }
        }
        slots.last_id = id;
        slots.pending.insert(id, tx);
        Ok(id)
    }

    /// Remove and return the waiter registered under `id`
    pub fn take(&self, id: u16) -> Option<ResponseSender<M>> {
        self.lock().pending.remove(&id)
    }

    pub fn size(&self) -> usize {
        self.lock().pending.len()
    }

    /// Refuse further registrations and fail every pending waiter with `error`
    pub fn close(&self, error: &DnsError) {
        let drained: Vec<ResponseSender<M>> = {
            let mut slots = self.lock();
            if slots.closed.is_none() {
                slots.closed = Some(error.to_close_error());
            }
            slots.pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(error.to_close_error()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn test_ids_are_sequential_and_skip_in_flight() {
        let map = RequestMap::<u32>::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        assert_eq!(map.store(tx1).unwrap(), 1);
        assert_eq!(map.store(tx2).unwrap(), 2);
        assert_eq!(map.size(), 2);

        assert!(map.take(1).is_some());
        assert!(map.take(1).is_none());

        let (tx3, _rx3) = oneshot::channel();
        assert_eq!(map.store(tx3).unwrap(), 3);
    }

    #[test]
    fn test_id_wraps_around() {
        let map = RequestMap::<u32>::new();
        map.lock().last_id = u16::MAX - 1;
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let (tx3, _rx3) = oneshot::channel();
        assert_eq!(map.store(tx1).unwrap(), u16::MAX);
        assert_eq!(map.store(tx2).unwrap(), 0);
        assert_eq!(map.store(tx3).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_future_waiters() {
        let map = RequestMap::<u32>::new();
        let (tx, rx) = oneshot::channel();
        map.store(tx).unwrap();

        map.close(&DnsError::connection_closed("read response: EOF"));
        assert_eq!(map.size(), 0);
        match rx.await.unwrap() {
            Err(DnsError::ConnectionClosed(cause)) => assert_eq!(cause, "read response: EOF"),
            other => panic!("unexpected result: {:?}", other),
        }

        let (tx, _rx) = oneshot::channel();
        assert!(matches!(map.store(tx), Err(DnsError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_protocol_close_keeps_error_class() {
        let map = RequestMap::<u32>::new();
        let (tx, rx) = oneshot::channel();
        map.store(tx).unwrap();

        map.close(&DnsError::protocol("short response frame"));
        assert!(matches!(rx.await.unwrap(), Err(DnsError::Protocol(_))));
    }
}
