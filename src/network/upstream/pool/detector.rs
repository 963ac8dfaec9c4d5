/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Pipelining detection from observed response ordering
//!
//! IDs go out sequentially on every channel, so a server answering strictly
//! one query at a time returns them in order. Responses arriving "behind" the
//! previous one on the same channel can only come from a server that works
//! on several queries concurrently.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::info;

const CONSECUTIVE_THRESHOLD: u32 = 3;
const RATIO_MIN_SAMPLES: u32 = 10;
const SAMPLE_LIMIT: u32 = 50;

/// Shared by every channel of one transport
#[derive(Debug, Default)]
pub struct PipelineDetector {
    detected: AtomicBool,
    consecutive_out_of_order: AtomicU32,
    out_of_order_count: AtomicU32,
    total_responses: AtomicU32,
}

impl PipelineDetector {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_detected(&self) -> bool {
        self.detected.load(Ordering::Relaxed)
    }

    /// Feed one matched response
    ///
    /// `previous_id` is the last ID received on the same channel (0 before the
    /// first one). Returns true only for the call that flips the flag.
    pub fn record_response(&self, previous_id: u16, id: u16) -> bool {
        if self.is_detected() {
            return false;
        }

        let total = self.total_responses.fetch_add(1, Ordering::AcqRel) + 1;
        let mut detected = false;

        if total > 1 {
            if id.wrapping_sub(previous_id) > 0x8000 {
                let out_of_order = self.out_of_order_count.fetch_add(1, Ordering::AcqRel) + 1;
                let consecutive = self.consecutive_out_of_order.fetch_add(1, Ordering::AcqRel) + 1;
                detected = consecutive >= CONSECUTIVE_THRESHOLD
                    || (total >= RATIO_MIN_SAMPLES && out_of_order * 10 > total * 3);
            } else {
                self.consecutive_out_of_order.store(0, Ordering::Release);
            }
        }

        if !detected && total >= SAMPLE_LIMIT {
            detected = true;
        }
        if !detected {
            return false;
        }

        self.consecutive_out_of_order.store(0, Ordering::Release);
        self.out_of_order_count.store(0, Ordering::Release);
        self.total_responses.store(0, Ordering::Release);

        let first = !self.detected.swap(true, Ordering::AcqRel);
        if first {
            info!(total, "Upstream server supports pipelining");
        }
        first
    }
}
