/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! dotpool - adaptive pooled DNS over TCP/TLS upstream transport
//!
//! The core is [`network::upstream::pool::transport::AdaptiveTransport`]: an
//! exchange layer that keeps idle connections in an expiring pool, spreads
//! concurrent queries over a bounded set of pipelined connections and
//! watches whether the upstream really answers out of order.

pub mod config;
pub mod core;
pub mod network;
