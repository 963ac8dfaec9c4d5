/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Network layer: stream framing, TLS client setup and pooled upstreams

pub mod tls_config;
pub mod transport;
pub mod upstream;
