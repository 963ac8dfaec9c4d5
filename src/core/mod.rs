/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Process-level plumbing: errors, logging and command-line runtime

use crate::config::types::LogConfig;
use crate::core::error::{DnsError, Result};
use crate::core::log::DotPoolLogFormatter;
use crate::core::runtime::{Options, Runtime};
use clap::Parser;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub mod error;
mod log;
pub mod runtime;

/// Parse the command line into a fresh [`Runtime`]
pub fn init() -> Runtime {
    let options = Options::parse();

    Runtime {
        options,
        log_guard: None,
    }
}

/// Install the global tracing subscriber
///
/// Console output is always enabled; when `log.file` is set a second,
/// non-blocking file layer is added. The returned guard must be kept alive
/// until shutdown so buffered lines are flushed.
pub fn init_log(log: LogConfig) -> Result<WorkerGuard> {
    let (file_writer, guard) = match log.file.as_deref() {
        Some(file_path) => {
            let path = Path::new(file_path);
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| DnsError::config(format!("Invalid log file path: {file_path}")))?;
            let file_appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (Some(non_blocking), guard)
        }
        // No file output: hand back a guard over a sink so callers keep one code path
        None => (None, tracing_appender::non_blocking(std::io::sink()).1),
    };

    let console_layer = fmt::layer()
        .event_format(DotPoolLogFormatter)
        .with_writer(std::io::stdout);

    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .event_format(DotPoolLogFormatter)
            .with_ansi(false)
            .with_writer(writer)
    });

    let filter = EnvFilter::try_new(&log.level).unwrap_or_else(|_| EnvFilter::new("info"));

    Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| DnsError::runtime(format!("Failed to install log subscriber: {e}")))?;

    Ok(guard)
}
