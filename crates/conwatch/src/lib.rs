// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors

//! # conwatch - Serial console link liveness monitoring
//!
//! Answers, per serial link, the question "is this console path currently
//! usable?" without disturbing interactive operator sessions that traverse
//! the same link.
//!
//! Two symmetric roles share one wire codec:
//!
//! - The **DCE** (console server) owns the physical UARTs. One proxy per
//!   link separates heartbeat frames from user bytes in a streaming fashion,
//!   forwards user bytes to a pseudo-terminal published under a stable
//!   `/dev/V<prefix><link>` name, and drives a per-link liveness lease.
//! - The **DTE** (managed device) periodically emits heartbeat frames onto
//!   its console UART while its enable flag is set.
//!
//! ## Data flow (DCE side, one link)
//!
//! ```text
//! UART RX ──► FrameFilter ──► user bytes ──► PTY master ──► PTY slave ──► picocom
//!                         └─► heartbeat  ──► liveness lease reset
//! PTY master ◄── PTY slave ◄── user typing ──► UART TX  (unfiltered passthrough)
//! ```
//!
//! ## Modules Overview
//!
//! - [`codec`] - heartbeat frame build/decode and the streaming `FrameFilter`
//! - [`tty`] - UART and PTY plumbing, stable symlink publication
//! - [`store`] - key/value store client (hash-merge writes, key-space events)
//! - [`config`] - typed views over the configuration tables
//! - [`liveness`] - per-link lease tracking and the shared expiry ticker
//! - [`proxy`] - the per-link worker pair (UART→PTY filter, PTY→UART copy)
//! - [`supervisor`] - configuration-driven link reconciliation (DCE)
//! - [`sender`] - the periodic heartbeat emitter (DTE)
//!
//! Scheduling is multi-threaded blocking I/O: every blocking wait is bounded
//! (500 ms poll deadlines, 1 s subscription timeouts), there is no async
//! runtime, and cancellation is an atomic flag observed at every wakeup.

/// Heartbeat frame codec: CRC, byte stuffing, and the streaming filter.
pub mod codec;
/// Typed views over the configuration tables and platform files.
pub mod config;
/// Per-link liveness lease and the shared expiry ticker.
pub mod liveness;
/// Per-link proxy workers (UART→PTY filtering, PTY→UART passthrough).
pub mod proxy;
/// Periodic heartbeat sender (DTE role).
pub mod sender;
/// Key/value store client: tables, hash-merge writes, key-space events.
pub mod store;
/// Configuration-driven link supervisor (DCE role).
pub mod supervisor;
/// UART and PTY plumbing.
pub mod tty;

pub(crate) mod sync;

pub use codec::{Frame, FrameError, FrameFilter};
pub use config::LinkSettings;
pub use liveness::{HealthTicker, LinkHealth};
pub use proxy::LinkProxy;
pub use sender::HeartbeatSender;
pub use store::{StoreError, Table, Watcher};
pub use supervisor::Supervisor;
pub use tty::TtyError;

/// conwatch version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type for conwatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced out of the role entry points.
///
/// Frame-layer errors never appear here: they are recovered inside the RX
/// pipeline (dropped and counted) and must never take a proxy down.
#[derive(Debug)]
pub enum Error {
    /// Invalid or missing configuration (bad baud, missing device, ...).
    Config(String),
    /// The key/value store is unreachable or misconfigured.
    Store(StoreError),
    /// UART or PTY setup failed.
    Tty(TtyError),
    /// Other I/O failure.
    Io(std::io::Error),
}

impl Error {
    /// Process exit code for this error, per the service contract:
    /// 2 = misconfiguration, 3 = fatal I/O at startup.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::Store(_) => 2,
            Error::Tty(TtyError::UnsupportedBaud(_)) => 2,
            Error::Tty(_) | Error::Io(_) => 3,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::Store(e) => write!(f, "store error: {}", e),
            Error::Tty(e) => write!(f, "tty error: {}", e),
            Error::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(_) => None,
            Error::Store(e) => Some(e),
            Error::Tty(e) => Some(e),
            Error::Io(e) => Some(e),
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Store(e)
    }
}

impl From<TtyError> for Error {
    fn from(e: TtyError) -> Self {
        Error::Tty(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
