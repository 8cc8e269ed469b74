// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors

//! UART and PTY plumbing.
//!
//! The UART side opens a real serial device in raw 8N1 mode at a baud from
//! the allow-list. The PTY side allocates a master/slave pair, mirrors the
//! link's raw settings onto the slave so tools opening it observe a
//! conventional serial device, and publishes a stable symlink name that
//! survives restarts.

mod pty;
mod symlink;
mod uart;

pub use pty::ConsolePty;
pub use symlink::{publish_symlink, SymlinkGuard};
pub use uart::{is_transient_read_error, open_uart, SUPPORTED_BAUDS};

use std::path::PathBuf;

/// Errors from UART/PTY setup and teardown.
#[derive(Debug)]
pub enum TtyError {
    /// Baud rate outside the supported allow-list.
    UnsupportedBaud(u32),
    /// Failed to open a device.
    Open { path: PathBuf, source: std::io::Error },
    /// Generic I/O failure on an already-open descriptor.
    Io(std::io::Error),
    /// A system call failed.
    Sys(nix::Error),
}

impl std::fmt::Display for TtyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TtyError::UnsupportedBaud(baud) => write!(f, "unsupported baud rate: {}", baud),
            TtyError::Open { path, source } => {
                write!(f, "cannot open {}: {}", path.display(), source)
            }
            TtyError::Io(e) => write!(f, "i/o error: {}", e),
            TtyError::Sys(e) => write!(f, "system call failed: {}", e),
        }
    }
}

impl std::error::Error for TtyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TtyError::UnsupportedBaud(_) => None,
            TtyError::Open { source, .. } => Some(source),
            TtyError::Io(e) => Some(e),
            TtyError::Sys(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for TtyError {
    fn from(e: std::io::Error) -> Self {
        TtyError::Io(e)
    }
}

impl From<nix::Error> for TtyError {
    fn from(e: nix::Error) -> Self {
        TtyError::Sys(e)
    }
}
