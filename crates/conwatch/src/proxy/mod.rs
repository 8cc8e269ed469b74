// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors

//! Per-link proxy: the worker pair that owns a UART and its published PTY.
//!
//! - **UART→PTY**: reads with a 500 ms deadline, pushes every byte through
//!   the frame filter, forwards user bytes to the PTY master and turns
//!   decoded heartbeats into liveness assertions. The read deadline doubles
//!   as the filter's quiescence trigger.
//! - **PTY→UART**: verbatim passthrough of operator input. No filtering in
//!   this direction; heartbeat is unidirectional.
//!
//! A vanished UART is fatal for the proxy: it demotes liveness and lets the
//! supervisor decide about respawning. A PTY without a reader is routine;
//! user bytes queue in the kernel buffer and are dropped once it fills, so
//! an unattended console can never stall heartbeat processing.

use crate::codec::{FilterEvent, FrameFilter, QUIESCENCE};
use crate::config::{symlink_name, LinkSettings};
use crate::liveness::LinkHealth;
use crate::tty::{
    is_transient_read_error, open_uart, publish_symlink, ConsolePty, SymlinkGuard,
};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use serial2::SerialPort;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// UART read chunk size.
const READ_CHUNK: usize = 512;
/// Poll deadline for both workers; bounds shutdown latency.
const POLL_TIMEOUT_MS: u16 = 500;
/// How often the RX worker reports filter counters at debug level.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// A running link: two worker threads, one UART, one published PTY.
pub struct LinkProxy {
    link_id: String,
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    symlink: Option<SymlinkGuard>,
    // Keeps both PTY ends open for the lifetime of the link.
    _pty: ConsolePty,
}

impl LinkProxy {
    /// Open the devices, publish the symlink, and start both workers.
    pub fn spawn(
        settings: &LinkSettings,
        health: Arc<LinkHealth>,
        symlink_dir: &Path,
        prefix: &str,
    ) -> crate::Result<Self> {
        let uart = Arc::new(open_uart(
            &settings.device_path(),
            settings.baud,
            settings.flow_control,
            QUIESCENCE,
        )?);
        let pty = ConsolePty::open(settings.baud)?;
        let symlink = publish_symlink(
            symlink_dir,
            &symlink_name(prefix, &settings.link_id),
            pty.slave_path(),
        )?;

        let stop = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));
        let link_id = settings.link_id.clone();

        let rx = {
            let uart = Arc::clone(&uart);
            let master = pty.master_writer()?;
            let health = Arc::clone(&health);
            let stop = Arc::clone(&stop);
            let alive = Arc::clone(&alive);
            let link_id = link_id.clone();
            std::thread::Builder::new()
                .name(format!("cw-rx-{}", link_id))
                .spawn(move || rx_loop(&uart, master, &health, &stop, &alive, &link_id))
                .map_err(crate::Error::Io)?
        };

        let tx = {
            let master = pty.master_reader()?;
            let health = Arc::clone(&health);
            let stop = Arc::clone(&stop);
            let alive = Arc::clone(&alive);
            let link_id = link_id.clone();
            std::thread::Builder::new()
                .name(format!("cw-tx-{}", link_id))
                .spawn(move || tx_loop(master, &uart, &health, &stop, &alive, &link_id))
                .map_err(crate::Error::Io)?
        };

        log::info!(
            "[PROXY:{}] started: {} @ {} -> {}",
            link_id,
            settings.device_path().display(),
            settings.baud,
            symlink.path().display()
        );

        Ok(Self {
            link_id,
            stop,
            alive,
            workers: vec![rx, tx],
            symlink: Some(symlink),
            _pty: pty,
        })
    }

    #[must_use]
    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    /// False once either worker hit a fatal device error.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Stop both workers, join them, and unpublish the symlink.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        // Removes the published name.
        self.symlink.take();
        log::info!("[PROXY:{}] stopped", self.link_id);
    }
}

impl Drop for LinkProxy {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop_inner();
        }
    }
}

// ============================================================================
// Workers
// ============================================================================

fn rx_loop(
    uart: &SerialPort,
    mut master: File,
    health: &LinkHealth,
    stop: &AtomicBool,
    alive: &AtomicBool,
    link_id: &str,
) {
    let mut filter = FrameFilter::new();
    let mut buf = [0u8; READ_CHUNK];
    let mut last_stats = Instant::now();
    let mut reported = filter.stats();

    while !stop.load(Ordering::Acquire) {
        match uart.read(&mut buf) {
            Ok(0) => {
                fatal(health, alive, link_id, "uart read returned end of file");
                return;
            }
            Ok(n) => {
                for &byte in &buf[..n] {
                    let event = filter.push(byte);
                    handle_event(event, &mut master, health, link_id);
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(ref e) if is_transient_read_error(e) => {
                // The line went quiet for the quiescence window.
                let event = filter.flush_idle();
                handle_event(event, &mut master, health, link_id);
            }
            Err(e) => {
                fatal(health, alive, link_id, &format!("uart read failed: {}", e));
                return;
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            let stats = filter.stats();
            if stats != reported {
                log::debug!("[PROXY:{}] filter stats: {:?}", link_id, stats);
                reported = stats;
            }
            last_stats = Instant::now();
        }
    }
}

fn handle_event(
    event: Option<FilterEvent>,
    master: &mut File,
    health: &LinkHealth,
    link_id: &str,
) {
    match event {
        Some(FilterEvent::User(bytes)) => write_master(master, &bytes, link_id),
        Some(FilterEvent::Frame(frame)) => {
            if frame.is_heartbeat() {
                health.assert_alive();
            } else {
                log::debug!(
                    "[PROXY:{}] ignoring frame of reserved type {:#04x}",
                    link_id,
                    frame.frame_type
                );
            }
        }
        Some(FilterEvent::Dropped(err)) => {
            log::debug!("[PROXY:{}] dropped corrupt frame: {}", link_id, err);
        }
        None => {}
    }
}

/// Forward user bytes to the PTY master. The master is non-blocking: with
/// no reader attached the kernel buffer eventually fills, and the remainder
/// of the chunk is dropped rather than stalling heartbeat processing.
fn write_master(master: &mut File, bytes: &[u8], link_id: &str) {
    let mut off = 0;
    while off < bytes.len() {
        match master.write(&bytes[off..]) {
            Ok(0) => break,
            Ok(n) => off += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                log::debug!(
                    "[PROXY:{}] pty buffer full, dropping {} user bytes",
                    link_id,
                    bytes.len() - off
                );
                break;
            }
            Err(e) => {
                log::warn!("[PROXY:{}] pty write failed: {}", link_id, e);
                break;
            }
        }
    }
}

fn tx_loop(
    mut master: File,
    uart: &SerialPort,
    health: &LinkHealth,
    stop: &AtomicBool,
    alive: &AtomicBool,
    link_id: &str,
) {
    let mut buf = [0u8; READ_CHUNK];

    while !stop.load(Ordering::Acquire) && alive.load(Ordering::Acquire) {
        match poll_readable(&master) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(nix::Error::EINTR) => continue,
            Err(e) => {
                fatal(health, alive, link_id, &format!("pty poll failed: {}", e));
                return;
            }
        }

        match master.read(&mut buf) {
            Ok(0) => {
                // Nothing holds the slave open anymore; transient by
                // construction since the proxy keeps its own slave handle.
                std::thread::sleep(Duration::from_millis(100));
            }
            Ok(n) => {
                if let Err(e) = write_uart_all(uart, &buf[..n], stop) {
                    fatal(health, alive, link_id, &format!("uart write failed: {}", e));
                    return;
                }
            }
            Err(ref e)
                if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
            Err(e) => {
                fatal(health, alive, link_id, &format!("pty read failed: {}", e));
                return;
            }
        }
    }
}

fn poll_readable(file: &File) -> nix::Result<bool> {
    let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
    let ready = poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS))?;
    Ok(ready > 0)
}

/// Write the whole buffer to the UART, retrying short and timed-out writes.
/// Bails out early on shutdown so flow-controlled lines cannot wedge it.
fn write_uart_all(uart: &SerialPort, bytes: &[u8], stop: &AtomicBool) -> std::io::Result<()> {
    let mut off = 0;
    while off < bytes.len() {
        if stop.load(Ordering::Acquire) {
            return Ok(());
        }
        match uart.write(&bytes[off..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::WriteZero,
                    "uart accepted no bytes",
                ))
            }
            Ok(n) => off += n,
            Err(ref e)
                if matches!(
                    e.kind(),
                    ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                ) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn fatal(health: &LinkHealth, alive: &AtomicBool, link_id: &str, reason: &str) {
    log::error!("[PROXY:{}] {}", link_id, reason);
    alive.store(false, Ordering::Release);
    health.mark_down();
}
