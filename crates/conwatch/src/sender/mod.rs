// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors

//! Periodic heartbeat sender (DTE role).
//!
//! While the `controlled_device` enable flag is set, a background thread
//! emits one heartbeat frame immediately and then every 5 s, with the
//! sequence number incrementing mod 256 across the whole process lifetime.
//! While disabled the UART is released entirely, so other users of the
//! console line are not locked out; enabling re-opens it.

use crate::codec::Frame;
use crate::config::{read_enabled, ENTRY_CONTROLLED_DEVICE};
use crate::store::{StoreError, Table, Watcher};
use crate::sync::StopHandle;
use crate::tty::open_uart;
use serial2::SerialPort;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

/// Heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Enable-flag poll deadline; bounds reaction and shutdown latency.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// A running heartbeat emitter owning its UART.
#[derive(Debug)]
pub struct HeartbeatSender {
    stop: StopHandle,
}

impl HeartbeatSender {
    /// Open the UART and start emitting. The first frame goes out
    /// immediately, not one interval late.
    pub fn start(
        device: &Path,
        baud: u32,
        interval: Duration,
        seq: Arc<AtomicU8>,
    ) -> crate::Result<Self> {
        let uart = open_uart(device, baud, false, Duration::from_secs(1))?;
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let device_name = device.display().to_string();

        let thread = std::thread::Builder::new()
            .name("conwatch-dte-send".into())
            .spawn(move || loop {
                send_heartbeat(&uart, &seq, &device_name);
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }
            })
            .map_err(crate::Error::Io)?;

        log::info!("[DTE] heartbeat started on {} @ {}", device.display(), baud);
        Ok(Self {
            stop: StopHandle::new(stop_tx, thread),
        })
    }

    /// Stop the emitter and release the UART.
    pub fn stop(mut self) {
        self.stop.stop();
        log::info!("[DTE] heartbeat stopped");
    }
}

fn send_heartbeat(uart: &SerialPort, seq: &AtomicU8, device: &str) {
    let frame = Frame::heartbeat(seq.fetch_add(1, Ordering::Relaxed));
    let wire = match frame.encode() {
        Ok(wire) => wire,
        Err(e) => {
            log::error!("[DTE] heartbeat encode failed: {}", e);
            return;
        }
    };

    let mut off = 0;
    while off < wire.len() {
        match uart.write(&wire[off..]) {
            Ok(0) => {
                log::warn!("[DTE] {} accepted no bytes, dropping heartbeat", device);
                return;
            }
            Ok(n) => off += n,
            Err(ref e)
                if matches!(
                    e.kind(),
                    ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                log::warn!("[DTE] heartbeat write to {} failed: {}", device, e);
                return;
            }
        }
    }
}

/// The DTE main loop: follow the enable flag until shutdown.
///
/// The initial state is taken before entering the loop; a failure to open
/// the UART at startup with the flag enabled is fatal, later open failures
/// are retried on the next wakeup while the flag stays set.
pub fn run(
    config: &dyn Table,
    separator: &str,
    device: PathBuf,
    baud: u32,
    watcher: &mut dyn Watcher,
    shutdown: &AtomicBool,
) -> crate::Result<()> {
    let seq = Arc::new(AtomicU8::new(0));
    let mut sender: Option<HeartbeatSender> = None;

    let mut enabled = read_enabled(config, separator, ENTRY_CONTROLLED_DEVICE)?;
    if enabled {
        sender = Some(HeartbeatSender::start(
            &device,
            baud,
            HEARTBEAT_INTERVAL,
            Arc::clone(&seq),
        )?);
    } else {
        log::info!("[DTE] disabled; uart stays closed until enabled");
    }

    while !shutdown.load(Ordering::Acquire) {
        match watcher.wait(WAIT_TIMEOUT) {
            Ok(Some(event)) => {
                log::debug!("[DTE] store change: {} ({})", event.key, event.op);
            }
            Ok(None) => {}
            Err(StoreError::SubscriptionLost) => std::thread::sleep(WAIT_TIMEOUT),
            Err(e) => {
                log::warn!("[DTE] watcher error: {}", e);
                std::thread::sleep(WAIT_TIMEOUT);
            }
        }

        match read_enabled(config, separator, ENTRY_CONTROLLED_DEVICE) {
            Ok(now_enabled) => enabled = now_enabled,
            Err(e) => log::warn!("[DTE] enable flag read failed: {}", e),
        }

        if enabled && sender.is_none() {
            match HeartbeatSender::start(&device, baud, HEARTBEAT_INTERVAL, Arc::clone(&seq)) {
                Ok(started) => sender = Some(started),
                Err(e) => log::warn!("[DTE] cannot start heartbeat, will retry: {}", e),
            }
        } else if !enabled {
            if let Some(running) = sender.take() {
                running.stop();
            }
        }
    }

    if let Some(running) = sender.take() {
        running.stop();
    }
    Ok(())
}
