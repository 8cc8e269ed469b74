// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors

//! Thread lifecycle helpers shared by the periodic workers.

use std::sync::mpsc;
use std::thread::JoinHandle;

/// Holds a background thread handle and the stop channel sender.
///
/// Dropping the sender disconnects the channel, which unblocks the thread's
/// `recv_timeout()` with `Disconnected`; the thread is then joined.
#[derive(Debug)]
pub(crate) struct StopHandle {
    /// Dropping this signals the thread to exit via channel disconnect.
    /// Must be dropped BEFORE joining the thread.
    stop_tx: Option<mpsc::Sender<()>>,
    /// Background thread handle -- joined on drop.
    thread: Option<JoinHandle<()>>,
}

impl StopHandle {
    pub(crate) fn new(stop_tx: mpsc::Sender<()>, thread: JoinHandle<()>) -> Self {
        Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }
    }

    /// Signal the thread to stop and wait for it to finish.
    pub(crate) fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
