// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors

//! Streaming separation of heartbeat frames from user bytes.
//!
//! [`FrameFilter`] consumes one RX byte at a time and emits at most one
//! event per byte: a run of user bytes to forward, a decoded frame, or a
//! note that a corrupt frame was dropped. It is self-synchronizing: entering
//! the stream mid-frame, losing bytes, or single-byte corruption costs at
//! most one frame and resynchronizes on the next delimiter run.
//!
//! User bytes are held briefly and flushed on the first of: a frame opening
//! (`SOF`), the 64-byte buffer filling, or the owner reporting line
//! quiescence (its 500 ms poll deadline firing with nothing read). Bytes
//! captured inside an unfinished frame are discarded on quiescence: they
//! were almost certainly line noise that looked like a frame opening, and
//! re-emitting them after a delay would corrupt the terminal.
//!
//! Inside a frame the escape byte makes the following byte literal, so raw
//! delimiter values inside a stuffed body do not open or close anything.
//! After a frame closes, the remaining delimiter bytes of its closing run
//! are swallowed so they never leak into the user stream.

use super::frame::{Frame, FrameError};
use super::{DELIMITER_RUN, DLE, EOF, MAX_STUFFED_BODY, SOF};

/// The quiescence window: the line is considered idle after this long
/// without a received byte. Owners poll with this deadline and call
/// [`FrameFilter::flush_idle`] when it fires.
pub const QUIESCENCE: std::time::Duration = std::time::Duration::from_millis(500);

/// One event out of the filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterEvent {
    /// User bytes to forward verbatim.
    User(Vec<u8>),
    /// A frame decoded from the stream. Never forwarded to the user.
    Frame(Frame),
    /// A corrupt frame was dropped; its bytes are gone by design.
    Dropped(FrameError),
}

/// Counters for everything the filter saw and dropped.
///
/// Counted, not exported: the owner logs them at debug level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    /// User bytes emitted.
    pub user_bytes: u64,
    /// Frames decoded successfully.
    pub frames: u64,
    /// Frames dropped for a checksum mismatch.
    pub crc_mismatches: u64,
    /// Frames dropped for structural errors.
    pub malformed: u64,
    /// Frames abandoned before their closing delimiter (restarted or idle).
    pub truncated: u64,
    /// Frame captures abandoned because they outgrew the body buffer.
    pub overflows: u64,
    /// Bytes discarded together with dropped or abandoned frames.
    pub discarded_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Outside a frame; the buffer holds pending user bytes.
    Idle,
    /// Between delimiter runs; the buffer holds the stuffed body.
    InFrame,
    /// A frame just closed; up to this many closing delimiters remain.
    Trailer(u8),
}

/// Streaming frame/user-byte separator. One per link, single-owner.
#[derive(Debug)]
pub struct FrameFilter {
    state: State,
    buf: Vec<u8>,
    /// Set when the previous in-frame byte was the escape byte.
    escape: bool,
    stats: FilterStats,
}

impl FrameFilter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            buf: Vec::with_capacity(MAX_STUFFED_BODY),
            escape: false,
            stats: FilterStats::default(),
        }
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    /// Consume one RX byte; at most one event results.
    pub fn push(&mut self, byte: u8) -> Option<FilterEvent> {
        match self.state {
            State::Idle => self.push_idle(byte),
            State::InFrame => self.push_in_frame(byte),
            State::Trailer(remaining) => {
                if byte == EOF && remaining > 0 {
                    self.state = if remaining == 1 {
                        State::Idle
                    } else {
                        State::Trailer(remaining - 1)
                    };
                    None
                } else {
                    self.state = State::Idle;
                    self.push_idle(byte)
                }
            }
        }
    }

    /// The owner saw the line idle for the quiescence window.
    ///
    /// Pending user bytes are flushed; a partial frame capture is discarded
    /// and the filter returns to idle.
    pub fn flush_idle(&mut self) -> Option<FilterEvent> {
        match self.state {
            State::Idle => self.take_user(),
            State::InFrame => {
                self.stats.truncated += 1;
                self.discard_capture();
                None
            }
            State::Trailer(_) => {
                self.state = State::Idle;
                None
            }
        }
    }

    fn push_idle(&mut self, byte: u8) -> Option<FilterEvent> {
        if byte == SOF {
            let flushed = self.take_user();
            self.state = State::InFrame;
            self.escape = false;
            return flushed;
        }
        self.buf.push(byte);
        if self.buf.len() >= MAX_STUFFED_BODY {
            return self.take_user();
        }
        None
    }

    fn push_in_frame(&mut self, byte: u8) -> Option<FilterEvent> {
        if self.escape {
            self.escape = false;
            self.buf.push(byte);
            return self.check_capture_overflow();
        }
        match byte {
            DLE => {
                self.escape = true;
                self.buf.push(byte);
                self.check_capture_overflow()
            }
            SOF => {
                // A fresh opening. An empty capture is just the rest of the
                // delimiter run; anything else was a truncated frame.
                if !self.buf.is_empty() {
                    self.stats.truncated += 1;
                }
                self.discard_capture();
                self.state = State::InFrame;
                None
            }
            EOF => self.close_frame(),
            _ => {
                self.buf.push(byte);
                self.check_capture_overflow()
            }
        }
    }

    fn close_frame(&mut self) -> Option<FilterEvent> {
        let event = match Frame::decode_body(&self.buf) {
            Ok(frame) => {
                self.stats.frames += 1;
                FilterEvent::Frame(frame)
            }
            Err(err) => {
                match err {
                    FrameError::CrcMismatch { .. } => self.stats.crc_mismatches += 1,
                    _ => self.stats.malformed += 1,
                }
                self.stats.discarded_bytes += self.buf.len() as u64;
                FilterEvent::Dropped(err)
            }
        };
        self.buf.clear();
        self.escape = false;
        self.state = State::Trailer((DELIMITER_RUN - 1) as u8);
        Some(event)
    }

    fn check_capture_overflow(&mut self) -> Option<FilterEvent> {
        if self.buf.len() >= MAX_STUFFED_BODY {
            // No valid body is this long; whatever we captured was not a frame.
            self.stats.overflows += 1;
            self.discard_capture();
        }
        None
    }

    fn discard_capture(&mut self) {
        self.stats.discarded_bytes += self.buf.len() as u64;
        self.buf.clear();
        self.escape = false;
        self.state = State::Idle;
    }

    fn take_user(&mut self) -> Option<FilterEvent> {
        if self.buf.is_empty() {
            return None;
        }
        self.stats.user_bytes += self.buf.len() as u64;
        let bytes = std::mem::replace(&mut self.buf, Vec::with_capacity(MAX_STUFFED_BODY));
        Some(FilterEvent::User(bytes))
    }
}

impl Default for FrameFilter {
    fn default() -> Self {
        Self::new()
    }
}
