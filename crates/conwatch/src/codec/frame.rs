// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors

//! Frame build and decode.
//!
//! # Wire format
//!
//! ```text
//!  0        1     2      3     4        5 .. 5+L      5+L .. 5+L+2
//! +--------+-----+------+-----+--------+-------------+--------------+
//! | Version| Seq | Flag | Type| Length | Payload (L) | CRC16 (BE)   |
//! +--------+-----+------+-----+--------+-------------+--------------+
//! ```
//!
//! The CRC covers `Version..Payload` (unstuffed). The body including the CRC
//! is then byte-stuffed and wrapped in three-byte delimiter runs.

use super::crc16::crc16_modbus;
use super::{DELIMITER_RUN, DLE, EOF, FRAME_VERSION, MAX_PAYLOAD, MIN_STUFFED_BODY, SOF};

/// Errors produced by the frame layer.
///
/// All of these are recovered locally by the RX pipeline: the offending
/// bytes are dropped and the filter resynchronizes on the next frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Payload exceeds the 24-byte maximum.
    PayloadTooLarge(usize),
    /// Body structure is invalid (too short, bad length field, dangling escape).
    Malformed(&'static str),
    /// Checksum over the unstuffed body does not match the trailer.
    CrcMismatch { expected: u16, found: u16 },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::PayloadTooLarge(len) => {
                write!(f, "payload too large: {} bytes (max {})", len, MAX_PAYLOAD)
            }
            FrameError::Malformed(msg) => write!(f, "malformed frame: {}", msg),
            FrameError::CrcMismatch { expected, found } => write!(
                f,
                "crc mismatch: expected {:#06x}, found {:#06x}",
                expected, found
            ),
        }
    }
}

impl std::error::Error for FrameError {}

/// A decoded heartbeat-protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub seq: u8,
    pub flag: u8,
    pub frame_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A heartbeat frame with the given sequence number and no payload.
    #[must_use]
    pub fn heartbeat(seq: u8) -> Self {
        Self {
            version: FRAME_VERSION,
            seq,
            flag: 0x00,
            frame_type: super::TYPE_HEARTBEAT,
            payload: Vec::new(),
        }
    }

    /// True when this frame carries the heartbeat type code.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.frame_type == super::TYPE_HEARTBEAT
    }

    /// Encode to the full wire form: delimiters, stuffed body, CRC.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }

        let mut body = Vec::with_capacity(7 + self.payload.len());
        body.push(self.version);
        body.push(self.seq);
        body.push(self.flag);
        body.push(self.frame_type);
        body.push(self.payload.len() as u8);
        body.extend_from_slice(&self.payload);

        let crc = crc16_modbus(&body);
        body.extend_from_slice(&crc.to_be_bytes());

        let stuffed = stuff(&body);
        let mut wire = Vec::with_capacity(stuffed.len() + 2 * DELIMITER_RUN);
        wire.extend(std::iter::repeat(SOF).take(DELIMITER_RUN));
        wire.extend_from_slice(&stuffed);
        wire.extend(std::iter::repeat(EOF).take(DELIMITER_RUN));
        Ok(wire)
    }

    /// Decode a stuffed body captured between the outer delimiter runs.
    ///
    /// Verifies the trailing big-endian CRC over the unstuffed prefix, then
    /// the length field against the actual payload size. The version byte is
    /// carried, not enforced; unknown frame types are the caller's concern.
    pub fn decode_body(stuffed: &[u8]) -> Result<Self, FrameError> {
        if stuffed.len() < MIN_STUFFED_BODY {
            return Err(FrameError::Malformed("body shorter than header and crc"));
        }

        let body = unstuff(stuffed)?;
        if body.len() < 7 {
            return Err(FrameError::Malformed("body shorter than header and crc"));
        }

        let (fields, crc_bytes) = body.split_at(body.len() - 2);
        let found = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);
        let expected = crc16_modbus(fields);
        if found != expected {
            return Err(FrameError::CrcMismatch { expected, found });
        }

        let length = fields[4] as usize;
        if length > MAX_PAYLOAD {
            return Err(FrameError::Malformed("length field exceeds maximum"));
        }
        if length != fields.len() - 5 {
            return Err(FrameError::Malformed("length field does not match payload"));
        }

        Ok(Self {
            version: fields[0],
            seq: fields[1],
            flag: fields[2],
            frame_type: fields[3],
            payload: fields[5..].to_vec(),
        })
    }
}

/// Escape every delimiter byte in `body` with a `DLE` prefix.
#[must_use]
pub fn stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 4);
    for &b in body {
        if super::is_special(b) {
            out.push(DLE);
        }
        out.push(b);
    }
    out
}

/// Reverse [`stuff`]: a `DLE` means the following byte is literal.
///
/// A lone trailing `DLE` has nothing to escape and is malformed.
pub fn unstuff(stuffed: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(stuffed.len());
    let mut iter = stuffed.iter();
    while let Some(&b) = iter.next() {
        if b == DLE {
            match iter.next() {
                Some(&literal) => out.push(literal),
                None => return Err(FrameError::Malformed("dangling escape byte")),
            }
        } else {
            out.push(b);
        }
    }
    Ok(out)
}
