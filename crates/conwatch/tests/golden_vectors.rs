// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors
//
// Wire golden vectors: byte-exact reference encodings of the heartbeat
// frame format, plus structural properties every valid wire form holds.

use conwatch::codec::{self, Frame};

/// seq=0 heartbeat. CRC over `01 00 00 01 00` is 0x5018; the body bytes
/// equal to the frame delimiter are escaped.
const HEARTBEAT_SEQ0: &[u8] = &[
    0x01, 0x01, 0x01, 0x10, 0x01, 0x00, 0x00, 0x10, 0x01, 0x00, 0x50, 0x18, 0x1B, 0x1B, 0x1B,
];

/// seq=1 heartbeat: both version and sequence are escaped, CRC 0xAC19.
const HEARTBEAT_SEQ1: &[u8] = &[
    0x01, 0x01, 0x01, 0x10, 0x01, 0x10, 0x01, 0x00, 0x10, 0x01, 0x00, 0xAC, 0x19, 0x1B, 0x1B,
    0x1B,
];

#[test]
fn heartbeat_seq0_wire_bytes() {
    assert_eq!(Frame::heartbeat(0).encode().unwrap(), HEARTBEAT_SEQ0);
}

#[test]
fn heartbeat_seq1_wire_bytes() {
    assert_eq!(Frame::heartbeat(1).encode().unwrap(), HEARTBEAT_SEQ1);
}

#[test]
fn heartbeat_decode_build_roundtrip_all_sequences() {
    for seq in 0..=255u8 {
        let frame = Frame::heartbeat(seq);
        let wire = frame.encode().unwrap();
        let body = &wire[codec::DELIMITER_RUN..wire.len() - codec::DELIMITER_RUN];
        assert_eq!(Frame::decode_body(body).unwrap(), frame, "seq {}", seq);
    }
}

#[test]
fn wire_form_always_fits_the_body_buffer() {
    // Worst case: every body byte needs escaping.
    let frame = Frame {
        version: 0x01,
        seq: 0x01,
        flag: 0x10,
        frame_type: 0x01,
        payload: vec![0x1B; codec::MAX_PAYLOAD],
    };
    let wire = frame.encode().unwrap();
    let body_len = wire.len() - 2 * codec::DELIMITER_RUN;
    assert!(
        body_len <= codec::MAX_STUFFED_BODY,
        "stuffed body is {} bytes",
        body_len
    );
}

#[test]
fn wire_body_contains_no_unescaped_delimiters() {
    let frame = Frame {
        version: 0x01,
        seq: 0xA5,
        flag: 0x00,
        frame_type: 0x01,
        payload: vec![0x01, 0x1B, 0x10, 0x7F, 0x00],
    };
    let wire = frame.encode().unwrap();
    let body = &wire[codec::DELIMITER_RUN..wire.len() - codec::DELIMITER_RUN];

    let mut escaped = false;
    for &b in body {
        if escaped {
            escaped = false;
            continue;
        }
        if b == codec::DLE {
            escaped = true;
            continue;
        }
        assert!(
            b != codec::SOF && b != codec::EOF,
            "unescaped delimiter {:#04x} inside stuffed body",
            b
        );
    }
    assert!(!escaped, "body ends on a dangling escape");
}

#[test]
fn crc_catalogue_check_value() {
    assert_eq!(codec::crc16_modbus(b"123456789"), 0x4B37);
}
