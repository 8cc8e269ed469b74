// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors
//
// End-to-end proxy exercise with a PTY pair standing in for the UART: the
// test plays the remote switch on the master side while the proxy owns the
// slave as its "serial device". Covers heartbeat extraction, user-byte
// passthrough in both directions, symlink publication, and liveness.

use conwatch::codec::Frame;
use conwatch::config::LinkSettings;
use conwatch::liveness::LinkHealth;
use conwatch::store::{StoreError, Table};
use conwatch::tty::ConsolePty;
use conwatch::LinkProxy;
use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Minimal in-memory state table with hash-merge semantics.
#[derive(Default)]
struct MemState {
    data: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl Table for MemState {
    fn get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    fn set_fields(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        let entry = data.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert((*field).to_string(), (*value).to_string());
        }
        Ok(())
    }

    fn delete_fields(&self, key: &str, fields: &[&str]) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        if let Some(entry) = data.get_mut(key) {
            for field in fields {
                entry.remove(*field);
            }
        }
        Ok(())
    }

    fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        Ok(self
            .data
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {}", what);
}

/// Accumulate `want` bytes from a non-blocking reader within a deadline.
fn read_exactly(reader: &mut File, want: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    let deadline = Instant::now() + Duration::from_secs(10);
    while out.len() < want && Instant::now() < deadline {
        match reader.read(&mut buf) {
            Ok(0) => std::thread::sleep(Duration::from_millis(10)),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("read failed: {}", e),
        }
    }
    out
}

#[test]
fn proxy_separates_heartbeats_from_user_bytes() {
    let fake_uart = ConsolePty::open(9600).unwrap();
    let mut switch_side = fake_uart.master_writer().unwrap();

    let device = fake_uart
        .slave_path()
        .strip_prefix("/dev")
        .unwrap()
        .to_string_lossy()
        .into_owned();
    let settings = LinkSettings {
        link_id: "link1".to_string(),
        remote_device: device,
        baud: 9600,
        flow_control: false,
    };

    let state = Arc::new(MemState::default());
    let health = LinkHealth::new(
        "link1",
        "CONSOLE_PORT|link1".to_string(),
        Arc::clone(&state) as Arc<dyn Table>,
        Duration::from_secs(15),
    );

    let symlink_dir = tempfile::tempdir().unwrap();
    let proxy = LinkProxy::spawn(
        &settings,
        Arc::clone(&health),
        symlink_dir.path(),
        "C0-",
    )
    .unwrap();

    // The operator-facing name is published and resolves to a real PTY.
    let published = symlink_dir.path().join("VC0-link1");
    wait_for("published symlink", || published.exists());
    assert!(!health.is_up(), "no heartbeat seen yet");

    let mut operator = File::options()
        .read(true)
        .write(true)
        .open(&published)
        .unwrap();

    // The switch interleaves a heartbeat inside command output.
    let mut stream = Vec::new();
    stream.extend_from_slice(b"AB");
    stream.extend_from_slice(&Frame::heartbeat(0).encode().unwrap());
    stream.extend_from_slice(b"CD\n");
    switch_side.write_all(&stream).unwrap();

    let seen = read_exactly(&mut operator, 5);
    assert_eq!(seen, b"ABCD\n", "heartbeat bytes must not leak to the user");
    wait_for("liveness assertion", || health.is_up());
    assert_eq!(
        state
            .get_all("CONSOLE_PORT|link1")
            .unwrap()
            .get("oper_state")
            .map(String::as_str),
        Some("up")
    );

    // Operator typing passes through to the switch unfiltered.
    operator.write_all(b"show ver\r").unwrap();
    let mut switch_rx = fake_uart.master_reader().unwrap();
    let echoed = read_exactly(&mut switch_rx, 9);
    assert_eq!(echoed, b"show ver\r");

    proxy.stop();
    assert!(!published.exists(), "symlink removed on stop");
}

#[test]
fn proxy_survives_corrupt_frames() {
    let fake_uart = ConsolePty::open(9600).unwrap();
    let mut switch_side = fake_uart.master_writer().unwrap();

    let device = fake_uart
        .slave_path()
        .strip_prefix("/dev")
        .unwrap()
        .to_string_lossy()
        .into_owned();
    let settings = LinkSettings {
        link_id: "link2".to_string(),
        remote_device: device,
        baud: 9600,
        flow_control: false,
    };

    let state = Arc::new(MemState::default());
    let health = LinkHealth::new(
        "link2",
        "CONSOLE_PORT|link2".to_string(),
        Arc::clone(&state) as Arc<dyn Table>,
        Duration::from_secs(15),
    );

    let symlink_dir = tempfile::tempdir().unwrap();
    let proxy = LinkProxy::spawn(&settings, Arc::clone(&health), symlink_dir.path(), "").unwrap();

    let mut operator = File::options()
        .read(true)
        .write(true)
        .open(symlink_dir.path().join("Vlink2"))
        .unwrap();

    // A corrupted heartbeat (clobbered CRC byte) followed by a healthy one.
    let mut corrupted = Frame::heartbeat(7).encode().unwrap();
    let flip_at = corrupted.len() - 4;
    corrupted[flip_at] = 0x55;
    switch_side.write_all(&corrupted).unwrap();
    switch_side
        .write_all(&Frame::heartbeat(8).encode().unwrap())
        .unwrap();
    switch_side.write_all(b"ok\n").unwrap();

    let seen = read_exactly(&mut operator, 3);
    assert_eq!(seen, b"ok\n", "corrupt frame bytes stay out of the stream");
    wait_for("healthy heartbeat counted", || health.is_up());

    proxy.stop();
}
