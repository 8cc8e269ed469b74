// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors

//! UART open and raw configuration.

use super::TtyError;
use serial2::{CharSize, FlowControl, Parity, SerialPort, Settings, StopBits};
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

/// Baud rates accepted for a console link.
pub const SUPPORTED_BAUDS: &[u32] = &[9600, 19200, 38400, 57600, 115200, 230400];

/// Open `path` as a raw 8N1 serial port.
///
/// Raw means no canonical processing, no echo, no input/output mapping, and
/// no flow control unless requested. The read timeout doubles as the
/// quiescence poll deadline of the owner's read loop.
pub fn open_uart(
    path: &Path,
    baud: u32,
    rtscts: bool,
    read_timeout: Duration,
) -> Result<SerialPort, TtyError> {
    if !SUPPORTED_BAUDS.contains(&baud) {
        return Err(TtyError::UnsupportedBaud(baud));
    }

    let mut port = SerialPort::open(path, |mut settings: Settings| {
        settings.set_raw();
        settings.set_baud_rate(baud)?;
        settings.set_char_size(CharSize::Bits8);
        settings.set_parity(Parity::None);
        settings.set_stop_bits(StopBits::One);
        settings.set_flow_control(if rtscts {
            FlowControl::RtsCts
        } else {
            FlowControl::None
        });
        Ok(settings)
    })
    .map_err(|source| TtyError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    port.set_read_timeout(read_timeout)?;
    port.set_write_timeout(Duration::from_secs(1))?;
    Ok(port)
}

/// True for read errors that mean "try again", not "the device is gone".
#[must_use]
pub fn is_transient_read_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}
