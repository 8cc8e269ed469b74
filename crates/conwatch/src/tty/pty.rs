// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors

//! Pseudo-terminal pair for the operator-facing side of a link.
//!
//! Both ends stay open for the lifetime of the link: holding our own slave
//! descriptor keeps master writes queueing in the kernel buffer while no
//! operator tool is attached, instead of erroring out.

use super::TtyError;
use nix::pty::openpty;
use nix::sys::termios::{
    cfmakeraw, cfsetispeed, cfsetospeed, tcgetattr, tcsetattr, BaudRate, SetArg,
};
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

/// One allocated PTY pair, slave configured raw at the link baud.
#[derive(Debug)]
pub struct ConsolePty {
    master: OwnedFd,
    // Held open, never read: see module docs.
    _slave: OwnedFd,
    slave_path: PathBuf,
}

impl ConsolePty {
    /// Allocate a pair and mirror raw 8N1 settings at `baud` onto the slave.
    pub fn open(baud: u32) -> Result<Self, TtyError> {
        let rate = baud_rate(baud)?;
        let pty = openpty(None, None)?;

        let mut termios = tcgetattr(&pty.slave)?;
        cfmakeraw(&mut termios);
        cfsetispeed(&mut termios, rate)?;
        cfsetospeed(&mut termios, rate)?;
        tcsetattr(&pty.slave, SetArg::TCSANOW, &termios)?;

        set_nonblocking(pty.master.as_raw_fd())?;
        let slave_path = nix::unistd::ttyname(&pty.slave)?;

        Ok(Self {
            master: pty.master,
            _slave: pty.slave,
            slave_path,
        })
    }

    /// Filesystem path of the slave end (what operator tools open).
    #[must_use]
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// An independent non-blocking handle for reading the master end.
    pub fn master_reader(&self) -> Result<File, TtyError> {
        Ok(File::from(self.master.try_clone()?))
    }

    /// An independent non-blocking handle for writing the master end.
    pub fn master_writer(&self) -> Result<File, TtyError> {
        Ok(File::from(self.master.try_clone()?))
    }
}

fn baud_rate(baud: u32) -> Result<BaudRate, TtyError> {
    match baud {
        9600 => Ok(BaudRate::B9600),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115200 => Ok(BaudRate::B115200),
        230400 => Ok(BaudRate::B230400),
        other => Err(TtyError::UnsupportedBaud(other)),
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), TtyError> {
    // The O_NONBLOCK status flag lives on the open file description, so
    // every cloned handle of the master shares it.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(TtyError::Io(std::io::Error::last_os_error()));
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(TtyError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}
