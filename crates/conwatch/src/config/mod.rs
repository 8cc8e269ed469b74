// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors

//! Typed views over the configuration tables and platform files.
//!
//! Table and field names live here as the single source of truth; nothing
//! else in the crate spells out a key by hand.

use crate::store::{StoreError, Table};
use crate::tty::SUPPORTED_BAUDS;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Table of per-link console port configuration and state.
pub const TABLE_CONSOLE_PORT: &str = "CONSOLE_PORT";
/// Table of role-wide enable flags.
pub const TABLE_CONSOLE_SWITCH: &str = "CONSOLE_SWITCH";

/// `CONSOLE_SWITCH` entry gating the DCE supervisor.
pub const ENTRY_CONSOLE_MGMT: &str = "console_mgmt";
/// `CONSOLE_SWITCH` entry gating the DTE sender.
pub const ENTRY_CONTROLLED_DEVICE: &str = "controlled_device";

pub const FIELD_ENABLED: &str = "enabled";
pub const FIELD_REMOTE_DEVICE: &str = "remote_device";
pub const FIELD_BAUD_RATE: &str = "baud_rate";
pub const FIELD_FLOW_CONTROL: &str = "flow_control";
/// State field owned by this crate: `up` or `down`.
pub const FIELD_OPER_STATE: &str = "oper_state";
/// State field owned by this crate: epoch seconds of the last heartbeat.
pub const FIELD_LAST_HEARTBEAT: &str = "last_heartbeat";

/// Default link baud when the entry does not name one.
pub const DEFAULT_BAUD: u32 = 9600;

/// Compose `TABLE<sep>entry`.
#[must_use]
pub fn table_key(separator: &str, table: &str, entry: &str) -> String {
    format!("{}{}{}", table, separator, entry)
}

/// Symlink name for a link: `V<prefix><link_id>`.
#[must_use]
pub fn symlink_name(prefix: &str, link_id: &str) -> String {
    format!("V{}{}", prefix, link_id)
}

/// Validated per-link configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    pub link_id: String,
    pub remote_device: String,
    pub baud: u32,
    pub flow_control: bool,
}

impl LinkSettings {
    /// Build from the raw fields of a `CONSOLE_PORT` entry.
    ///
    /// A missing device or an unlisted baud rejects the entry; the caller
    /// logs and skips it rather than failing the whole role.
    pub fn from_fields(
        link_id: &str,
        fields: &HashMap<String, String>,
    ) -> Result<Self, crate::Error> {
        let remote_device = fields
            .get(FIELD_REMOTE_DEVICE)
            .filter(|device| !device.is_empty())
            .ok_or_else(|| {
                crate::Error::Config(format!("link {}: missing {}", link_id, FIELD_REMOTE_DEVICE))
            })?
            .clone();

        let baud = match fields.get(FIELD_BAUD_RATE) {
            None => DEFAULT_BAUD,
            Some(raw) => raw.parse::<u32>().ok().filter(|b| SUPPORTED_BAUDS.contains(b)).ok_or_else(
                || crate::Error::Config(format!("link {}: invalid baud rate {:?}", link_id, raw)),
            )?,
        };

        let flow_control = fields
            .get(FIELD_FLOW_CONTROL)
            .map(|v| v == "yes")
            .unwrap_or(false);

        Ok(Self {
            link_id: link_id.to_string(),
            remote_device,
            baud,
            flow_control,
        })
    }

    /// Device path under `/dev`.
    #[must_use]
    pub fn device_path(&self) -> PathBuf {
        Path::new("/dev").join(&self.remote_device)
    }
}

/// Read a `CONSOLE_SWITCH` enable flag. Absent entries read as disabled.
pub fn read_enabled(
    config: &dyn Table,
    separator: &str,
    entry: &str,
) -> Result<bool, StoreError> {
    let key = table_key(separator, TABLE_CONSOLE_SWITCH, entry);
    let fields = config.get_all(&key)?;
    Ok(fields.get(FIELD_ENABLED).map(String::as_str) == Some("yes"))
}

/// Read the platform symlink prefix file. A missing file means no prefix.
#[must_use]
pub fn read_udev_prefix(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(raw) => raw.trim().to_string(),
        Err(e) => {
            log::info!(
                "[SUP] no udev prefix at {} ({}); publishing unprefixed names",
                path.display(),
                e
            );
            String::new()
        }
    }
}

/// Parse the last `console=<tty>,<baud>` token of a kernel command line.
///
/// The baud may carry a parity/bits suffix (`9600n8`); only the leading
/// digits count. A console without a baud defaults to 9600.
#[must_use]
pub fn parse_kernel_console(cmdline: &str) -> Option<(String, u32)> {
    let mut result = None;
    for token in cmdline.split_whitespace() {
        let Some(value) = token.strip_prefix("console=") else {
            continue;
        };
        let (device, rest) = match value.split_once(',') {
            Some((device, rest)) => (device, rest),
            None => (value, ""),
        };
        if device.is_empty() {
            continue;
        }
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        let baud = digits.parse::<u32>().unwrap_or(DEFAULT_BAUD);
        result = Some((device.to_string(), baud));
    }
    result
}

/// [`parse_kernel_console`] over `/proc/cmdline`.
pub fn kernel_console() -> std::io::Result<Option<(String, u32)>> {
    let cmdline = std::fs::read_to_string("/proc/cmdline")?;
    Ok(parse_kernel_console(&cmdline))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_link_settings_defaults() {
        let settings =
            LinkSettings::from_fields("link1", &fields(&[("remote_device", "ttyUSB0")])).unwrap();
        assert_eq!(settings.baud, 9600);
        assert!(!settings.flow_control);
        assert_eq!(settings.device_path(), Path::new("/dev/ttyUSB0"));
    }

    #[test]
    fn test_link_settings_full_entry() {
        let settings = LinkSettings::from_fields(
            "link2",
            &fields(&[
                ("remote_device", "ttyUSB3"),
                ("baud_rate", "115200"),
                ("flow_control", "yes"),
            ]),
        )
        .unwrap();
        assert_eq!(settings.baud, 115200);
        assert!(settings.flow_control);
    }

    #[test]
    fn test_link_settings_rejects_missing_device() {
        assert!(LinkSettings::from_fields("x", &fields(&[("baud_rate", "9600")])).is_err());
    }

    #[test]
    fn test_link_settings_rejects_bad_baud() {
        let err = LinkSettings::from_fields(
            "x",
            &fields(&[("remote_device", "ttyS0"), ("baud_rate", "31337")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid baud"));
    }

    #[test]
    fn test_symlink_name_composition() {
        assert_eq!(symlink_name("C0-", "link1"), "VC0-link1");
        assert_eq!(symlink_name("", "7"), "V7");
    }

    #[test]
    fn test_parse_kernel_console_last_token_wins() {
        let cmdline = "BOOT_IMAGE=/boot/vmlinuz console=tty0 quiet console=ttyS0,115200n8 rw";
        assert_eq!(
            parse_kernel_console(cmdline),
            Some(("ttyS0".to_string(), 115200))
        );
    }

    #[test]
    fn test_parse_kernel_console_defaults_baud() {
        assert_eq!(
            parse_kernel_console("console=ttyS1"),
            Some(("ttyS1".to_string(), 9600))
        );
        assert_eq!(parse_kernel_console("quiet splash"), None);
    }
}
