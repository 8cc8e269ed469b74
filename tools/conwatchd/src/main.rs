// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors

//! conwatchd: the deployable entry point for both roles.
//!
//! `conwatchd dce` supervises per-link heartbeat proxies on the console
//! server; `conwatchd dte` runs the periodic heartbeat sender on the managed
//! device. Exit codes: 0 normal shutdown, 2 misconfiguration, 3 fatal I/O at
//! startup.

use clap::{Parser, Subcommand};
use conwatch::config::{
    read_enabled, read_udev_prefix, DEFAULT_BAUD, ENTRY_CONSOLE_MGMT, TABLE_CONSOLE_PORT,
    TABLE_CONSOLE_SWITCH,
};
use conwatch::store::{DbConfig, RedisTable, RedisWatcher, CONFIG_DB, STATE_DB};
use conwatch::{sender, Supervisor};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Attempts and spacing for the initial store connection.
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "conwatchd", version, about = "Serial console link liveness monitor")]
struct Cli {
    /// Store connection configuration file.
    #[arg(
        long,
        global = true,
        default_value = "/etc/conwatch/database_config.json"
    )]
    db_config: PathBuf,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Console-server side: supervise one proxy per configured link.
    Dce {
        /// Platform file holding the published-name prefix.
        #[arg(
            long,
            default_value = "/usr/share/conwatch/platform/udevprefix.conf"
        )]
        udev_prefix: PathBuf,

        /// Directory the PTY symlinks are published in.
        #[arg(long, default_value = "/dev")]
        symlink_dir: PathBuf,
    },
    /// Managed-device side: periodic heartbeat sender.
    Dte {
        /// Console UART (overrides `/proc/cmdline` discovery).
        #[arg(long)]
        device: Option<PathBuf>,

        /// Baud rate (defaults to the kernel console's, then 9600).
        #[arg(long)]
        baud: Option<u32>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let shutdown = match install_signal_flags() {
        Ok(flag) => flag,
        Err(e) => {
            log::error!("cannot install signal handlers: {}", e);
            std::process::exit(3);
        }
    };

    let result = match cli.role {
        Role::Dce {
            udev_prefix,
            symlink_dir,
        } => run_dce(&cli.db_config, &udev_prefix, symlink_dir, &shutdown),
        Role::Dte { device, baud } => run_dte(&cli.db_config, device, baud, &shutdown),
    };

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

/// SIGTERM/SIGINT raise the shutdown flag; SIGHUP is swallowed because
/// configuration arrives through the store, not signals.
fn install_signal_flags() -> std::io::Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::new(AtomicBool::new(false)))?;
    Ok(shutdown)
}

fn run_dce(
    db_config: &PathBuf,
    udev_prefix: &PathBuf,
    symlink_dir: PathBuf,
    shutdown: &AtomicBool,
) -> conwatch::Result<()> {
    let db = DbConfig::load(db_config)?;
    let config_db = db.database(CONFIG_DB)?;
    let state_db = db.database(STATE_DB)?;

    let config: Arc<dyn conwatch::Table> = Arc::new(RedisTable::connect_with_retry(
        &config_db,
        CONNECT_ATTEMPTS,
        CONNECT_DELAY,
    )?);
    let state: Arc<dyn conwatch::Table> = Arc::new(RedisTable::connect_with_retry(
        &state_db,
        CONNECT_ATTEMPTS,
        CONNECT_DELAY,
    )?);

    if !read_enabled(config.as_ref(), &config_db.separator, ENTRY_CONSOLE_MGMT)? {
        log::info!("[SUP] console management disabled; nothing to do");
        return Ok(());
    }

    let prefix = read_udev_prefix(udev_prefix);
    let mut watcher =
        RedisWatcher::subscribe(&config_db, &[TABLE_CONSOLE_PORT, TABLE_CONSOLE_SWITCH])?;

    let mut supervisor = Supervisor::new(
        config,
        state,
        config_db.separator.clone(),
        prefix,
        symlink_dir,
    )?;
    supervisor.run(&mut watcher, shutdown)
}

fn run_dte(
    db_config: &PathBuf,
    device: Option<PathBuf>,
    baud: Option<u32>,
    shutdown: &AtomicBool,
) -> conwatch::Result<()> {
    let (device, baud) = match device {
        Some(device) => (device, baud.unwrap_or(DEFAULT_BAUD)),
        None => match conwatch::config::kernel_console()? {
            Some((name, console_baud)) => (
                PathBuf::from("/dev").join(name),
                baud.unwrap_or(console_baud),
            ),
            None => {
                return Err(conwatch::Error::Config(
                    "no console uart: pass --device or boot with console=".to_string(),
                ))
            }
        },
    };

    let db = DbConfig::load(db_config)?;
    let config_db = db.database(CONFIG_DB)?;
    let config = RedisTable::connect_with_retry(&config_db, CONNECT_ATTEMPTS, CONNECT_DELAY)?;
    let mut watcher = RedisWatcher::subscribe(&config_db, &[TABLE_CONSOLE_SWITCH])?;

    sender::run(
        &config,
        &config_db.separator,
        device,
        baud,
        &mut watcher,
        shutdown,
    )
}
