// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors

//! Configuration-driven link supervision (DCE role).
//!
//! The supervisor reconciles running proxies against the `CONSOLE_PORT`
//! table: entries appearing spawn a proxy, tracked-field changes respawn it,
//! removals stop it and retract the two owned state fields. The role-wide
//! enable flag is treated as "no configured links" when cleared at runtime,
//! so flipping it back needs no service restart.
//!
//! The loop blocks on the store watcher with a 1 s timeout and reconciles on
//! every wakeup, so it reacts to change notifications within a second, keeps
//! servicing the shutdown flag, and degrades gracefully to plain polling if
//! the subscription dies. Proxies that lost their device are respawned after
//! a backoff for as long as their entry remains configured.

use crate::config::{
    read_enabled, table_key, LinkSettings, ENTRY_CONSOLE_MGMT, TABLE_CONSOLE_PORT,
};
use crate::liveness::{HealthTicker, LinkHealth, LEASE, TICK};
use crate::proxy::LinkProxy;
use crate::store::{StoreError, Table, Watcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Watcher wait deadline; bounds reaction and shutdown latency.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(1);
/// Delay before re-attempting a failed proxy spawn.
pub const RESPAWN_BACKOFF: Duration = Duration::from_secs(5);

/// One configured link and whatever is currently running for it.
struct Slot {
    settings: LinkSettings,
    health: Arc<LinkHealth>,
    proxy: Option<LinkProxy>,
    retry_at: Instant,
}

/// The DCE-side reconciliation engine.
pub struct Supervisor {
    config: Arc<dyn Table>,
    state: Arc<dyn Table>,
    separator: String,
    prefix: String,
    symlink_dir: PathBuf,
    ticker: HealthTicker,
    links: HashMap<String, Slot>,
}

impl Supervisor {
    /// Build the supervisor and start the shared liveness ticker.
    pub fn new(
        config: Arc<dyn Table>,
        state: Arc<dyn Table>,
        separator: String,
        prefix: String,
        symlink_dir: PathBuf,
    ) -> crate::Result<Self> {
        Ok(Self {
            config,
            state,
            separator,
            prefix,
            symlink_dir,
            ticker: HealthTicker::start(TICK).map_err(crate::Error::Io)?,
            links: HashMap::new(),
        })
    }

    /// Run until the shutdown flag is raised, then tear everything down.
    pub fn run(&mut self, watcher: &mut dyn Watcher, shutdown: &AtomicBool) -> crate::Result<()> {
        self.reconcile();

        while !shutdown.load(Ordering::Acquire) {
            match watcher.wait(WAIT_TIMEOUT) {
                Ok(Some(event)) => {
                    log::debug!("[SUP] store change: {} ({})", event.key, event.op);
                }
                Ok(None) => {}
                Err(StoreError::SubscriptionLost) => {
                    // Reconciliation below still runs each second.
                    std::thread::sleep(WAIT_TIMEOUT);
                }
                Err(e) => {
                    log::warn!("[SUP] watcher error: {}", e);
                    std::thread::sleep(WAIT_TIMEOUT);
                }
            }
            self.reconcile();
        }

        log::info!("[SUP] shutting down {} link(s)", self.links.len());
        for (_, slot) in self.links.drain() {
            self.ticker.unregister(slot.settings.link_id.as_str());
            if let Some(proxy) = slot.proxy {
                proxy.stop();
            }
            // State fields stay as last published: a stopped supervisor must
            // not erase the operators' evidence. Retraction belongs to
            // config removal only.
        }
        Ok(())
    }

    /// Desired links per current configuration. Invalid entries are logged
    /// and skipped; a config read failure keeps the previous picture.
    fn desired(&self) -> Result<HashMap<String, LinkSettings>, StoreError> {
        if !read_enabled(self.config.as_ref(), &self.separator, ENTRY_CONSOLE_MGMT)? {
            return Ok(HashMap::new());
        }

        let prefix = format!("{}{}", TABLE_CONSOLE_PORT, self.separator);
        let mut desired = HashMap::new();
        for key in self.config.keys(&format!("{}*", prefix))? {
            let Some(link_id) = key.strip_prefix(&prefix) else {
                continue;
            };
            if link_id.is_empty() {
                continue;
            }
            let fields = self.config.get_all(&key)?;
            match LinkSettings::from_fields(link_id, &fields) {
                Ok(settings) => {
                    desired.insert(link_id.to_string(), settings);
                }
                Err(e) => log::warn!("[SUP] skipping {}: {}", key, e),
            }
        }
        Ok(desired)
    }

    fn reconcile(&mut self) {
        let desired = match self.desired() {
            Ok(desired) => desired,
            Err(e) => {
                log::warn!("[SUP] config read failed, keeping current links: {}", e);
                return;
            }
        };

        // Removed entries: stop the proxy and retract the owned state fields.
        let gone: Vec<String> = self
            .links
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for link_id in gone {
            if let Some(slot) = self.links.remove(&link_id) {
                log::info!("[SUP] link {} deconfigured", link_id);
                self.ticker.unregister(&link_id);
                if let Some(proxy) = slot.proxy {
                    proxy.stop();
                }
                slot.health.retract();
            }
        }

        for (link_id, settings) in desired {
            match self.links.get_mut(&link_id) {
                None => {
                    log::info!("[SUP] link {} configured", link_id);
                    let key = table_key(&self.separator, TABLE_CONSOLE_PORT, &link_id);
                    let health = LinkHealth::new(
                        &link_id,
                        key,
                        Arc::clone(&self.state),
                        LEASE,
                    );
                    self.ticker.register(Arc::clone(&health));
                    let mut slot = Slot {
                        settings,
                        health,
                        proxy: None,
                        retry_at: Instant::now(),
                    };
                    Self::try_spawn(&mut slot, &self.symlink_dir, &self.prefix);
                    self.links.insert(link_id, slot);
                }
                Some(slot) => {
                    if slot.settings != settings {
                        log::info!("[SUP] link {} reconfigured, respawning", link_id);
                        if let Some(proxy) = slot.proxy.take() {
                            proxy.stop();
                        }
                        slot.settings = settings;
                        slot.retry_at = Instant::now();
                        Self::try_spawn(slot, &self.symlink_dir, &self.prefix);
                    } else if slot.proxy.as_ref().is_some_and(|p| !p.is_alive()) {
                        log::warn!("[SUP] link {} proxy died", link_id);
                        if let Some(proxy) = slot.proxy.take() {
                            proxy.stop();
                        }
                        slot.retry_at = Instant::now() + RESPAWN_BACKOFF;
                    } else if slot.proxy.is_none() && Instant::now() >= slot.retry_at {
                        Self::try_spawn(slot, &self.symlink_dir, &self.prefix);
                    }
                }
            }
        }
    }

    fn try_spawn(slot: &mut Slot, symlink_dir: &std::path::Path, prefix: &str) {
        match LinkProxy::spawn(&slot.settings, Arc::clone(&slot.health), symlink_dir, prefix) {
            Ok(proxy) => slot.proxy = Some(proxy),
            Err(e) => {
                log::warn!(
                    "[SUP] link {} spawn failed, retrying in {:?}: {}",
                    slot.settings.link_id,
                    RESPAWN_BACKOFF,
                    e
                );
                slot.retry_at = Instant::now() + RESPAWN_BACKOFF;
            }
        }
    }
}
