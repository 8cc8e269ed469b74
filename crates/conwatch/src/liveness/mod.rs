// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors

//! Per-link liveness lease.
//!
//! Every decoded heartbeat renews a 15 s lease; a shared once-per-second
//! ticker demotes links whose lease expired. State transitions publish
//! `oper_state` and `last_heartbeat` (epoch seconds) to the state store
//! with hash-merge semantics; fields owned by other components at the
//! same key are never touched.
//!
//! A link starts `down` and waits for evidence rather than assuming `up`.
//! On demotion `last_heartbeat` is retained so operators can tell how stale
//! the link is. Heartbeat assertions (RX thread) and demotions (ticker or a
//! dying proxy) are serialized by the per-link mutex, and a demotion
//! re-checks the lease under the lock, so it can never clobber a strictly
//! newer assertion.

use crate::config::{FIELD_LAST_HEARTBEAT, FIELD_OPER_STATE};
use crate::store::Table;
use crate::sync::StopHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Inactivity lease: a link is `down` this long after its last heartbeat.
pub const LEASE: Duration = Duration::from_secs(15);
/// Expiry check cadence.
pub const TICK: Duration = Duration::from_secs(1);

/// Published value of [`FIELD_OPER_STATE`] for a live link.
pub const OPER_UP: &str = "up";
/// Published value of [`FIELD_OPER_STATE`] for a dead or unproven link.
pub const OPER_DOWN: &str = "down";

#[derive(Debug)]
struct HealthInner {
    up: bool,
    last_beat: Option<Instant>,
}

/// Liveness record of one link.
pub struct LinkHealth {
    link_id: String,
    key: String,
    lease: Duration,
    state: Arc<dyn Table>,
    inner: Mutex<HealthInner>,
}

impl LinkHealth {
    /// Create the record and publish the initial `down` state.
    ///
    /// `key` is the state-store key this record owns two fields of.
    pub fn new(
        link_id: &str,
        key: String,
        state: Arc<dyn Table>,
        lease: Duration,
    ) -> Arc<Self> {
        let health = Arc::new(Self {
            link_id: link_id.to_string(),
            key,
            lease,
            state,
            inner: Mutex::new(HealthInner {
                up: false,
                last_beat: None,
            }),
        });
        health.write(&[(FIELD_OPER_STATE, OPER_DOWN)]);
        health
    }

    #[must_use]
    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    /// A heartbeat arrived: renew the lease and publish.
    pub fn assert_alive(&self) {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();

        let mut inner = self.inner.lock();
        inner.last_beat = Some(Instant::now());
        let was_up = inner.up;
        inner.up = true;
        self.write(&[
            (FIELD_OPER_STATE, OPER_UP),
            (FIELD_LAST_HEARTBEAT, epoch.as_str()),
        ]);
        drop(inner);

        if !was_up {
            log::info!("[LIVENESS:{}] link up", self.link_id);
        }
    }

    /// Demote to `down` if the lease has expired. Called by the ticker.
    pub fn expire_if_stale(&self) {
        let mut inner = self.inner.lock();
        if !inner.up {
            return;
        }
        let fresh = inner
            .last_beat
            .is_some_and(|at| at.elapsed() <= self.lease);
        if fresh {
            return;
        }
        inner.up = false;
        self.write(&[(FIELD_OPER_STATE, OPER_DOWN)]);
        drop(inner);

        log::info!(
            "[LIVENESS:{}] link down (no heartbeat within {:?})",
            self.link_id,
            self.lease
        );
    }

    /// Demote unconditionally (the proxy lost its device).
    pub fn mark_down(&self) {
        let mut inner = self.inner.lock();
        if !inner.up {
            return;
        }
        inner.up = false;
        self.write(&[(FIELD_OPER_STATE, OPER_DOWN)]);
        drop(inner);

        log::info!("[LIVENESS:{}] link down", self.link_id);
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        self.inner.lock().up
    }

    /// Remove the two owned fields from the store (link deconfigured).
    pub fn retract(&self) {
        if let Err(e) = self
            .state
            .delete_fields(&self.key, &[FIELD_OPER_STATE, FIELD_LAST_HEARTBEAT])
        {
            log::warn!("[LIVENESS:{}] retract failed: {}", self.link_id, e);
        }
    }

    /// Best-effort merge write; the next transition retries a failed one.
    fn write(&self, fields: &[(&str, &str)]) {
        if let Err(e) = self.state.set_fields(&self.key, fields) {
            log::warn!("[LIVENESS:{}] state write failed: {}", self.link_id, e);
        }
    }
}

/// Shared expiry ticker: walks every registered link once per tick.
pub struct HealthTicker {
    links: Arc<Mutex<HashMap<String, Arc<LinkHealth>>>>,
    _stop: StopHandle,
}

impl HealthTicker {
    /// Spawn the ticker thread.
    pub fn start(tick: Duration) -> std::io::Result<Self> {
        let links: Arc<Mutex<HashMap<String, Arc<LinkHealth>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let thread_links = Arc::clone(&links);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("conwatch-liveness".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(tick) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }
                let snapshot: Vec<Arc<LinkHealth>> =
                    thread_links.lock().values().cloned().collect();
                for health in snapshot {
                    health.expire_if_stale();
                }
            })?;

        Ok(Self {
            links,
            _stop: StopHandle::new(stop_tx, thread),
        })
    }

    /// Register a link for expiry checks.
    pub fn register(&self, health: Arc<LinkHealth>) {
        self.links
            .lock()
            .insert(health.link_id().to_string(), health);
    }

    /// Remove a link from expiry checks.
    pub fn unregister(&self, link_id: &str) {
        self.links.lock().remove(link_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::MemTable;

    const KEY: &str = "CONSOLE_PORT|link1";

    fn health(table: &Arc<MemTable>, lease: Duration) -> Arc<LinkHealth> {
        LinkHealth::new(
            "link1",
            KEY.to_string(),
            Arc::clone(table) as Arc<dyn Table>,
            lease,
        )
    }

    #[test]
    fn test_initial_state_is_down_without_timestamp() {
        let table = MemTable::new();
        let h = health(&table, LEASE);
        assert!(!h.is_up());
        assert_eq!(table.field(KEY, FIELD_OPER_STATE).as_deref(), Some("down"));
        assert_eq!(table.field(KEY, FIELD_LAST_HEARTBEAT), None);
    }

    #[test]
    fn test_heartbeat_publishes_up_with_timestamp() {
        let table = MemTable::new();
        let h = health(&table, LEASE);
        h.assert_alive();

        assert!(h.is_up());
        assert_eq!(table.field(KEY, FIELD_OPER_STATE).as_deref(), Some("up"));
        let ts: u64 = table
            .field(KEY, FIELD_LAST_HEARTBEAT)
            .unwrap()
            .parse()
            .unwrap();
        assert!(ts > 1_600_000_000, "timestamp should be epoch seconds");
    }

    #[test]
    fn test_lease_expiry_demotes_but_keeps_timestamp() {
        let table = MemTable::new();
        let h = health(&table, Duration::from_millis(50));
        h.assert_alive();
        let ts = table.field(KEY, FIELD_LAST_HEARTBEAT).unwrap();

        h.expire_if_stale();
        assert!(h.is_up(), "lease not expired yet");

        std::thread::sleep(Duration::from_millis(80));
        h.expire_if_stale();
        assert!(!h.is_up());
        assert_eq!(table.field(KEY, FIELD_OPER_STATE).as_deref(), Some("down"));
        assert_eq!(
            table.field(KEY, FIELD_LAST_HEARTBEAT).as_deref(),
            Some(ts.as_str()),
            "stale timestamp is evidence, not garbage"
        );
    }

    #[test]
    fn test_fresh_heartbeat_wins_over_demotion() {
        let table = MemTable::new();
        let h = health(&table, Duration::from_millis(50));
        h.assert_alive();
        std::thread::sleep(Duration::from_millis(80));
        // Heartbeat lands right before the ticker looks.
        h.assert_alive();
        h.expire_if_stale();
        assert!(h.is_up());
    }

    #[test]
    fn test_retract_preserves_foreign_fields() {
        let table = MemTable::new();
        table.insert(KEY, &[("state", "busy"), ("pid", "1234")]);

        let h = health(&table, LEASE);
        h.assert_alive();
        h.retract();

        assert_eq!(table.field(KEY, FIELD_OPER_STATE), None);
        assert_eq!(table.field(KEY, FIELD_LAST_HEARTBEAT), None);
        assert_eq!(table.field(KEY, "state").as_deref(), Some("busy"));
        assert_eq!(table.field(KEY, "pid").as_deref(), Some("1234"));
    }

    #[test]
    fn test_ticker_demotes_registered_links() {
        let table = MemTable::new();
        let h = health(&table, Duration::from_millis(50));
        let ticker = HealthTicker::start(Duration::from_millis(20)).unwrap();
        ticker.register(Arc::clone(&h));

        h.assert_alive();
        assert!(h.is_up());

        std::thread::sleep(Duration::from_millis(200));
        assert!(!h.is_up(), "ticker should have demoted the link");

        ticker.unregister("link1");
    }
}
