// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors

//! Key/value store client.
//!
//! The store speaks the Redis protocol and holds hashes under
//! `TABLE<sep>entry` keys. Two disciplines matter here:
//!
//! - **Hash-merge semantics.** Writers set named fields and deleters remove
//!   named fields; neither ever replaces or drops a whole key, because other
//!   components own other fields at the same keys.
//! - **Bounded waits.** Change notifications arrive through the key-space
//!   notification facility, drained by a watcher thread into a queue the
//!   owner pops with a timeout, so every consumer loop stays responsive to
//!   shutdown.

mod dbconfig;

pub use dbconfig::{DbConfig, ResolvedDb, CONFIG_DB, STATE_DB};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

/// Errors from the store client.
#[derive(Debug)]
pub enum StoreError {
    /// The connection-config file is missing or unparsable.
    ConfigFile { path: PathBuf, detail: String },
    /// Logical database name not present in the connection config.
    UnknownDatabase(String),
    /// A database references an instance that does not exist or has no address.
    UnknownInstance { database: String, instance: String },
    /// The backend rejected a command or the connection failed.
    Backend(redis::RedisError),
    /// The notification watcher died; callers fall back to periodic polling.
    SubscriptionLost,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::ConfigFile { path, detail } => {
                write!(f, "store config {}: {}", path.display(), detail)
            }
            StoreError::UnknownDatabase(name) => write!(f, "unknown database: {}", name),
            StoreError::UnknownInstance { database, instance } => {
                write!(f, "database {} references unusable instance {}", database, instance)
            }
            StoreError::Backend(e) => write!(f, "store backend: {}", e),
            StoreError::SubscriptionLost => write!(f, "store subscription lost"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Backend(e) => Some(e),
            _ => None,
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e)
    }
}

/// Hash-table operations against one logical database.
///
/// Object-safe so the reconciliation and liveness layers can be exercised
/// against an in-memory implementation.
pub trait Table: Send + Sync {
    /// All fields of `key` (empty map when the key is absent).
    fn get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    /// Merge `fields` into `key`, preserving fields not named here.
    fn set_fields(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError>;
    /// Delete exactly the named fields of `key`; other fields survive.
    fn delete_fields(&self, key: &str, fields: &[&str]) -> Result<(), StoreError>;
    /// Keys matching a glob pattern.
    fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

/// One key-space change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// Full key, e.g. `CONSOLE_PORT|link1`.
    pub key: String,
    /// Store-reported operation, e.g. `hset`, `hdel`, `del`.
    pub op: String,
}

/// Blocking wait on a queue of key-space changes.
pub trait Watcher: Send {
    /// Next change, `None` on timeout.
    fn wait(&mut self, timeout: Duration) -> Result<Option<KeyEvent>, StoreError>;
}

// ============================================================================
// Redis-backed implementations
// ============================================================================

/// [`Table`] over one Redis-protocol database.
///
/// Holds a lazily (re)established connection; an I/O error drops it so the
/// next operation redials instead of failing forever.
pub struct RedisTable {
    client: redis::Client,
    conn: Mutex<Option<redis::Connection>>,
}

impl RedisTable {
    /// Connect and verify the database answers.
    pub fn connect(db: &ResolvedDb) -> Result<Self, StoreError> {
        let client = redis::Client::open(db.url.as_str())?;
        let mut conn = client.get_connection()?;
        redis::cmd("PING").query::<()>(&mut conn)?;
        Ok(Self {
            client,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// [`Self::connect`] with a brief startup retry, for the window where
    /// the store service is still coming up.
    pub fn connect_with_retry(
        db: &ResolvedDb,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self, StoreError> {
        let mut last = None;
        for attempt in 1..=attempts {
            match Self::connect(db) {
                Ok(table) => return Ok(table),
                Err(e) => {
                    log::warn!(
                        "[STORE] connect to {} failed (attempt {}/{}): {}",
                        db.name,
                        attempt,
                        attempts,
                        e
                    );
                    last = Some(e);
                    if attempt < attempts {
                        std::thread::sleep(delay);
                    }
                }
            }
        }
        Err(last.unwrap_or(StoreError::SubscriptionLost))
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock();
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.client.get_connection()?,
        };
        match f(&mut conn) {
            Ok(value) => {
                *guard = Some(conn);
                Ok(value)
            }
            Err(e) => {
                // Keep the connection unless the transport itself failed.
                if !e.is_io_error() {
                    *guard = Some(conn);
                }
                Err(StoreError::Backend(e))
            }
        }
    }
}

impl Table for RedisTable {
    fn get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.with_conn(|conn| redis::cmd("HGETALL").arg(key).query(conn))
    }

    fn set_fields(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let mut cmd = redis::cmd("HSET");
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            cmd.query(conn)
        })
    }

    fn delete_fields(&self, key: &str, fields: &[&str]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let mut cmd = redis::cmd("HDEL");
            cmd.arg(key);
            for field in fields {
                cmd.arg(field);
            }
            cmd.query(conn)
        })
    }

    fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| redis::cmd("KEYS").arg(pattern).query(conn))
    }
}

/// Key-space notification watcher over a dedicated connection.
///
/// A background thread drains the subscription into a channel; [`wait`]
/// pops with a timeout. The thread observes its stop flag at least once a
/// second via the connection read timeout.
///
/// [`wait`]: Watcher::wait
pub struct RedisWatcher {
    rx: mpsc::Receiver<KeyEvent>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RedisWatcher {
    /// Subscribe to key-space events for the given table names.
    pub fn subscribe(db: &ResolvedDb, tables: &[&str]) -> Result<Self, StoreError> {
        let client = redis::Client::open(db.url.as_str())?;
        let mut conn = client.get_connection()?;

        // Key-space notifications are a server-side switch; enable them
        // best-effort (deployments may have done so already).
        if let Err(e) = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("KEA")
            .query::<()>(&mut conn)
        {
            log::debug!("[STORE] could not enable keyspace events: {}", e);
        }

        conn.set_read_timeout(Some(Duration::from_secs(1)))?;

        let patterns: Vec<String> = tables
            .iter()
            .map(|table| format!("__keyspace@{}__:{}{}*", db.id, table, db.separator))
            .collect();

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let (tx, rx) = mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("conwatch-store-watch".into())
            .spawn(move || {
                let mut pubsub = conn.as_pubsub();
                for pattern in &patterns {
                    if let Err(e) = pubsub.psubscribe(pattern) {
                        log::error!("[STORE] psubscribe {} failed: {}", pattern, e);
                        return;
                    }
                }
                loop {
                    if thread_stop.load(Ordering::Acquire) {
                        return;
                    }
                    match pubsub.get_message() {
                        Ok(msg) => {
                            let op = msg.get_payload::<String>().unwrap_or_default();
                            if let Some(key) = key_from_channel(msg.get_channel_name()) {
                                let event = KeyEvent {
                                    key: key.to_string(),
                                    op,
                                };
                                if tx.send(event).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) if e.is_timeout() => {}
                        Err(e) => {
                            log::error!("[STORE] subscription lost: {}", e);
                            return;
                        }
                    }
                }
            })
            .map_err(|e| StoreError::Backend(redis::RedisError::from(e)))?;

        Ok(Self {
            rx,
            stop,
            thread: Some(thread),
        })
    }
}

impl Watcher for RedisWatcher {
    fn wait(&mut self, timeout: Duration) -> Result<Option<KeyEvent>, StoreError> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(StoreError::SubscriptionLost),
        }
    }
}

impl Drop for RedisWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Extract the key from a key-space notification channel name,
/// e.g. `__keyspace@4__:CONSOLE_PORT|link1` -> `CONSOLE_PORT|link1`.
fn key_from_channel(channel: &str) -> Option<&str> {
    if !channel.starts_with("__keyspace@") {
        return None;
    }
    channel.find("__:").map(|idx| &channel[idx + 3..])
}

// ============================================================================
// Test doubles
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// In-memory [`Table`] with the same merge/delete field semantics.
    #[derive(Default)]
    pub(crate) struct MemTable {
        data: Mutex<HashMap<String, HashMap<String, String>>>,
    }

    impl MemTable {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn insert(&self, key: &str, fields: &[(&str, &str)]) {
            let mut data = self.data.lock();
            let entry = data.entry(key.to_string()).or_default();
            for (field, value) in fields {
                entry.insert((*field).to_string(), (*value).to_string());
            }
        }

        pub(crate) fn remove_key(&self, key: &str) {
            self.data.lock().remove(key);
        }

        pub(crate) fn field(&self, key: &str, field: &str) -> Option<String> {
            self.data.lock().get(key)?.get(field).cloned()
        }
    }

    impl Table for MemTable {
        fn get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
            Ok(self.data.lock().get(key).cloned().unwrap_or_default())
        }

        fn set_fields(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError> {
            self.insert(key, fields);
            Ok(())
        }

        fn delete_fields(&self, key: &str, fields: &[&str]) -> Result<(), StoreError> {
            let mut data = self.data.lock();
            if let Some(entry) = data.get_mut(key) {
                for field in fields {
                    entry.remove(*field);
                }
                if entry.is_empty() {
                    data.remove(key);
                }
            }
            Ok(())
        }

        fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
            // Only the `PREFIX*` shape is used in this codebase.
            let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
            Ok(self
                .data
                .lock()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }
    }

    /// [`Watcher`] fed from a channel by the test itself.
    pub(crate) struct ChannelWatcher(pub(crate) mpsc::Receiver<KeyEvent>);

    impl Watcher for ChannelWatcher {
        fn wait(&mut self, timeout: Duration) -> Result<Option<KeyEvent>, StoreError> {
            match self.0.recv_timeout(timeout) {
                Ok(event) => Ok(Some(event)),
                Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(StoreError::SubscriptionLost),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemTable;
    use super::*;

    #[test]
    fn test_key_from_channel() {
        assert_eq!(
            key_from_channel("__keyspace@4__:CONSOLE_PORT|link1"),
            Some("CONSOLE_PORT|link1")
        );
        assert_eq!(
            key_from_channel("__keyspace@6__:CONSOLE_SWITCH|console_mgmt"),
            Some("CONSOLE_SWITCH|console_mgmt")
        );
        assert_eq!(key_from_channel("somethingelse"), None);
    }

    #[test]
    fn test_mem_table_merges_and_deletes_fields() {
        let table = MemTable::new();
        table.insert("CONSOLE_PORT|1", &[("state", "busy"), ("pid", "42")]);

        table
            .set_fields("CONSOLE_PORT|1", &[("oper_state", "up")])
            .unwrap();
        assert_eq!(table.field("CONSOLE_PORT|1", "state").as_deref(), Some("busy"));

        table
            .delete_fields("CONSOLE_PORT|1", &["oper_state", "last_heartbeat"])
            .unwrap();
        assert_eq!(table.field("CONSOLE_PORT|1", "state").as_deref(), Some("busy"));
        assert_eq!(table.field("CONSOLE_PORT|1", "oper_state"), None);
    }

    #[test]
    fn test_mem_table_prefix_listing() {
        let table = MemTable::new();
        table.insert("CONSOLE_PORT|1", &[("baud_rate", "9600")]);
        table.insert("CONSOLE_PORT|2", &[("baud_rate", "9600")]);
        table.insert("CONSOLE_SWITCH|console_mgmt", &[("enabled", "yes")]);

        let mut keys = table.keys("CONSOLE_PORT|*").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["CONSOLE_PORT|1", "CONSOLE_PORT|2"]);
    }
}
