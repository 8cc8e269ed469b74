// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 conwatch contributors

//! Store connection configuration.
//!
//! Logical database names resolve to a numeric id, a socket address, and a
//! key separator through a JSON file maintained by the platform. Nothing
//! about the store topology is hard-coded here.
//!
//! ```json
//! {
//!   "INSTANCES": {
//!     "local": { "unix_socket_path": "/var/run/conwatch/store.sock" }
//!   },
//!   "DATABASES": {
//!     "CONFIG_DB": { "id": 4, "separator": "|", "instance": "local" },
//!     "STATE_DB":  { "id": 6, "separator": "|", "instance": "local" }
//!   },
//!   "VERSION": "1.0"
//! }
//! ```

use super::StoreError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Logical name of the configuration database.
pub const CONFIG_DB: &str = "CONFIG_DB";
/// Logical name of the state database.
pub const STATE_DB: &str = "STATE_DB";

#[derive(Debug, Clone, Deserialize)]
struct Instance {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    unix_socket_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Database {
    id: i64,
    separator: String,
    instance: String,
}

/// Parsed store connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    #[serde(rename = "INSTANCES")]
    instances: HashMap<String, Instance>,
    #[serde(rename = "DATABASES")]
    databases: HashMap<String, Database>,
}

/// One logical database resolved against its instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDb {
    /// Logical name (`CONFIG_DB`, `STATE_DB`).
    pub name: String,
    /// Numeric database id on the instance.
    pub id: i64,
    /// Key separator between table name and entry name.
    pub separator: String,
    /// Connection URL for the client.
    pub url: String,
}

impl DbConfig {
    /// Load and parse the configuration file.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path).map_err(|e| StoreError::ConfigFile {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        Self::parse(&raw).map_err(|detail| StoreError::ConfigFile {
            path: path.to_path_buf(),
            detail,
        })
    }

    fn parse(raw: &str) -> Result<Self, String> {
        serde_json::from_str(raw).map_err(|e| e.to_string())
    }

    /// Resolve a logical database name.
    pub fn database(&self, name: &str) -> Result<ResolvedDb, StoreError> {
        let db = self
            .databases
            .get(name)
            .ok_or_else(|| StoreError::UnknownDatabase(name.to_string()))?;
        let instance =
            self.instances
                .get(&db.instance)
                .ok_or_else(|| StoreError::UnknownInstance {
                    database: name.to_string(),
                    instance: db.instance.clone(),
                })?;

        let url = match (&instance.unix_socket_path, &instance.hostname) {
            (Some(sock), _) => format!("redis+unix://{}?db={}", sock, db.id),
            (None, Some(host)) => {
                format!("redis://{}:{}/{}", host, instance.port.unwrap_or(6379), db.id)
            }
            (None, None) => {
                return Err(StoreError::UnknownInstance {
                    database: name.to_string(),
                    instance: db.instance.clone(),
                })
            }
        };

        Ok(ResolvedDb {
            name: name.to_string(),
            id: db.id,
            separator: db.separator.clone(),
            url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "INSTANCES": {
            "local": { "unix_socket_path": "/var/run/store/store.sock", "persistence_for_warm_boot": "yes" },
            "remote": { "hostname": "127.0.0.1", "port": 6400 }
        },
        "DATABASES": {
            "CONFIG_DB": { "id": 4, "separator": "|", "instance": "local" },
            "STATE_DB": { "id": 6, "separator": "|", "instance": "remote" }
        },
        "VERSION": "1.0"
    }"#;

    #[test]
    fn test_resolve_unix_socket_database() {
        let cfg = DbConfig::parse(SAMPLE).unwrap();
        let db = cfg.database(CONFIG_DB).unwrap();
        assert_eq!(db.id, 4);
        assert_eq!(db.separator, "|");
        assert_eq!(db.url, "redis+unix:///var/run/store/store.sock?db=4");
    }

    #[test]
    fn test_resolve_tcp_database() {
        let cfg = DbConfig::parse(SAMPLE).unwrap();
        let db = cfg.database(STATE_DB).unwrap();
        assert_eq!(db.url, "redis://127.0.0.1:6400/6");
    }

    #[test]
    fn test_unknown_database_is_an_error() {
        let cfg = DbConfig::parse(SAMPLE).unwrap();
        assert!(matches!(
            cfg.database("COUNTERS_DB"),
            Err(StoreError::UnknownDatabase(_))
        ));
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = DbConfig::load(Path::new("/nonexistent/database_config.json")).unwrap_err();
        assert!(err.to_string().contains("database_config.json"));
    }
}
