//! Engine configuration: store identifiers and runtime policies.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes:
//!
//! ```json
//! {
//!   "database": { "connection": "/var/lib/bank", "event_table": "customer_events" },
//!   "policies": { "snapshot_policy": { "frequency": "AfterIntervalDeltas", "interval": 10 } }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// When an engine writes a new snapshot while posting events.
///
/// Catch-up during initialize and refresh always snapshots when it
/// replayed anything; this policy only governs ongoing writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frequency", content = "interval")]
pub enum SnapshotPolicy {
    /// Snapshot after every persisted event.
    AfterEachEvent,
    /// Snapshot once `seq - last_snapshot_seq` reaches the interval.
    AfterIntervalDeltas(u64),
    /// Snapshot once this many seconds passed since the last snapshot.
    AfterIntervalSeconds(u64),
    /// Snapshot once after each posted batch.
    #[default]
    AfterAllEvents,
}

/// Connection and table identifiers for the two stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Store location. The file-backed stores read it as a directory.
    pub connection: String,
    /// Name of the event table (a subdirectory for the file stores).
    pub event_table: String,
    /// Name of the snapshot table (a subdirectory for the file stores).
    pub snapshot_table: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection: "data".into(),
            event_table: "events".into(),
            snapshot_table: "snapshots".into(),
        }
    }
}

/// Defaults applied by handles and caches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoliciesConfig {
    /// Snapshot frequency for posted events.
    pub snapshot_policy: SnapshotPolicy,
    /// Reload from the stores on every state read unless told otherwise.
    pub default_force_refresh: bool,
    /// Reject posts against stale state unless told otherwise.
    pub default_only_when_current: bool,
    /// Initial cache capacity; `0` means unbounded.
    pub default_queue_size: usize,
}

/// Top-level configuration consumed by
/// [`StreamRegistryBuilder::from_config`](crate::StreamRegistryBuilder::from_config).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where events and snapshots live.
    pub database: DatabaseConfig,
    /// Runtime policy defaults.
    pub policies: PoliciesConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON config document.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] if the document is malformed
    /// or fails [`validate`](EngineConfig::validate).
    pub fn from_json_str(json: &str) -> Result<Self, StreamError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| StreamError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] if the file cannot be read or
    /// its contents are invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            StreamError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Check that the store identifiers are usable.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] naming the first empty field,
    /// or if an interval policy has a zero interval.
    pub fn validate(&self) -> Result<(), StreamError> {
        let db = &self.database;
        for (field, value) in [
            ("database.connection", &db.connection),
            ("database.event_table", &db.event_table),
            ("database.snapshot_table", &db.snapshot_table),
        ] {
            if value.trim().is_empty() {
                return Err(StreamError::Configuration(format!("{field} must not be empty")));
            }
        }
        if db.event_table == db.snapshot_table {
            return Err(StreamError::Configuration(
                "event and snapshot tables must differ".into(),
            ));
        }
        self.policies.validate()
    }
}

impl PoliciesConfig {
    /// Check the snapshot interval.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] if an interval policy has a
    /// zero interval.
    pub fn validate(&self) -> Result<(), StreamError> {
        match self.snapshot_policy {
            SnapshotPolicy::AfterIntervalDeltas(0) | SnapshotPolicy::AfterIntervalSeconds(0) => {
                Err(StreamError::Configuration(
                    "snapshot interval must be greater than zero".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}
