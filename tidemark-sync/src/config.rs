//! Engine configuration
//!
//! Every section deserializes with defaults for missing fields, so a config
//! file only needs to name what it changes. Durations are stored as integer
//! milliseconds or seconds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::errors::{Result, SyncError};

/// Which automatic triggers the orchestrator wires up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Push on a fixed interval whenever watched data exists
    pub periodic: bool,
    /// Push when the fingerprint of the watched keys changes
    pub change_detection: bool,
    /// React to focus, visibility, connectivity and unload signals
    pub lifecycle: bool,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            periodic: true,
            change_detection: true,
            lifecycle: true,
        }
    }
}

impl TriggerConfig {
    /// No automatic triggers at all; only manual saves and syncs
    pub fn manual_only() -> Self {
        Self {
            periodic: false,
            change_detection: false,
            lifecycle: false,
        }
    }
}

/// Autosave scheduling and retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSaveConfig {
    /// Periodic push interval
    pub save_interval_ms: u64,
    /// Change-detection poll interval
    pub change_check_interval_ms: u64,
    /// Push attempts before giving up and handing off to recovery
    pub max_retries: u32,
    /// Per-attempt timeout
    pub timeout_ms: u64,
    /// Base delay for exponential backoff between attempts
    pub retry_delay_ms: u64,
    /// Local keys whose contents are fingerprinted for change detection
    pub watched_keys: Vec<String>,
    pub triggers: TriggerConfig,
    /// Skip automatic pulls while local data has not been pushed
    pub hold_pulls_while_unsynced: bool,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            save_interval_ms: 30_000,
            change_check_interval_ms: 5_000,
            max_retries: 3,
            timeout_ms: 10_000,
            retry_delay_ms: 1_000,
            watched_keys: vec!["records".to_string()],
            triggers: TriggerConfig::default(),
            hold_pulls_while_unsynced: true,
        }
    }
}

impl AutoSaveConfig {
    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }

    pub fn change_check_interval(&self) -> Duration {
        Duration::from_millis(self.change_check_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay after failed attempt `attempt` (1-based): `retry_delay * 2^(attempt-1)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(1u64 << exponent))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(SyncError::Config("max_retries must be at least 1".into()));
        }
        if self.save_interval_ms == 0 || self.change_check_interval_ms == 0 {
            return Err(SyncError::Config("intervals must be non-zero".into()));
        }
        if self.timeout_ms == 0 {
            return Err(SyncError::Config("timeout_ms must be non-zero".into()));
        }
        if self.watched_keys.is_empty() {
            return Err(SyncError::Config("watched_keys must not be empty".into()));
        }
        Ok(())
    }
}

/// Renaming between remote column names and local field names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub remote: String,
    pub local: String,
}

impl FieldMapping {
    pub fn new(remote: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            local: local.into(),
        }
    }
}

/// Push/pull transfer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Primary local collection
    pub collection_key: String,
    /// Remote table per local collection; unmapped collections use their own name
    pub tables: BTreeMap<String, String>,
    /// Unique identifier field, used as the upsert conflict key
    pub id_field: String,
    pub field_mapping: Vec<FieldMapping>,
    /// Large or opaque fields dropped by the first storage fallback tier
    pub heavy_fields: Vec<String>,
    /// Fields kept by the last-resort storage fallback tier (local names)
    pub essential_fields: Vec<String>,
    /// Records kept by the last-resort storage fallback tier
    pub essential_limit: usize,
    /// Local keys removed before a pull with forced cleanup
    pub cleanup_keys: Vec<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        let mut tables = BTreeMap::new();
        tables.insert("records".to_string(), "records".to_string());

        Self {
            collection_key: "records".to_string(),
            tables,
            id_field: "id".to_string(),
            field_mapping: vec![
                FieldMapping::new("created_at", "createdAt"),
                FieldMapping::new("updated_at", "updatedAt"),
            ],
            heavy_fields: vec![
                "attachments".to_string(),
                "photos".to_string(),
                "signature".to_string(),
            ],
            essential_fields: vec![
                "id".to_string(),
                "title".to_string(),
                "status".to_string(),
                "createdAt".to_string(),
                "updatedAt".to_string(),
            ],
            essential_limit: 50,
            cleanup_keys: vec![
                "records".to_string(),
                crate::keys::WATERMARK.to_string(),
            ],
        }
    }
}

impl ReconcileConfig {
    /// Remote table backing a local collection
    pub fn table_for<'a>(&'a self, collection: &'a str) -> &'a str {
        self.tables
            .get(collection)
            .map(String::as_str)
            .unwrap_or(collection)
    }
}

/// Recovery ladder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Base delay of the retry-with-delay strategy, scaled by `retry_count + 1`
    pub base_delay_ms: u64,
    /// First degraded-mode probe
    pub probe_delay_secs: u64,
    /// Probe interval after a failed probe
    pub probe_retry_delay_secs: u64,
    /// Keys snapshotted and restored around destructive recovery steps
    pub critical_keys: Vec<String>,
    /// Cache keys removed by the cache-clear strategy
    pub corruptible_keys: Vec<String>,
    /// Collections pushed by the partial-sync strategy
    pub essential_collections: Vec<String>,
    /// Keys kept by emergency recovery besides critical keys and engine markers
    pub preserved_keys: Vec<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            probe_delay_secs: 300,
            probe_retry_delay_secs: 600,
            critical_keys: vec![
                "session".to_string(),
                "current_user".to_string(),
                "form_draft".to_string(),
            ],
            corruptible_keys: vec![
                "records_cache".to_string(),
                "sync_queue".to_string(),
                "pending_changes".to_string(),
            ],
            essential_collections: vec!["records".to_string()],
            preserved_keys: vec!["settings".to_string()],
        }
    }
}

impl RecoveryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn probe_delay(&self) -> Duration {
        Duration::from_secs(self.probe_delay_secs)
    }

    pub fn probe_retry_delay(&self) -> Duration {
        Duration::from_secs(self.probe_retry_delay_secs)
    }
}

/// Persisted event log settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Maximum entries kept; older entries are dropped first
    pub capacity: usize,
    /// Agent string recorded with every entry
    pub agent: String,
    /// Location (origin or working directory) recorded with every entry
    pub location: String,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            agent: format!("tidemark/{}", env!("CARGO_PKG_VERSION")),
            location: "local".to_string(),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub autosave: AutoSaveConfig,
    pub reconcile: ReconcileConfig,
    pub recovery: RecoveryConfig,
    pub log: EventLogConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.autosave.validate()?;

        if self.reconcile.collection_key.is_empty() || self.reconcile.id_field.is_empty() {
            return Err(SyncError::Config(
                "collection_key and id_field must be set".into(),
            ));
        }
        if self.log.capacity == 0 {
            return Err(SyncError::Config("log capacity must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let config = AutoSaveConfig {
            retry_delay_ms: 100,
            ..Default::default()
        };

        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_validation() {
        assert!(EngineConfig::default().validate().is_ok());

        let mut config = EngineConfig::default();
        config.autosave.max_retries = 0;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let mut config = EngineConfig::default();
        config.autosave.watched_keys.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"autosave": {"max_retries": 5}}"#).unwrap();

        assert_eq!(config.autosave.max_retries, 5);
        assert_eq!(config.autosave.retry_delay_ms, 1_000);
        assert_eq!(config.recovery.probe_delay_secs, 300);
        assert_eq!(config.reconcile.table_for("records"), "records");
        assert_eq!(config.reconcile.table_for("notes"), "notes");
    }
}
