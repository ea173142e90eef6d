//! Persisted, capped log of synchronization events
//!
//! The log is a data sink: appends never fail from the caller's point of view
//! and a corrupted log reads back as empty. Entries are stored as one JSON
//! array under a fixed key; once the cap is reached the oldest entries are
//! dropped first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::config::EventLogConfig;
use crate::errors::Result;
use crate::keys;
use tidemark_store::{LocalStore, LocalStoreExt};

/// One persisted log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    pub session_id: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub location: String,
}

impl LogEntry {
    /// Error-tagged entries: `*_error` / `*_failed` names or an `error` payload field
    pub fn is_error(&self) -> bool {
        self.event.ends_with("_error")
            || self.event.ends_with("_failed")
            || self.payload.get("error").map_or(false, |e| !e.is_null())
    }
}

/// Derived view over the log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogSummary {
    pub total: usize,
    pub by_event: BTreeMap<String, usize>,
    pub errors: usize,
    pub last_entry_at: Option<DateTime<Utc>>,
}

/// Exported log document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogExport {
    pub exported_at: DateTime<Utc>,
    pub session_id: String,
    pub summary: LogSummary,
    pub entries: Vec<LogEntry>,
}

/// Append-only event log backed by the local store
pub struct EventLog {
    store: Arc<dyn LocalStore>,
    config: EventLogConfig,
    session_id: String,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn new(store: Arc<dyn LocalStore>, config: EventLogConfig) -> Self {
        Self {
            store,
            config,
            session_id: uuid::Uuid::new_v4().to_string(),
            write_lock: Mutex::new(()),
        }
    }

    /// Identifier shared by every entry written through this instance
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Append an entry, trimming the oldest entries past capacity
    pub fn record(&self, event: &str, payload: Value) {
        debug!("sync log: {} {}", event, payload);

        let entry = LogEntry {
            timestamp: Utc::now(),
            event: event.to_string(),
            payload,
            session_id: self.session_id.clone(),
            agent: self.config.agent.clone(),
            location: self.config.location.clone(),
        };

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut entries = self.entries();
        entries.push(entry);
        if entries.len() > self.config.capacity {
            let excess = entries.len() - self.config.capacity;
            entries.drain(..excess);
        }

        if let Err(e) = self.store.set_json(keys::EVENT_LOG, &entries) {
            if !e.is_quota_exceeded() {
                warn!("Failed to persist sync log: {}", e);
                return;
            }

            // Storage is full: keep the newest half and try once more
            let keep = (entries.len() / 2).max(1);
            let start = entries.len() - keep;
            if let Err(e) = self.store.set_json(keys::EVENT_LOG, &entries[start..]) {
                warn!("Dropping sync log entry, storage is full: {}", e);
            }
        }
    }

    /// All entries, oldest first; unreadable logs read as empty
    pub fn entries(&self) -> Vec<LogEntry> {
        match self.store.get_json::<Vec<LogEntry>>(keys::EVENT_LOG) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                warn!("Sync log is unreadable, treating as empty: {}", e);
                Vec::new()
            }
        }
    }

    pub fn summary(&self) -> LogSummary {
        let entries = self.entries();

        let mut summary = LogSummary {
            total: entries.len(),
            ..Default::default()
        };
        for entry in &entries {
            *summary.by_event.entry(entry.event.clone()).or_insert(0) += 1;
            if entry.is_error() {
                summary.errors += 1;
            }
        }
        summary.last_entry_at = entries.last().map(|e| e.timestamp);

        summary
    }

    pub fn clear(&self) {
        if let Err(e) = self.store.remove(keys::EVENT_LOG) {
            warn!("Failed to clear sync log: {}", e);
        }
    }

    /// Pretty-printed export document for operators
    pub fn export(&self) -> Result<String> {
        let export = LogExport {
            exported_at: Utc::now(),
            session_id: self.session_id.clone(),
            summary: self.summary(),
            entries: self.entries(),
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Convenience for entries that only carry an error message
    pub fn record_error(&self, event: &str, error: &str) {
        self.record(event, json!({ "error": error }));
    }
}
