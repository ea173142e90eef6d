//! In-process remote store
//!
//! Behaves like the managed backend: rows are keyed per table, every write is
//! stamped with `updated_at`, and changes are published on the table feed.
//! Outages and per-record rejections can be simulated for failure testing.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::errors::{Result, StoreError};
use crate::remote::{
    format_timestamp, record_id, ChangeEvent, ChangeFeed, ChangeKind, Query, Record, RemoteStore,
    UPDATED_AT,
};

/// Remote store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryRemote {
    tables: RwLock<HashMap<String, BTreeMap<String, Record>>>,
    unreachable: AtomicBool,
    rejected_ids: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    feed: ChangeFeed,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the connection to the backend
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Make every upsert of `id` fail until `accept_id` is called
    pub fn reject_id(&self, id: impl Into<String>) {
        self.rejected().insert(id.into());
    }

    pub fn accept_id(&self, id: &str) {
        self.rejected().remove(id);
    }

    /// Number of requests received, including failed ones
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Snapshot of a table ordered by identifier
    pub async fn rows(&self, table: &str) -> Vec<Record> {
        self.tables
            .read()
            .await
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn rejected(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.rejected_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin_call(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable(
                "in-memory remote is offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Record>> {
        self.begin_call()?;

        let tables = self.tables.read().await;
        let rows = tables
            .get(table)
            .map(|rows| query.apply(rows.values().cloned()))
            .unwrap_or_default();

        debug!("Selected {} rows from {}", rows.len(), table);
        Ok(rows)
    }

    async fn upsert(&self, table: &str, mut record: Record, conflict_key: &str) -> Result<Record> {
        self.begin_call()?;

        let id = record_id(&record, conflict_key).ok_or_else(|| {
            StoreError::InvalidRecord(format!("missing conflict key '{}'", conflict_key))
        })?;

        if self.rejected().contains(&id) {
            return Err(StoreError::Rejected {
                id,
                reason: "rejected by remote".to_string(),
            });
        }

        record.insert(
            UPDATED_AT.to_string(),
            Value::String(format_timestamp(Utc::now())),
        );

        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .insert(id.clone(), record.clone());

        self.feed.publish(ChangeEvent {
            table: table.to_string(),
            kind: ChangeKind::Upsert,
            id,
            record: Some(record.clone()),
        });

        Ok(record)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        self.begin_call()?;

        let removed = self
            .tables
            .write()
            .await
            .get_mut(table)
            .and_then(|rows| rows.remove(id))
            .is_some();

        if removed {
            self.feed.publish(ChangeEvent {
                table: table.to_string(),
                kind: ChangeKind::Delete,
                id: id.to_string(),
                record: None,
            });
        }

        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.begin_call()
    }

    fn subscribe(&self, table: &str) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_key() {
        let remote = MemoryRemote::new();
        remote
            .upsert("records", row(json!({"id": "r1", "title": "first"})), "id")
            .await
            .unwrap();
        remote
            .upsert("records", row(json!({"id": "r1", "title": "second"})), "id")
            .await
            .unwrap();

        let rows = remote.rows("records").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "second");
        assert!(rows[0].contains_key(UPDATED_AT));
    }

    #[tokio::test]
    async fn test_missing_key_and_rejection() {
        let remote = MemoryRemote::new();
        let err = remote
            .upsert("records", row(json!({"title": "no id"})), "id")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));

        remote.reject_id("bad");
        let err = remote
            .upsert("records", row(json!({"id": "bad"})), "id")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { .. }));

        remote.accept_id("bad");
        remote
            .upsert("records", row(json!({"id": "bad"})), "id")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable() {
        let remote = MemoryRemote::new();
        remote.set_reachable(false);

        assert!(remote.ping().await.unwrap_err().is_unreachable());
        assert!(remote.select("records", &Query::all()).await.is_err());
        assert_eq!(remote.call_count(), 2);

        remote.set_reachable(true);
        remote.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_feed_publishes_upserts_and_deletes() {
        let remote = MemoryRemote::new();
        let mut rx = remote.subscribe("records");

        remote
            .upsert("records", row(json!({"id": "r1"})), "id")
            .await
            .unwrap();
        remote.delete("records", "r1").await.unwrap();
        remote.delete("records", "r1").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().kind, ChangeKind::Upsert);
        assert_eq!(rx.recv().await.unwrap().kind, ChangeKind::Delete);
        assert!(rx.try_recv().is_err());
    }
}
