//! One-shot transfers between the local cache and the remote store
//!
//! Push upserts every record of a local collection individually, so one bad
//! record never aborts the batch. Pull replaces (or, differentially, merges
//! into) the local collection and degrades its payload when local storage
//! is full:
//!
//! 1. strip heavy fields from every record and retry
//! 2. clear local storage and keep only an essential-field projection of
//!    the first records
//!
//! Outcomes are returned as [`SyncResult`] values, never as errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ReconcileConfig;
use crate::errors::Result;
use crate::event_log::EventLog;
use crate::keys;
use tidemark_store::{
    format_timestamp, parse_timestamp, record_id, LocalStore, LocalStoreExt, Query, Record,
    RemoteStore, StoreError, UPDATED_AT,
};

/// Outcome of one reconciliation call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    /// Records transferred
    pub count: usize,
    /// Records that failed individually
    pub failed: usize,
    /// One message per failed record
    pub errors: Vec<String>,
    /// Failure of the call as a whole
    pub error: Option<String>,
    /// A storage fallback tier was used
    pub lightweight: bool,
    /// Identifiers generated during a push and written back locally
    #[serde(default)]
    pub assigned_ids: usize,
}

impl SyncResult {
    pub fn ok(count: usize) -> Self {
        Self {
            success: true,
            count,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Most specific error message available
    pub fn error_message(&self) -> Option<String> {
        self.error
            .clone()
            .or_else(|| self.errors.last().cloned())
    }
}

/// Options of a full pull
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// Remove the configured cleanup keys once the query has succeeded
    pub force_cleanup: bool,
    /// Remote query; unfiltered pulls advance the watermark
    pub query: Query,
}

impl PullOptions {
    pub fn with_cleanup() -> Self {
        Self {
            force_cleanup: true,
            query: Query::all(),
        }
    }
}

/// How a record set ended up in local storage
struct Persisted {
    count: usize,
    lightweight: bool,
}

/// Push/pull between a local collection and its remote table
pub struct Reconciler {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    config: ReconcileConfig,
    log: Arc<EventLog>,
}

impl Reconciler {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        config: ReconcileConfig,
        log: Arc<EventLog>,
    ) -> Self {
        Self {
            local,
            remote,
            config,
            log,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Push a local collection (the primary one by default)
    pub async fn push(&self, collection: Option<&str>) -> SyncResult {
        let key = collection.unwrap_or(&self.config.collection_key);
        let table = self.config.table_for(key).to_string();

        let mut records = match self.local_records(key) {
            Ok(records) => records,
            Err(e) => {
                warn!("Cannot read local collection {}: {}", key, e);
                return SyncResult::failure(format!("unreadable local collection '{}': {}", key, e));
            }
        };

        if records.is_empty() {
            debug!("Nothing to push from {}", key);
            return SyncResult::ok(0);
        }

        let id_field = self.config.id_field.as_str();
        let mut result = SyncResult::default();

        for record in records.iter_mut() {
            let id = match record_id(record, id_field) {
                Some(id) => id,
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    record.insert(id_field.to_string(), Value::String(id.clone()));
                    result.assigned_ids += 1;
                    id
                }
            };

            match self
                .remote
                .upsert(&table, self.to_remote(record.clone()), id_field)
                .await
            {
                Ok(_) => result.count += 1,
                Err(e) => {
                    debug!("Upsert of {} into {} failed: {}", id, table, e);
                    result.failed += 1;
                    result.errors.push(format!("{}: {}", id, e));
                }
            }
        }

        if result.assigned_ids > 0 {
            if let Err(e) = self.local.set_json(key, &records) {
                warn!(
                    "Failed to write back {} generated ids: {}",
                    result.assigned_ids, e
                );
            }
        }

        result.success = result.failed == 0;
        if !result.success {
            result.error = Some(format!(
                "{} of {} records failed to upload; last error: {}",
                result.failed,
                records.len(),
                result.errors.last().map(String::as_str).unwrap_or("unknown")
            ));
        }

        info!(
            "Pushed {} records to {} ({} failed)",
            result.count, table, result.failed
        );
        self.log.record(
            "push_result",
            json!({
                "collection": key,
                "count": result.count,
                "failed": result.failed,
                "errors": result.errors,
            }),
        );

        result
    }

    /// Replace the primary collection with the remote rows
    pub async fn pull(&self, options: PullOptions) -> SyncResult {
        let key = self.config.collection_key.clone();
        let table = self.config.table_for(&key).to_string();

        let rows = match self.remote.select(&table, &options.query).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Pull from {} failed: {}", table, e);
                self.log.record_error("pull_result", &e.to_string());
                return SyncResult::failure(e.to_string());
            }
        };

        // A failed query leaves local data untouched
        if options.force_cleanup {
            for cleanup_key in &self.config.cleanup_keys {
                if let Err(e) = self.local.remove(cleanup_key) {
                    warn!("Failed to remove {} during cleanup: {}", cleanup_key, e);
                }
            }
            debug!("Cleared {} keys before storing pull", self.config.cleanup_keys.len());
        }

        if rows.is_empty() {
            if let Err(e) = self.local.set_json(&key, &Vec::<Record>::new()) {
                return SyncResult::failure(e.to_string());
            }
            info!("Remote table {} is empty; local collection cleared", table);
            self.log.record("pull_result", json!({ "count": 0 }));
            return SyncResult::ok(0);
        }

        let newest = newest_timestamp(&rows);
        let records: Vec<Record> = rows.into_iter().map(|r| self.to_local(r)).collect();

        let persisted = match self.persist_with_fallback(&key, records) {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!("Failed to store pulled records: {}", e);
                self.log.record_error("pull_result", &e.to_string());
                return SyncResult::failure(e.to_string());
            }
        };

        if options.query.is_unfiltered() {
            if let Some(newest) = newest {
                self.write_watermark(newest);
            }
        }

        info!(
            "Pulled {} records from {}{}",
            persisted.count,
            table,
            if persisted.lightweight { " (lightweight)" } else { "" }
        );
        self.log.record(
            "pull_result",
            json!({ "count": persisted.count, "lightweight": persisted.lightweight }),
        );

        SyncResult {
            success: true,
            count: persisted.count,
            lightweight: persisted.lightweight,
            ..Default::default()
        }
    }

    /// Merge rows modified after the watermark into the primary collection
    ///
    /// `since` overrides the stored watermark. Without any watermark this is
    /// a full pull.
    pub async fn pull_since(&self, since: Option<DateTime<Utc>>) -> SyncResult {
        let watermark = match since.or_else(|| self.watermark()) {
            Some(watermark) => watermark,
            None => return self.pull(PullOptions::default()).await,
        };

        let key = self.config.collection_key.clone();
        let table = self.config.table_for(&key).to_string();

        let rows = match self
            .remote
            .select(&table, &Query::all().modified_after(watermark))
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Differential pull from {} failed: {}", table, e);
                self.log.record_error("pull_since_result", &e.to_string());
                return SyncResult::failure(e.to_string());
            }
        };

        if rows.is_empty() {
            debug!("No changes in {} since {}", table, watermark);
            return SyncResult::ok(0);
        }

        let fetched = rows.len();
        let newest = newest_timestamp(&rows);

        let mut merged = match self.local_records(&key) {
            Ok(records) => records,
            Err(e) => {
                warn!("Local collection {} unreadable, rebuilding: {}", key, e);
                Vec::new()
            }
        };

        let id_field = self.config.id_field.as_str();
        let mut positions: HashMap<String, usize> = merged
            .iter()
            .enumerate()
            .filter_map(|(i, r)| record_id(r, id_field).map(|id| (id, i)))
            .collect();

        for row in rows {
            let record = self.to_local(row);
            match record_id(&record, id_field) {
                Some(id) => match positions.get(&id) {
                    Some(&i) => merged[i] = record,
                    None => {
                        positions.insert(id, merged.len());
                        merged.push(record);
                    }
                },
                None => merged.push(record),
            }
        }

        let persisted = match self.persist_with_fallback(&key, merged) {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!("Failed to store merged records: {}", e);
                return SyncResult::failure(e.to_string());
            }
        };

        if let Some(newest) = newest {
            self.write_watermark(newest);
        }

        info!("Merged {} changed records from {}", fetched, table);
        self.log.record(
            "pull_since_result",
            json!({
                "count": fetched,
                "since": format_timestamp(watermark),
                "lightweight": persisted.lightweight,
            }),
        );

        SyncResult {
            success: true,
            count: fetched,
            lightweight: persisted.lightweight,
            ..Default::default()
        }
    }

    /// Delete a record remotely and from the primary collection
    pub async fn delete(&self, id: &str) -> Result<()> {
        let key = self.config.collection_key.clone();
        let table = self.config.table_for(&key).to_string();

        self.remote.delete(&table, id).await?;

        let id_field = self.config.id_field.as_str();
        let mut records = self.local_records(&key)?;
        let before = records.len();
        records.retain(|r| record_id(r, id_field).as_deref() != Some(id));
        if records.len() != before {
            self.local.set_json(&key, &records)?;
        }

        info!("Deleted {} from {}", id, table);
        self.log.record("delete", json!({ "id": id, "table": table }));
        Ok(())
    }

    /// Records of a local collection; an absent key reads as empty
    pub fn local_records(&self, key: &str) -> Result<Vec<Record>> {
        Ok(self.local.get_json::<Vec<Record>>(key)?.unwrap_or_default())
    }

    /// Number of records in the primary collection
    pub fn record_count(&self) -> usize {
        self.local_records(&self.config.collection_key)
            .map(|records| records.len())
            .unwrap_or(0)
    }

    /// Watermark of the last full or differential pull
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        match self.local.get_json::<Value>(keys::WATERMARK) {
            Ok(Some(value)) => parse_timestamp(&value),
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring unreadable watermark: {}", e);
                None
            }
        }
    }

    fn write_watermark(&self, watermark: DateTime<Utc>) {
        if let Err(e) = self
            .local
            .set_json(keys::WATERMARK, &format_timestamp(watermark))
        {
            warn!("Failed to store pull watermark: {}", e);
        }
    }

    fn persist_with_fallback(
        &self,
        key: &str,
        records: Vec<Record>,
    ) -> std::result::Result<Persisted, StoreError> {
        match self.local.set_json(key, &records) {
            Ok(()) => {
                return Ok(Persisted {
                    count: records.len(),
                    lightweight: false,
                })
            }
            Err(e) if e.is_quota_exceeded() => {
                warn!("Local storage full, stripping heavy fields: {}", e);
            }
            Err(e) => return Err(e),
        }

        let stripped: Vec<Record> = records
            .into_iter()
            .map(|mut record| {
                for field in &self.config.heavy_fields {
                    record.remove(field);
                }
                record
            })
            .collect();

        match self.local.set_json(key, &stripped) {
            Ok(()) => {
                self.log.record(
                    "storage_fallback",
                    json!({ "tier": 1, "count": stripped.len() }),
                );
                return Ok(Persisted {
                    count: stripped.len(),
                    lightweight: true,
                });
            }
            Err(e) if e.is_quota_exceeded() => {
                warn!("Still over quota, keeping essential fields only: {}", e);
            }
            Err(e) => return Err(e),
        }

        self.local.clear()?;

        let essential: Vec<Record> = stripped
            .into_iter()
            .take(self.config.essential_limit)
            .map(|record| {
                record
                    .into_iter()
                    .filter(|(field, _)| self.config.essential_fields.contains(field))
                    .collect()
            })
            .collect();

        self.local.set_json(key, &essential)?;
        self.log.record(
            "storage_fallback",
            json!({ "tier": 2, "count": essential.len() }),
        );

        Ok(Persisted {
            count: essential.len(),
            lightweight: true,
        })
    }

    fn to_remote(&self, mut record: Record) -> Record {
        for mapping in &self.config.field_mapping {
            if let Some(value) = record.remove(&mapping.local) {
                record.insert(mapping.remote.clone(), value);
            }
        }
        record
    }

    fn to_local(&self, mut record: Record) -> Record {
        for mapping in &self.config.field_mapping {
            if let Some(value) = record.remove(&mapping.remote) {
                record.insert(mapping.local.clone(), value);
            }
        }
        record
    }
}

fn newest_timestamp(rows: &[Record]) -> Option<DateTime<Utc>> {
    rows.iter()
        .filter_map(|r| r.get(UPDATED_AT).and_then(parse_timestamp))
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventLogConfig;
    use tidemark_store::{MemoryRemote, MemoryStore, StorageUsage};

    /// Memory store whose `records` key only accepts values up to a size
    struct CappedStore {
        inner: MemoryStore,
        key: &'static str,
        limit: usize,
    }

    impl LocalStore for CappedStore {
        fn get(&self, key: &str) -> tidemark_store::Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> tidemark_store::Result<()> {
            if key == self.key && value.len() > self.limit {
                return Err(StoreError::QuotaExceeded {
                    key: key.to_string(),
                    needed: value.len(),
                    available: self.limit,
                });
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> tidemark_store::Result<()> {
            self.inner.remove(key)
        }

        fn keys(&self) -> tidemark_store::Result<Vec<String>> {
            self.inner.keys()
        }

        fn clear(&self) -> tidemark_store::Result<()> {
            self.inner.clear()
        }

        fn usage(&self) -> StorageUsage {
            self.inner.usage()
        }
    }

    fn row(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn reconciler_with(
        local: Arc<dyn LocalStore>,
        remote: Arc<MemoryRemote>,
    ) -> Reconciler {
        let log = Arc::new(EventLog::new(local.clone(), EventLogConfig::default()));
        Reconciler::new(local, remote, ReconcileConfig::default(), log)
    }

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryRemote>, Reconciler) {
        let local = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemote::new());
        let reconciler = reconciler_with(local.clone(), remote.clone());
        (local, remote, reconciler)
    }

    #[tokio::test]
    async fn test_push_empty_makes_no_remote_calls() {
        let (local, remote, reconciler) = setup();

        let result = reconciler.push(None).await;
        assert!(result.success);
        assert_eq!(result.count, 0);

        local.set("records", "[]").unwrap();
        let result = reconciler.push(None).await;
        assert!(result.success);
        assert_eq!(result.count, 0);
        assert_eq!(remote.call_count(), 0);
    }

    #[tokio::test]
    async fn test_push_twice_is_idempotent() {
        let (local, remote, reconciler) = setup();
        local
            .set_json("records", &vec![row(json!({"id": "r1", "title": "draft"}))])
            .unwrap();
        assert_eq!(reconciler.push(None).await.count, 1);

        local
            .set_json("records", &vec![row(json!({"id": "r1", "title": "final"}))])
            .unwrap();
        let result = reconciler.push(None).await;
        assert!(result.success);
        assert_eq!(result.count, 1);

        let rows = remote.rows("records").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "final");
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let (local, remote, reconciler) = setup();
        let records: Vec<Record> = (0..5)
            .map(|i| row(json!({"id": format!("r{}", i)})))
            .collect();
        local.set_json("records", &records).unwrap();
        remote.reject_id("r1");
        remote.reject_id("r3");

        let result = reconciler.push(None).await;
        assert!(!result.success);
        assert_eq!(result.count, 3);
        assert_eq!(result.failed, 2);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].starts_with("r1"));
        assert_eq!(remote.rows("records").await.len(), 3);
    }

    #[tokio::test]
    async fn test_push_assigns_and_writes_back_ids() {
        let (local, remote, reconciler) = setup();
        local
            .set_json(
                "records",
                &vec![row(json!({"title": "a"})), row(json!({"title": "b"}))],
            )
            .unwrap();

        let result = reconciler.push(None).await;
        assert_eq!(result.count, 2);
        assert_eq!(result.assigned_ids, 2);

        let stored = reconciler.local_records("records").unwrap();
        let mut local_ids: Vec<String> = stored
            .iter()
            .map(|r| record_id(r, "id").unwrap())
            .collect();
        let mut remote_ids: Vec<String> = remote
            .rows("records")
            .await
            .iter()
            .map(|r| record_id(r, "id").unwrap())
            .collect();
        local_ids.sort();
        remote_ids.sort();
        assert_eq!(local_ids, remote_ids);
    }

    #[tokio::test]
    async fn test_pull_maps_fields_and_sets_watermark() {
        let (_local, remote, reconciler) = setup();
        remote
            .upsert("records", row(json!({"id": "r1", "created_at": "yesterday"})), "id")
            .await
            .unwrap();

        let result = reconciler.pull(PullOptions::default()).await;
        assert!(result.success);
        assert_eq!(result.count, 1);
        assert!(!result.lightweight);

        let stored = reconciler.local_records("records").unwrap();
        assert_eq!(stored[0]["createdAt"], "yesterday");
        assert!(stored[0].contains_key("updatedAt"));
        assert!(!stored[0].contains_key("updated_at"));
        assert!(reconciler.watermark().is_some());
    }

    #[tokio::test]
    async fn test_pull_empty_clears_collection() {
        let (local, _remote, reconciler) = setup();
        local
            .set_json("records", &vec![row(json!({"id": "stale"}))])
            .unwrap();

        let result = reconciler.pull(PullOptions::default()).await;
        assert!(result.success);
        assert_eq!(result.count, 0);
        assert!(reconciler.local_records("records").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_failure_is_a_result() {
        let (_local, remote, reconciler) = setup();
        remote.set_reachable(false);

        let result = reconciler.pull(PullOptions::default()).await;
        assert!(!result.success);
        assert!(result.error_message().is_some());
    }

    #[tokio::test]
    async fn test_quota_tier_one_strips_heavy_fields() {
        let local: Arc<dyn LocalStore> = Arc::new(CappedStore {
            inner: MemoryStore::new(),
            key: "records",
            limit: 500,
        });
        let remote = Arc::new(MemoryRemote::new());
        for i in 0..3 {
            remote
                .upsert(
                    "records",
                    row(json!({"id": format!("r{}", i), "title": "t", "attachments": "x".repeat(1000)})),
                    "id",
                )
                .await
                .unwrap();
        }
        let reconciler = reconciler_with(local, remote);

        let result = reconciler.pull(PullOptions::default()).await;
        assert!(result.success);
        assert!(result.lightweight);
        assert_eq!(result.count, 3);

        let stored = reconciler.local_records("records").unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|r| !r.contains_key("attachments")));
        assert!(stored.iter().all(|r| r.contains_key("title")));
    }

    #[tokio::test]
    async fn test_quota_tier_two_keeps_essential_projection() {
        let local: Arc<dyn LocalStore> = Arc::new(CappedStore {
            inner: MemoryStore::new(),
            key: "records",
            limit: 6000,
        });
        local.set("settings", "{}").unwrap();

        let remote = Arc::new(MemoryRemote::new());
        for i in 0..100 {
            remote
                .upsert(
                    "records",
                    row(json!({"id": format!("r{:03}", i), "title": "t", "notes": "n".repeat(100)})),
                    "id",
                )
                .await
                .unwrap();
        }
        let reconciler = reconciler_with(local.clone(), remote);

        let result = reconciler.pull(PullOptions::default()).await;
        assert!(result.success);
        assert!(result.lightweight);
        assert_eq!(result.count, 50);

        let stored = reconciler.local_records("records").unwrap();
        assert_eq!(stored.len(), 50);
        assert!(stored.iter().all(|r| !r.contains_key("notes")));
        assert!(stored.iter().all(|r| r.contains_key("id") && r.contains_key("title")));
        assert_eq!(local.get("settings").unwrap(), None);
    }

    #[tokio::test]
    async fn test_pull_since_merges_by_id() {
        let (_local, remote, reconciler) = setup();
        remote
            .upsert("records", row(json!({"id": "a", "title": "one"})), "id")
            .await
            .unwrap();
        remote
            .upsert("records", row(json!({"id": "b", "title": "two"})), "id")
            .await
            .unwrap();
        assert_eq!(reconciler.pull(PullOptions::default()).await.count, 2);
        let first_watermark = reconciler.watermark().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        remote
            .upsert("records", row(json!({"id": "a", "title": "edited"})), "id")
            .await
            .unwrap();
        remote
            .upsert("records", row(json!({"id": "c", "title": "three"})), "id")
            .await
            .unwrap();

        let result = reconciler.pull_since(None).await;
        assert!(result.success);
        assert_eq!(result.count, 2);
        assert!(reconciler.watermark().unwrap() > first_watermark);

        let stored = reconciler.local_records("records").unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0]["title"], "edited");
        assert_eq!(stored[2]["id"], "c");

        assert_eq!(reconciler.pull_since(None).await.count, 0);
    }

    #[tokio::test]
    async fn test_force_cleanup_removes_keys() {
        let (local, remote, reconciler) = setup();
        local.set(keys::WATERMARK, "\"2020-01-01T00:00:00Z\"").unwrap();
        remote
            .upsert("records", row(json!({"id": "r1"})), "id")
            .await
            .unwrap();

        let result = reconciler.pull(PullOptions::with_cleanup()).await;
        assert!(result.success);
        assert!(reconciler.watermark().unwrap().timestamp() > 1_600_000_000);
    }

    #[tokio::test]
    async fn test_delete_removes_remote_and_local() {
        let (local, remote, reconciler) = setup();
        local
            .set_json(
                "records",
                &vec![row(json!({"id": "a"})), row(json!({"id": "b"}))],
            )
            .unwrap();
        reconciler.push(None).await;

        reconciler.delete("a").await.unwrap();

        assert_eq!(remote.rows("records").await.len(), 1);
        assert_eq!(reconciler.record_count(), 1);
    }
}
