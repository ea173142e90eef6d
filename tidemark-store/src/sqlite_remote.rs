//! SQLite-backed remote store
//!
//! Stands in for the managed backend when running against a shared database
//! file. All tables live in a single `rows` table keyed by `(table_name, id)`
//! with the row body stored as JSON.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task;
use tracing::{debug, info, warn};

use crate::errors::{Result, StoreError};
use crate::remote::{
    format_timestamp, record_id, ChangeEvent, ChangeFeed, ChangeKind, Query, Record, RemoteStore,
    UPDATED_AT,
};

/// Remote store persisted in a SQLite database
#[derive(Clone)]
pub struct SqliteRemote {
    conn: Arc<Mutex<Connection>>,
    feed: Arc<ChangeFeed>,
}

impl SqliteRemote {
    /// Open or create a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Create in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rows (
                table_name TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (table_name, id)
            );

            CREATE INDEX IF NOT EXISTS idx_rows_updated ON rows(table_name, updated_at);
            "#,
        )?;

        info!("Remote row store initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            feed: Arc::new(ChangeFeed::default()),
        })
    }

    /// Run a closure against the connection on the blocking pool
    async fn execute_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();

        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Remote(format!("Task join error: {}", e)))?
    }
}

#[async_trait]
impl RemoteStore for SqliteRemote {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Record>> {
        let table_name = table.to_string();
        let watermark = query.modified_after.map(format_timestamp);

        let rows = self
            .execute_blocking(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT body FROM rows
                    WHERE table_name = ?1 AND (?2 IS NULL OR updated_at > ?2)
                    ORDER BY updated_at
                    "#,
                )?;

                let bodies = stmt.query_map(params![table_name, watermark], |row| {
                    row.get::<_, String>(0)
                })?;

                let mut records = Vec::new();
                for body in bodies {
                    let body = body?;
                    match serde_json::from_str::<Record>(&body) {
                        Ok(record) => records.push(record),
                        Err(e) => warn!("Skipping undecodable row: {}", e),
                    }
                }
                Ok(records)
            })
            .await?;

        let selected = query.apply(rows);
        debug!("Selected {} rows from {}", selected.len(), table);
        Ok(selected)
    }

    async fn upsert(&self, table: &str, mut record: Record, conflict_key: &str) -> Result<Record> {
        let id = record_id(&record, conflict_key).ok_or_else(|| {
            StoreError::InvalidRecord(format!("missing conflict key '{}'", conflict_key))
        })?;

        let updated_at = format_timestamp(Utc::now());
        record.insert(UPDATED_AT.to_string(), Value::String(updated_at.clone()));
        let body = serde_json::to_string(&record)?;

        let table_name = table.to_string();
        let row_id = id.clone();
        self.execute_blocking(move |conn| {
            conn.execute(
                r#"
                INSERT INTO rows (table_name, id, body, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(table_name, id) DO UPDATE SET
                    body = excluded.body,
                    updated_at = excluded.updated_at
                "#,
                params![table_name, row_id, body, updated_at],
            )?;
            Ok(())
        })
        .await?;

        self.feed.publish(ChangeEvent {
            table: table.to_string(),
            kind: ChangeKind::Upsert,
            id,
            record: Some(record.clone()),
        });

        Ok(record)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        let table_name = table.to_string();
        let row_id = id.to_string();

        let removed = self
            .execute_blocking(move |conn| {
                let count = conn.execute(
                    "DELETE FROM rows WHERE table_name = ?1 AND id = ?2",
                    params![table_name, row_id],
                )?;
                Ok(count)
            })
            .await?;

        if removed > 0 {
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
        self.execute_blocking(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    fn subscribe(&self, table: &str) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn row(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_upsert_select_delete() {
        let remote = SqliteRemote::open_in_memory().unwrap();
        remote.ping().await.unwrap();

        remote
            .upsert("records", row(json!({"id": "a", "title": "one"})), "id")
            .await
            .unwrap();
        remote
            .upsert("records", row(json!({"id": "a", "title": "two"})), "id")
            .await
            .unwrap();
        remote
            .upsert("other", row(json!({"id": "a"})), "id")
            .await
            .unwrap();

        let rows = remote.select("records", &Query::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "two");

        remote.delete("records", "a").await.unwrap();
        assert!(remote
            .select("records", &Query::all())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(remote.select("other", &Query::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_watermark_query() {
        let remote = SqliteRemote::open_in_memory().unwrap();
        remote
            .upsert("records", row(json!({"id": "old"})), "id")
            .await
            .unwrap();

        let watermark = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        remote
            .upsert("records", row(json!({"id": "new"})), "id")
            .await
            .unwrap();

        let rows = remote
            .select("records", &Query::all().modified_after(watermark))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "new");
    }

    #[tokio::test]
    async fn test_sqlite_persists_to_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("remote.db");

        {
            let remote = SqliteRemote::open(&path).unwrap();
            remote
                .upsert("records", row(json!({"id": 1, "title": "kept"})), "id")
                .await
                .unwrap();
        }

        let reopened = SqliteRemote::open(&path).unwrap();
        let rows = reopened.select("records", &Query::all()).await.unwrap();
        assert_eq!(rows[0]["title"], "kept");
    }
}
