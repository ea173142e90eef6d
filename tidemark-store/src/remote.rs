//! Remote row store interface
//!
//! The remote store is authoritative and shared by every client. Rows are JSON
//! objects; the only conflict-resolution mechanism is an upsert keyed by a
//! unique identifier (last writer wins).

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::errors::Result;

/// A single row, as a JSON object
pub type Record = serde_json::Map<String, Value>;

/// Column the remote stamps on every write
pub const UPDATED_AT: &str = "updated_at";

/// Remote timestamp format (fixed width, so it sorts lexically)
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp column value
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Read an identifier column, accepting strings and numbers
pub fn record_id(record: &Record, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Filtered query against one table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Equality filters, all of which must match
    pub filters: Vec<(String, Value)>,
    /// Only rows whose `updated_at` is strictly after this instant
    pub modified_after: Option<DateTime<Utc>>,
    /// Sort column and direction (`true` = descending)
    pub order_by: Option<(String, bool)>,
    /// Maximum number of rows returned
    pub limit: Option<usize>,
}

impl Query {
    /// Unfiltered query
    pub fn all() -> Self {
        Self::default()
    }

    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn modified_after(mut self, watermark: DateTime<Utc>) -> Self {
        self.modified_after = Some(watermark);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some((column.into(), descending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether the query selects everything in the table
    pub fn is_unfiltered(&self) -> bool {
        self.filters.is_empty() && self.modified_after.is_none() && self.limit.is_none()
    }

    /// Check a row against the filters and watermark
    pub fn matches(&self, record: &Record) -> bool {
        let filters_match = self
            .filters
            .iter()
            .all(|(column, expected)| record.get(column) == Some(expected));

        let watermark_match = match self.modified_after {
            Some(watermark) => record
                .get(UPDATED_AT)
                .and_then(parse_timestamp)
                .map(|ts| ts > watermark)
                .unwrap_or(false),
            None => true,
        };

        filters_match && watermark_match
    }

    /// Filter, sort and truncate an iterator of rows
    pub fn apply(&self, rows: impl IntoIterator<Item = Record>) -> Vec<Record> {
        let mut selected: Vec<Record> = rows.into_iter().filter(|r| self.matches(r)).collect();

        if let Some((column, descending)) = &self.order_by {
            selected.sort_by(|a, b| {
                let ordering = compare_values(a.get(column), b.get(column));
                if *descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }

        selected
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

/// Kind of change published on a table feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Upsert,
    Delete,
}

/// A row change on a remote table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub id: String,
    pub record: Option<Record>,
}

/// Authenticated, row-oriented remote database
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Query rows from a table
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Record>>;

    /// Insert or replace a row keyed by `conflict_key`, returning the stored row
    async fn upsert(&self, table: &str, record: Record, conflict_key: &str) -> Result<Record>;

    /// Delete a row by identifier; deleting a missing row is not an error
    async fn delete(&self, table: &str, id: &str) -> Result<()>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<()>;

    /// Subscribe to row changes on a table
    fn subscribe(&self, table: &str) -> broadcast::Receiver<ChangeEvent>;
}

/// Per-table broadcast channels backing `RemoteStore::subscribe`
#[derive(Debug)]
pub struct ChangeFeed {
    senders: Mutex<HashMap<String, broadcast::Sender<ChangeEvent>>>,
    capacity: usize,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn subscribe(&self, table: &str) -> broadcast::Receiver<ChangeEvent> {
        let mut senders = self
            .senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        senders
            .entry(table.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish a change; having no subscribers is fine
    pub fn publish(&self, event: ChangeEvent) {
        let senders = self
            .senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(sender) = senders.get(&event.table) {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_query_filters_and_ordering() {
        let rows = vec![
            row(json!({"id": "a", "status": "open", "rank": 3})),
            row(json!({"id": "b", "status": "closed", "rank": 1})),
            row(json!({"id": "c", "status": "open", "rank": 2})),
        ];

        let query = Query::all()
            .where_eq("status", "open")
            .order_by("rank", false)
            .limit(5);
        let ids: Vec<String> = query
            .apply(rows)
            .iter()
            .map(|r| record_id(r, "id").unwrap())
            .collect();

        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn test_query_watermark() {
        let earlier = Utc::now() - chrono::Duration::minutes(5);
        let later = Utc::now();
        let rows = vec![
            row(json!({"id": "old", "updated_at": format_timestamp(earlier)})),
            row(json!({"id": "new", "updated_at": format_timestamp(later)})),
            row(json!({"id": "unstamped"})),
        ];

        let query = Query::all().modified_after(earlier + chrono::Duration::seconds(1));
        let selected = query.apply(rows);

        assert_eq!(selected.len(), 1);
        assert_eq!(record_id(&selected[0], "id").as_deref(), Some("new"));
    }

    #[test]
    fn test_record_id_variants() {
        assert_eq!(record_id(&row(json!({"id": 7})), "id").as_deref(), Some("7"));
        assert_eq!(record_id(&row(json!({"id": ""})), "id"), None);
        assert_eq!(record_id(&row(json!({"id": null})), "id"), None);
    }

    #[tokio::test]
    async fn test_change_feed_is_per_table() {
        let feed = ChangeFeed::default();
        let mut records_rx = feed.subscribe("records");
        let mut messages_rx = feed.subscribe("messages");

        feed.publish(ChangeEvent {
            table: "records".to_string(),
            kind: ChangeKind::Delete,
            id: "r1".to_string(),
            record: None,
        });

        assert_eq!(records_rx.recv().await.unwrap().id, "r1");
        assert!(messages_rx.try_recv().is_err());
    }
}
