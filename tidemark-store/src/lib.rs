//! Storage collaborators for tidemark
//!
//! This crate defines the two stores the sync engine talks to:
//! - `LocalStore`: a synchronous, origin-scoped key-value cache with a finite quota
//! - `RemoteStore`: an asynchronous, row-oriented remote database with change feeds
//!
//! It also ships the implementations used by the engine, its tests and the CLI:
//! an in-memory and a file-backed local store, and an in-memory and a
//! SQLite-backed remote store.

pub mod errors;
pub mod local;
pub mod memory_remote;
pub mod remote;
pub mod sqlite_remote;

pub use errors::{Result, StoreError};
pub use local::{FileStore, LocalStore, LocalStoreExt, MemoryStore, StorageUsage};
pub use memory_remote::MemoryRemote;
pub use remote::{
    format_timestamp, parse_timestamp, record_id, ChangeEvent, ChangeFeed, ChangeKind, Query,
    Record, RemoteStore, UPDATED_AT,
};
pub use sqlite_remote::SqliteRemote;
