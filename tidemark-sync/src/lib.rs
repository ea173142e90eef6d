//! Offline-first synchronization engine for tidemark
//!
//! This crate keeps a local cache and a remote authoritative store consistent
//! under intermittent connectivity:
//! - Persisted, capped event log
//! - Push/pull reconciliation with storage-quota fallback
//! - Escalating recovery ladder and persisted degraded mode
//! - Autosave scheduling driven by timers, change detection and lifecycle signals
//! - Status read model for presentation layers

pub mod autosave;
pub mod config;
pub mod engine;
pub mod errors;
pub mod event_log;
pub mod events;
pub mod fingerprint;
pub mod keys;
pub mod lifecycle;
pub mod reconciler;
pub mod recovery;
pub mod status;

pub use autosave::{
    AutoSaveOrchestrator, Listener, OrchestratorDeps, OrchestratorStats, RecoveryRequest,
    Subscription, UnloadDecision, WeakOrchestrator,
};
pub use config::{
    AutoSaveConfig, EngineConfig, EventLogConfig, FieldMapping, ReconcileConfig, RecoveryConfig,
    TriggerConfig,
};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use errors::{Result, SyncError};
pub use event_log::{EventLog, LogEntry, LogExport, LogSummary};
pub use events::{PullReason, SaveReason, SyncEvent, SyncEventKind};
pub use fingerprint::{Blake3Fingerprint, Fingerprinter};
pub use lifecycle::{ChannelLifecycle, Connectivity, LifecycleEvent, LifecycleSource};
pub use reconciler::{PullOptions, Reconciler, SyncResult};
pub use recovery::{
    DegradedMarker, DegradedState, EmergencyReport, RecoveryManager, RecoveryResult,
    RecoveryStats, RecoveryStrategy,
};
pub use status::{StatusFacade, SyncStats, SyncStatus};
