//! Fixed local storage keys owned by the engine
//!
//! These outlive any in-memory orchestrator: the event log and the
//! degraded-mode markers must survive process restarts.

/// Persisted event log (JSON array of entries)
pub const EVENT_LOG: &str = "tidemark_sync_logs";

/// Degraded-mode marker (`{"active": bool, "activated_at": timestamp}`)
pub const DEGRADED_MODE: &str = "tidemark_degraded_mode";

/// Set while automatic synchronization is suspended
pub const AUTO_SYNC_DISABLED: &str = "tidemark_auto_sync_disabled";

/// Watermark of the last differential pull
pub const WATERMARK: &str = "tidemark_last_pull_at";

/// Keys that emergency recovery never wipes
pub const ENGINE_KEYS: [&str; 3] = [EVENT_LOG, DEGRADED_MODE, AUTO_SYNC_DISABLED];
