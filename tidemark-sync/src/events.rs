//! Status events published by the autosave orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::reconciler::SyncResult;

/// Why a push was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveReason {
    /// Explicit request from the presentation layer
    Manual,
    /// Fixed-interval timer
    Periodic,
    /// Watched data fingerprint changed
    ChangeDetected,
    /// Host window lost focus
    FocusLost,
    /// Host became hidden
    Hidden,
    /// Network came back online with unsynced data
    Reconnected,
    /// Best-effort flush before teardown
    Unload,
}

impl SaveReason {
    /// Automatic reasons are gated by the enabled flag and by degraded mode
    pub fn is_automatic(&self) -> bool {
        !matches!(self, SaveReason::Manual | SaveReason::Unload)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SaveReason::Manual => "manual",
            SaveReason::Periodic => "periodic",
            SaveReason::ChangeDetected => "change_detected",
            SaveReason::FocusLost => "focus_lost",
            SaveReason::Hidden => "hidden",
            SaveReason::Reconnected => "reconnected",
            SaveReason::Unload => "unload",
        }
    }
}

/// Why a pull was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullReason {
    Manual,
    FocusGained,
    Visible,
}

impl PullReason {
    pub fn is_automatic(&self) -> bool {
        !matches!(self, PullReason::Manual)
    }
}

/// Discriminant of a `SyncEvent`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventKind {
    SaveStart,
    SaveSuccess,
    SaveError,
    SyncStart,
    SyncSuccess,
    SyncError,
}

impl SyncEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEventKind::SaveStart => "save_start",
            SyncEventKind::SaveSuccess => "save_success",
            SyncEventKind::SaveError => "save_error",
            SyncEventKind::SyncStart => "sync_start",
            SyncEventKind::SyncSuccess => "sync_success",
            SyncEventKind::SyncError => "sync_error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncEventKind::SaveStart | SyncEventKind::SyncStart)
    }
}

/// A push/pull lifecycle event
///
/// Every `*Start` is followed by exactly one terminal event of the same
/// operation kind, unless the process is torn down mid-flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SaveStart {
        reason: SaveReason,
        timestamp: DateTime<Utc>,
    },
    SaveSuccess {
        reason: SaveReason,
        result: SyncResult,
        timestamp: DateTime<Utc>,
    },
    SaveError {
        reason: SaveReason,
        error: String,
        timestamp: DateTime<Utc>,
    },
    SyncStart {
        reason: PullReason,
        timestamp: DateTime<Utc>,
    },
    SyncSuccess {
        reason: PullReason,
        result: SyncResult,
        timestamp: DateTime<Utc>,
    },
    SyncError {
        reason: PullReason,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl SyncEvent {
    pub fn kind(&self) -> SyncEventKind {
        match self {
            SyncEvent::SaveStart { .. } => SyncEventKind::SaveStart,
            SyncEvent::SaveSuccess { .. } => SyncEventKind::SaveSuccess,
            SyncEvent::SaveError { .. } => SyncEventKind::SaveError,
            SyncEvent::SyncStart { .. } => SyncEventKind::SyncStart,
            SyncEvent::SyncSuccess { .. } => SyncEventKind::SyncSuccess,
            SyncEvent::SyncError { .. } => SyncEventKind::SyncError,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SyncEvent::SaveStart { timestamp, .. }
            | SyncEvent::SaveSuccess { timestamp, .. }
            | SyncEvent::SaveError { timestamp, .. }
            | SyncEvent::SyncStart { timestamp, .. }
            | SyncEvent::SyncSuccess { timestamp, .. }
            | SyncEvent::SyncError { timestamp, .. } => *timestamp,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            SyncEvent::SaveError { error, .. } | SyncEvent::SyncError { error, .. } => {
                Some(error.as_str())
            }
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&SyncResult> {
        match self {
            SyncEvent::SaveSuccess { result, .. } | SyncEvent::SyncSuccess { result, .. } => {
                Some(result)
            }
            _ => None,
        }
    }
}
