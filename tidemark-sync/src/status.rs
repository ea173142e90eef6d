//! Read model and controls for presentation layers
//!
//! The façade observes orchestrator events, optionally polls connectivity and
//! degraded state, and publishes one consistent `SyncStatus` snapshot on a
//! watch channel. It only holds a weak orchestrator handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::autosave::{AutoSaveOrchestrator, Subscription, WeakOrchestrator};
use crate::errors::Result;
use crate::event_log::{EventLog, LogSummary};
use crate::recovery::{RecoveryResult, RecoveryStats};
use tidemark_store::{LocalStore, StorageUsage};

/// Snapshot of the synchronization state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub enabled: bool,
    pub saving: bool,
    pub syncing: bool,
    pub last_save: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub connected: bool,
    pub data_count: usize,
    pub has_unsynced_data: bool,
    pub degraded_mode: bool,
}

impl SyncStatus {
    fn of(orchestrator: &AutoSaveOrchestrator) -> Self {
        Self {
            enabled: orchestrator.is_enabled(),
            saving: orchestrator.is_saving(),
            syncing: orchestrator.is_syncing(),
            last_save: orchestrator.last_save(),
            last_sync: orchestrator.last_sync(),
            error: orchestrator.last_error(),
            connected: orchestrator.connectivity().is_online(),
            data_count: orchestrator.data_count(),
            has_unsynced_data: orchestrator.has_unsynced_data(),
            degraded_mode: orchestrator.is_degraded(),
        }
    }
}

/// Counters and storage accounting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub log: LogSummary,
    pub saves: u64,
    pub save_failures: u64,
    pub syncs: u64,
    pub sync_failures: u64,
    pub recoveries: u64,
    pub recovery: RecoveryStats,
    pub storage: StorageUsage,
}

/// Publish a snapshot only when it differs from the current one
fn publish(tx: &watch::Sender<SyncStatus>, status: SyncStatus) {
    tx.send_if_modified(|current| {
        if *current == status {
            false
        } else {
            *current = status;
            true
        }
    });
}

/// Status read model plus imperative controls
pub struct StatusFacade {
    orchestrator: WeakOrchestrator,
    log: Arc<EventLog>,
    local: Arc<dyn LocalStore>,
    tx: Arc<watch::Sender<SyncStatus>>,
    subscription: Mutex<Option<Subscription>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl StatusFacade {
    pub fn new(
        orchestrator: &AutoSaveOrchestrator,
        log: Arc<EventLog>,
        local: Arc<dyn LocalStore>,
    ) -> Self {
        let (tx, _) = watch::channel(SyncStatus::of(orchestrator));
        let tx = Arc::new(tx);

        let weak = orchestrator.downgrade();
        let listener_tx = tx.clone();
        let subscription = orchestrator.subscribe(move |_event| {
            if let Some(orchestrator) = weak.upgrade() {
                publish(&listener_tx, SyncStatus::of(&orchestrator));
            }
        });

        Self {
            orchestrator: orchestrator.downgrade(),
            log,
            local,
            tx,
            subscription: Mutex::new(Some(subscription)),
            poller: Mutex::new(None),
        }
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    /// Recompute, publish and return the current snapshot
    pub fn refresh(&self) -> SyncStatus {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            publish(&self.tx, SyncStatus::of(&orchestrator));
        }
        self.snapshot()
    }

    /// Receiver notified on every snapshot change
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub async fn save_now(&self) -> bool {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return false;
        };
        let saved = orchestrator.save_now().await;
        self.refresh();
        saved
    }

    pub async fn sync_now(&self) -> bool {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return false;
        };
        let synced = orchestrator.sync_now().await;
        self.refresh();
        synced
    }

    pub fn enable(&self) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator.enable();
        }
        self.refresh();
    }

    pub fn disable(&self) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator.disable();
        }
        self.refresh();
    }

    /// Emergency recovery regardless of current state
    pub async fn force_recovery(&self) -> Option<RecoveryResult> {
        let orchestrator = self.orchestrator.upgrade()?;
        let result = orchestrator.recovery().force_recovery().await;
        if result.success {
            orchestrator.clear_error();
        }
        self.refresh();
        Some(result)
    }

    pub fn clear_error(&self) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator.clear_error();
        }
        self.refresh();
    }

    pub fn stats(&self) -> SyncStats {
        let mut stats = SyncStats {
            log: self.log.summary(),
            storage: self.local.usage(),
            ..Default::default()
        };

        if let Some(orchestrator) = self.orchestrator.upgrade() {
            let counters = orchestrator.stats();
            stats.saves = counters.saves;
            stats.save_failures = counters.save_failures;
            stats.syncs = counters.syncs;
            stats.sync_failures = counters.sync_failures;
            stats.recoveries = counters.recoveries;
            stats.recovery = orchestrator.recovery().stats();
        }

        stats
    }

    /// Event log export document
    pub fn export_logs(&self) -> Result<String> {
        self.log.export()
    }

    /// Refresh connectivity and degraded state on an interval
    pub fn start_polling(&self, every: Duration) {
        let weak = self.orchestrator.clone();
        let tx = self.tx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                publish(&tx, SyncStatus::of(&orchestrator));
            }
            debug!("Status polling stopped");
        });

        let mut poller = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = poller.replace(handle) {
            previous.abort();
        }
    }

    /// Stop polling and detach from the orchestrator
    pub fn stop(&self) {
        if let Some(poller) = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            poller.abort();
        }
        if let Some(subscription) = self
            .subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            subscription.unsubscribe();
        }
    }
}

impl Drop for StatusFacade {
    fn drop(&mut self) {
        self.stop();
    }
}
