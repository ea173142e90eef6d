//! Escalating recovery after failed pushes
//!
//! Each failed push hands the recovery manager an error and a retry counter.
//! The counter alone picks the strategy; the error is only logged. The last
//! rung, degraded mode, is persisted so it survives restarts, suspends
//! automatic synchronization and schedules a background probe that exits it
//! again after a successful full pull.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RecoveryConfig;
use crate::event_log::EventLog;
use crate::keys;
use crate::lifecycle::Connectivity;
use crate::reconciler::{PullOptions, Reconciler, SyncResult};
use tidemark_store::{LocalStore, LocalStoreExt};

/// Recovery strategies, in escalation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetryWithDelay,
    ReconnectCheck,
    CacheClearAndRetry,
    PartialSync,
    DegradedMode,
    /// Operator-invoked full reset, outside the ladder
    Emergency,
}

impl RecoveryStrategy {
    /// The ladder walked by consecutive failures
    pub const LADDER: [RecoveryStrategy; 5] = [
        RecoveryStrategy::RetryWithDelay,
        RecoveryStrategy::ReconnectCheck,
        RecoveryStrategy::CacheClearAndRetry,
        RecoveryStrategy::PartialSync,
        RecoveryStrategy::DegradedMode,
    ];

    /// Strategy for a retry counter; past the ladder it is always degraded mode
    pub fn for_attempt(retry_count: u32) -> Self {
        Self::LADDER
            .get(retry_count as usize)
            .copied()
            .unwrap_or(RecoveryStrategy::DegradedMode)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::RetryWithDelay => "retry_with_delay",
            RecoveryStrategy::ReconnectCheck => "reconnect_check",
            RecoveryStrategy::CacheClearAndRetry => "cache_clear_and_retry",
            RecoveryStrategy::PartialSync => "partial_sync",
            RecoveryStrategy::DegradedMode => "degraded_mode",
            RecoveryStrategy::Emergency => "emergency",
        }
    }
}

/// Outcome of one recovery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub message: String,
    pub error: Option<String>,
    /// `None` when the attempt was skipped
    pub strategy: Option<RecoveryStrategy>,
}

impl RecoveryResult {
    fn succeeded(strategy: RecoveryStrategy, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            strategy: Some(strategy),
        }
    }

    fn failed(strategy: RecoveryStrategy, message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error,
            strategy: Some(strategy),
        }
    }

    fn already_running() -> Self {
        Self {
            success: false,
            message: "Recovery already running".to_string(),
            error: None,
            strategy: None,
        }
    }

    /// Whether the attempt was skipped because another one was active
    pub fn is_skipped(&self) -> bool {
        self.strategy.is_none()
    }

    fn from_push(strategy: RecoveryStrategy, result: SyncResult) -> Self {
        if result.success {
            Self::succeeded(strategy, format!("Pushed {} records", result.count))
        } else {
            Self::failed(strategy, "Push failed", result.error_message())
        }
    }
}

/// Report of an emergency recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyReport {
    pub success: bool,
    pub restored_records: usize,
    pub message: String,
}

/// Persisted degraded-mode marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedMarker {
    pub active: bool,
    pub activated_at: DateTime<Utc>,
}

/// Degraded-mode markers in local storage, with a watch channel for observers
#[derive(Clone)]
pub struct DegradedState {
    local: Arc<dyn LocalStore>,
    tx: Arc<watch::Sender<bool>>,
}

impl DegradedState {
    pub fn new(local: Arc<dyn LocalStore>) -> Self {
        let (tx, _) = watch::channel(false);
        let state = Self {
            local,
            tx: Arc::new(tx),
        };
        state.tx.send_replace(state.persisted());
        state
    }

    pub fn marker(&self) -> Option<DegradedMarker> {
        match self.local.get_json::<DegradedMarker>(keys::DEGRADED_MODE) {
            Ok(marker) => marker,
            Err(e) => {
                warn!("Ignoring unreadable degraded-mode marker: {}", e);
                None
            }
        }
    }

    /// Degraded if entered in this process or either persisted marker says so
    pub fn is_active(&self) -> bool {
        *self.tx.borrow() || self.persisted()
    }

    fn persisted(&self) -> bool {
        let marker_active = self.marker().map_or(false, |m| m.active);
        let auto_sync_disabled = matches!(self.local.get(keys::AUTO_SYNC_DISABLED), Ok(Some(_)));
        marker_active || auto_sync_disabled
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Activate degraded mode; returns whether both markers were persisted
    ///
    /// The in-memory flag is set even when storage rejects the markers, so a
    /// full local store cannot keep automatic sync running.
    fn enter(&self) -> bool {
        self.tx.send_replace(true);

        let marker = DegradedMarker {
            active: true,
            activated_at: Utc::now(),
        };
        let mut persisted = true;
        if let Err(e) = self.local.set_json(keys::DEGRADED_MODE, &marker) {
            error!("Failed to persist degraded-mode marker: {}", e);
            persisted = false;
        }
        if let Err(e) = self.local.set_json(keys::AUTO_SYNC_DISABLED, &true) {
            error!("Failed to persist auto-sync flag: {}", e);
            persisted = false;
        }
        persisted
    }

    fn exit(&self) {
        for key in [keys::DEGRADED_MODE, keys::AUTO_SYNC_DISABLED] {
            if let Err(e) = self.local.remove(key) {
                warn!("Failed to clear {}: {}", key, e);
            }
        }
        self.tx.send_replace(false);
    }
}

/// Recovery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub skipped: u64,
    pub degraded_entries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
    degraded_entries: AtomicU64,
}

/// Holds a busy flag; clears it on drop
pub(crate) struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    /// Set the flag, or `None` if it was already set
    pub(crate) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| FlagGuard(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Recovery ladder, degraded mode and emergency reset
pub struct RecoveryManager {
    local: Arc<dyn LocalStore>,
    reconciler: Arc<Reconciler>,
    connectivity: Connectivity,
    config: RecoveryConfig,
    log: Arc<EventLog>,
    degraded: DegradedState,
    in_progress: AtomicBool,
    probe: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

impl RecoveryManager {
    pub fn new(
        local: Arc<dyn LocalStore>,
        reconciler: Arc<Reconciler>,
        connectivity: Connectivity,
        config: RecoveryConfig,
        log: Arc<EventLog>,
    ) -> Self {
        Self {
            degraded: DegradedState::new(local.clone()),
            local,
            reconciler,
            connectivity,
            config,
            log,
            in_progress: AtomicBool::new(false),
            probe: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    /// Run the strategy selected by `retry_count`
    pub async fn recover(&self, error: &str, retry_count: u32) -> RecoveryResult {
        let Some(_guard) = FlagGuard::try_acquire(&self.in_progress) else {
            debug!("Recovery already running, skipping attempt {}", retry_count);
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return RecoveryResult::already_running();
        };

        let strategy = RecoveryStrategy::for_attempt(retry_count);
        info!(
            "Recovery attempt {} using {} after: {}",
            retry_count,
            strategy.as_str(),
            error
        );
        self.log.record(
            "recovery_attempt",
            json!({
                "strategy": strategy.as_str(),
                "retry_count": retry_count,
                "cause": error,
            }),
        );
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);

        let result = match strategy {
            RecoveryStrategy::RetryWithDelay => self.retry_with_delay(retry_count).await,
            RecoveryStrategy::ReconnectCheck => self.reconnect_check().await,
            RecoveryStrategy::CacheClearAndRetry => self.cache_clear_and_retry().await,
            RecoveryStrategy::PartialSync => self.partial_sync().await,
            RecoveryStrategy::DegradedMode | RecoveryStrategy::Emergency => {
                self.enter_degraded_mode()
            }
        };

        if result.success {
            self.counters.successes.fetch_add(1, Ordering::Relaxed);
            info!("Recovery succeeded via {}: {}", strategy.as_str(), result.message);
        } else {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!("Recovery via {} failed: {}", strategy.as_str(), result.message);
        }
        self.log.record(
            "recovery_result",
            json!({
                "strategy": strategy.as_str(),
                "success": result.success,
                "message": result.message,
                "error": result.error,
            }),
        );

        result
    }

    async fn retry_with_delay(&self, retry_count: u32) -> RecoveryResult {
        let strategy = RecoveryStrategy::RetryWithDelay;
        let delay = self.config.base_delay() * (retry_count + 1);
        debug!("Waiting {:?} before retrying push", delay);
        tokio::time::sleep(delay).await;

        if !self.connectivity.is_online() {
            return RecoveryResult::failed(strategy, "Still offline", None);
        }

        RecoveryResult::from_push(strategy, self.reconciler.push(None).await)
    }

    async fn reconnect_check(&self) -> RecoveryResult {
        let strategy = RecoveryStrategy::ReconnectCheck;
        if !self.connectivity.is_online() {
            return RecoveryResult::failed(strategy, "Network is offline", None);
        }

        if let Err(e) = self.reconciler.remote().ping().await {
            return RecoveryResult::failed(strategy, "Remote store unreachable", Some(e.to_string()));
        }

        RecoveryResult::from_push(strategy, self.reconciler.push(None).await)
    }

    async fn cache_clear_and_retry(&self) -> RecoveryResult {
        let strategy = RecoveryStrategy::CacheClearAndRetry;
        let snapshot = self.snapshot_critical();

        for key in &self.config.corruptible_keys {
            if let Err(e) = self.local.remove(key) {
                warn!("Failed to remove cache key {}: {}", key, e);
            }
        }

        let pulled = self.reconciler.pull(PullOptions::with_cleanup()).await;
        self.restore_critical(&snapshot);

        if pulled.success {
            RecoveryResult::succeeded(
                strategy,
                format!("Cache rebuilt with {} records", pulled.count),
            )
        } else {
            RecoveryResult::failed(strategy, "Full pull failed", pulled.error_message())
        }
    }

    async fn partial_sync(&self) -> RecoveryResult {
        let strategy = RecoveryStrategy::PartialSync;
        let mut synced = Vec::new();
        let mut last_error = None;

        for collection in &self.config.essential_collections {
            let result = self.reconciler.push(Some(collection)).await;
            if result.success {
                synced.push(collection.clone());
            } else {
                last_error = result.error_message();
            }
        }

        if synced.is_empty() {
            RecoveryResult::failed(strategy, "No essential collection could be pushed", last_error)
        } else {
            RecoveryResult::succeeded(strategy, format!("Pushed {}", synced.join(", ")))
        }
    }

    fn enter_degraded_mode(&self) -> RecoveryResult {
        let strategy = RecoveryStrategy::DegradedMode;
        let persisted = self.degraded.enter();
        self.counters.degraded_entries.fetch_add(1, Ordering::Relaxed);
        warn!("Entering degraded mode; automatic sync suspended");
        self.log
            .record("degraded_mode_entered", json!({ "persisted": persisted }));
        self.schedule_probe();

        RecoveryResult::failed(
            strategy,
            "Degraded mode activated; automatic sync suspended until a probe succeeds",
            None,
        )
    }

    /// Restart the probe if degraded mode was persisted by an earlier process
    pub fn resume_probe_if_degraded(&self) {
        if self.degraded.is_active() && !self.probe_scheduled() {
            info!("Resuming degraded-mode probe");
            self.schedule_probe();
        }
    }

    pub fn probe_scheduled(&self) -> bool {
        self.probe_slot()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    fn schedule_probe(&self) {
        let reconciler = self.reconciler.clone();
        let degraded = self.degraded.clone();
        let log = self.log.clone();
        let first_delay = self.config.probe_delay();
        let retry_delay = self.config.probe_retry_delay();

        let handle = tokio::spawn(async move {
            let mut delay = first_delay;
            loop {
                tokio::time::sleep(delay).await;
                if !degraded.is_active() {
                    debug!("Degraded mode already cleared, stopping probe");
                    break;
                }

                let result = reconciler.pull(PullOptions::default()).await;
                if result.success {
                    degraded.exit();
                    info!("Recovery probe succeeded; leaving degraded mode");
                    log.record("degraded_mode_exited", json!({ "via": "probe" }));
                    break;
                }

                warn!(
                    "Recovery probe failed, retrying in {:?}: {}",
                    retry_delay,
                    result.error_message().unwrap_or_default()
                );
                log.record(
                    "degraded_probe_failed",
                    json!({ "error": result.error_message() }),
                );
                delay = retry_delay;
            }
        });

        if let Some(previous) = self.probe_slot().replace(handle) {
            previous.abort();
        }
    }

    fn probe_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.probe
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_active()
    }

    /// Whether automatic triggers may run
    pub fn auto_sync_allowed(&self) -> bool {
        !self.degraded.is_active()
    }

    pub fn degraded_state(&self) -> &DegradedState {
        &self.degraded
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Clear degraded mode after a successful full pull elsewhere
    ///
    /// Returns whether degraded mode was active.
    pub fn exit_degraded(&self, via: &str) -> bool {
        if !self.degraded.is_active() {
            return false;
        }
        self.degraded.exit();
        if let Some(probe) = self.probe_slot().take() {
            probe.abort();
        }
        info!("Leaving degraded mode via {}", via);
        self.log.record("degraded_mode_exited", json!({ "via": via }));
        true
    }

    /// Wipe local storage except protected keys, pull everything, restore critical keys
    pub async fn emergency_recovery(&self) -> EmergencyReport {
        warn!("Running emergency recovery");
        self.log.record("emergency_recovery_start", json!({}));

        let snapshot = self.snapshot_critical();

        let protected: HashSet<&str> = self
            .config
            .preserved_keys
            .iter()
            .chain(self.config.critical_keys.iter())
            .map(String::as_str)
            .chain(keys::ENGINE_KEYS)
            .collect();

        match self.local.keys() {
            Ok(existing) => {
                for key in existing.iter().filter(|k| !protected.contains(k.as_str())) {
                    if let Err(e) = self.local.remove(key) {
                        warn!("Failed to remove {} during emergency recovery: {}", key, e);
                    }
                }
            }
            Err(e) => warn!("Cannot list local keys: {}", e),
        }

        let pulled = self.reconciler.pull(PullOptions::with_cleanup()).await;
        self.restore_critical(&snapshot);

        let report = if pulled.success {
            EmergencyReport {
                success: true,
                restored_records: pulled.count,
                message: format!("Restored {} records from remote", pulled.count),
            }
        } else {
            EmergencyReport {
                success: false,
                restored_records: 0,
                message: format!(
                    "Emergency pull failed: {}",
                    pulled.error_message().unwrap_or_default()
                ),
            }
        };

        self.log.record(
            "emergency_recovery_result",
            json!({ "success": report.success, "restored_records": report.restored_records }),
        );
        report
    }

    /// Reset the in-progress guard and run emergency recovery unconditionally
    pub async fn force_recovery(&self) -> RecoveryResult {
        self.in_progress.store(false, Ordering::SeqCst);

        let report = self.emergency_recovery().await;
        if report.success {
            self.exit_degraded("force_recovery");
            RecoveryResult::succeeded(RecoveryStrategy::Emergency, report.message)
        } else {
            RecoveryResult::failed(RecoveryStrategy::Emergency, report.message, None)
        }
    }

    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            degraded_entries: self.counters.degraded_entries.load(Ordering::Relaxed),
        }
    }

    /// Stop the background probe
    pub fn shutdown(&self) {
        if let Some(probe) = self.probe_slot().take() {
            probe.abort();
        }
    }

    fn snapshot_critical(&self) -> Vec<(String, String)> {
        self.config
            .critical_keys
            .iter()
            .filter_map(|key| match self.local.get(key) {
                Ok(Some(value)) => Some((key.clone(), value)),
                Ok(None) => None,
                Err(e) => {
                    warn!("Cannot snapshot {}: {}", key, e);
                    None
                }
            })
            .collect()
    }

    fn restore_critical(&self, snapshot: &[(String, String)]) {
        for (key, value) in snapshot {
            if let Err(e) = self.local.set(key, value) {
                warn!("Failed to restore {}: {}", key, e);
            }
        }
    }
}

impl Drop for RecoveryManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EventLogConfig, ReconcileConfig};
    use serde_json::Value;
    use std::time::Duration;
    use tidemark_store::{MemoryRemote, MemoryStore, Record, RemoteStore};

    struct Fixture {
        local: Arc<MemoryStore>,
        remote: Arc<MemoryRemote>,
        connectivity: Connectivity,
        log: Arc<EventLog>,
        manager: Arc<RecoveryManager>,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryStore::new()), RecoveryConfig::default())
    }

    fn fixture_with(local: Arc<MemoryStore>, config: RecoveryConfig) -> Fixture {
        let remote = Arc::new(MemoryRemote::new());
        let connectivity = Connectivity::new(true);
        let log = Arc::new(EventLog::new(local.clone(), EventLogConfig::default()));
        let reconciler = Arc::new(Reconciler::new(
            local.clone(),
            remote.clone(),
            ReconcileConfig::default(),
            log.clone(),
        ));
        let manager = Arc::new(RecoveryManager::new(
            local.clone(),
            reconciler,
            connectivity.clone(),
            config,
            log.clone(),
        ));
        Fixture {
            local,
            remote,
            connectivity,
            log,
            manager,
        }
    }

    fn row(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_strategy_selection_by_position() {
        let selected: Vec<RecoveryStrategy> = (0..5).map(RecoveryStrategy::for_attempt).collect();
        assert_eq!(selected, RecoveryStrategy::LADDER.to_vec());
        assert_eq!(RecoveryStrategy::for_attempt(5), RecoveryStrategy::DegradedMode);
        assert_eq!(RecoveryStrategy::for_attempt(42), RecoveryStrategy::DegradedMode);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ladder_walks_in_order() {
        let f = fixture();
        f.local
            .set_json("records", &vec![row(serde_json::json!({"id": "r1"}))])
            .unwrap();
        f.remote.set_reachable(false);

        let mut used = Vec::new();
        for retry_count in 0..5 {
            let result = f.manager.recover("push failed", retry_count).await;
            assert!(!result.success);
            used.push(result.strategy.unwrap());
        }

        assert_eq!(used, RecoveryStrategy::LADDER.to_vec());
        assert!(f.manager.is_degraded());
        assert_eq!(f.manager.stats().attempts, 5);

        let attempts = f
            .log
            .entries()
            .iter()
            .filter(|e| e.event == "recovery_attempt")
            .count();
        assert_eq!(attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_delay_recovers_once_reachable() {
        let f = fixture();
        f.local
            .set_json("records", &vec![row(serde_json::json!({"id": "r1"}))])
            .unwrap();

        let result = f.manager.recover("timeout", 0).await;
        assert!(result.success);
        assert_eq!(result.strategy, Some(RecoveryStrategy::RetryWithDelay));
        assert_eq!(f.remote.rows("records").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_check_fails_offline() {
        let f = fixture();
        f.connectivity.set_online(false);

        let result = f.manager.recover("network", 1).await;
        assert!(!result.success);
        assert_eq!(result.strategy, Some(RecoveryStrategy::ReconnectCheck));
        assert_eq!(f.remote.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_check_pushes_when_reachable() {
        let f = fixture();
        f.local
            .set_json("records", &vec![row(serde_json::json!({"id": "r1"}))])
            .unwrap();

        let result = f.manager.recover("network", 1).await;
        assert!(result.success);
        assert_eq!(result.strategy, Some(RecoveryStrategy::ReconnectCheck));
        assert_eq!(f.remote.rows("records").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_sync_succeeds_with_one_collection() {
        let config = RecoveryConfig {
            essential_collections: vec!["drafts".to_string(), "records".to_string()],
            ..Default::default()
        };
        let f = fixture_with(Arc::new(MemoryStore::new()), config);
        f.local.set("drafts", "not json").unwrap();
        f.local
            .set_json("records", &vec![row(serde_json::json!({"id": "r1"}))])
            .unwrap();

        let result = f.manager.recover("push failed", 3).await;
        assert!(result.success);
        assert_eq!(result.strategy, Some(RecoveryStrategy::PartialSync));
        assert!(result.message.contains("records"));
        assert!(!result.message.contains("drafts"));
        assert_eq!(f.remote.rows("records").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_sync_fails_when_nothing_pushes() {
        let f = fixture();
        f.local
            .set_json("records", &vec![row(serde_json::json!({"id": "r1"}))])
            .unwrap();
        f.remote.set_reachable(false);

        let result = f.manager.recover("push failed", 3).await;
        assert!(!result.success);
        assert_eq!(result.strategy, Some(RecoveryStrategy::PartialSync));
        assert!(result.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_mode_engages_when_storage_is_full() {
        let f = fixture_with(
            Arc::new(MemoryStore::with_quota(200)),
            RecoveryConfig::default(),
        );
        f.local.set("filler", &"x".repeat(170)).unwrap();
        f.remote.set_reachable(false);

        let result = f.manager.recover("down", 4).await;
        assert_eq!(result.strategy, Some(RecoveryStrategy::DegradedMode));
        assert!(f.local.get(keys::DEGRADED_MODE).unwrap().is_none());
        assert!(f.manager.is_degraded());
        assert!(!f.manager.auto_sync_allowed());
        assert!(*f.manager.degraded_state().watch().borrow());

        // Background retries keep running on the in-memory flag alone
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(f.manager.probe_scheduled());
        assert!(f.manager.is_degraded());

        f.remote.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(601)).await;
        assert!(!f.manager.is_degraded());
        assert!(f.manager.auto_sync_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_recovery_is_skipped() {
        let f = fixture();
        let manager = f.manager.clone();
        let first = tokio::spawn(async move { manager.recover("first", 0).await });

        tokio::task::yield_now().await;
        assert!(f.manager.is_running());

        let second = f.manager.recover("second", 0).await;
        assert!(second.is_skipped());
        assert!(!second.success);
        assert_eq!(f.manager.stats().skipped, 1);

        first.await.unwrap();
        assert!(!f.manager.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_clear_preserves_critical_keys() {
        let f = fixture();
        f.local.set("session", "token-123").unwrap();
        f.local.set("records_cache", "garbage").unwrap();
        f.remote
            .upsert("records", row(serde_json::json!({"id": "r1"})), "id")
            .await
            .unwrap();

        let result = f.manager.recover("corrupt", 2).await;
        assert!(result.success);
        assert_eq!(f.local.get("session").unwrap().as_deref(), Some("token-123"));
        assert_eq!(f.local.get("records_cache").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_exits_degraded_mode() {
        let f = fixture();
        f.remote.set_reachable(false);

        f.manager.recover("down", 7).await;
        assert!(f.manager.is_degraded());
        assert!(f.manager.probe_scheduled());
        let mut degraded_rx = f.manager.degraded_state().watch();
        assert!(*degraded_rx.borrow_and_update());

        // First probe fails, the retry waits the longer interval
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(f.manager.is_degraded());

        f.remote.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(601)).await;
        assert!(!f.manager.is_degraded());
        assert!(f.local.get(keys::AUTO_SYNC_DISABLED).unwrap().is_none());
        assert!(!*degraded_rx.borrow_and_update());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_recovery_resets_everything() {
        let f = fixture();
        f.local.set("session", "keep").unwrap();
        f.local.set("settings", "{\"theme\":\"dark\"}").unwrap();
        f.local.set("scratch", "drop me").unwrap();
        f.remote
            .upsert("records", row(serde_json::json!({"id": "r1"})), "id")
            .await
            .unwrap();
        f.remote
            .upsert("records", row(serde_json::json!({"id": "r2"})), "id")
            .await
            .unwrap();

        f.remote.set_reachable(false);
        f.manager.recover("down", 4).await;
        assert!(f.manager.is_degraded());
        f.remote.set_reachable(true);

        let result = f.manager.force_recovery().await;
        assert!(result.success);
        assert_eq!(result.strategy, Some(RecoveryStrategy::Emergency));
        assert!(!f.manager.is_degraded());
        assert!(!f.manager.probe_scheduled());

        assert_eq!(f.local.get("session").unwrap().as_deref(), Some("keep"));
        assert!(f.local.get("settings").unwrap().is_some());
        assert_eq!(f.local.get("scratch").unwrap(), None);
        assert!(f
            .log
            .entries()
            .iter()
            .any(|e| e.event == "emergency_recovery_result"));
    }

    #[tokio::test]
    async fn test_emergency_reports_restored_count() {
        let f = fixture();
        for id in ["a", "b", "c"] {
            f.remote
                .upsert("records", row(serde_json::json!({ "id": id })), "id")
                .await
                .unwrap();
        }

        let report = f.manager.emergency_recovery().await;
        assert!(report.success);
        assert_eq!(report.restored_records, 3);
    }
}
