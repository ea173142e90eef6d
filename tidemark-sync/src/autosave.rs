//! Autosave orchestrator
//!
//! Owns the scheduling around the reconciler:
//! - change detection: fingerprints the watched keys on an interval and
//!   pushes when the fingerprint moves
//! - periodic push whenever watched data exists
//! - lifecycle hooks: pull on focus or visibility, push on blur or hide,
//!   flush before unload
//! - retry with per-attempt timeout and exponential backoff
//!
//! Push failures are handed to the recovery manager through a queue drained
//! by a background worker, so triggers never wait on recovery. At most one
//! push and one pull are in flight per orchestrator; a push and a pull may
//! overlap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::AutoSaveConfig;
use crate::errors::SyncError;
use crate::event_log::EventLog;
use crate::events::{PullReason, SaveReason, SyncEvent};
use crate::fingerprint::Fingerprinter;
use crate::lifecycle::{Connectivity, LifecycleEvent, LifecycleSource};
use crate::reconciler::{PullOptions, Reconciler, SyncResult};
use crate::recovery::{FlagGuard, RecoveryManager};
use tidemark_store::LocalStore;

/// Event listener callback
pub type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Collaborators of an orchestrator
pub struct OrchestratorDeps {
    pub local: Arc<dyn LocalStore>,
    pub reconciler: Arc<Reconciler>,
    pub recovery: Arc<RecoveryManager>,
    pub log: Arc<EventLog>,
    pub connectivity: Connectivity,
    pub lifecycle: Option<Arc<dyn LifecycleSource>>,
    pub fingerprinter: Arc<dyn Fingerprinter>,
}

/// A failed push waiting for the recovery worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    pub error: String,
    pub retry_count: u32,
}

/// Answer to an unload attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum UnloadDecision {
    /// Nothing unsynced; teardown may proceed
    Allow,
    /// Unsynced data existed; a single flush attempt was made
    Block { flushed: bool },
}

/// Push/pull counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub saves: u64,
    pub save_failures: u64,
    pub syncs: u64,
    pub sync_failures: u64,
    pub recoveries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    saves: AtomicU64,
    save_failures: AtomicU64,
    syncs: AtomicU64,
    sync_failures: AtomicU64,
    recoveries: AtomicU64,
}

#[derive(Debug, Default)]
struct State {
    /// Fingerprint seen by the last change-detection tick
    observed_hash: Option<String>,
    /// Fingerprint of the data last known to match the remote
    synced_hash: Option<String>,
    last_save: Option<DateTime<Utc>>,
    last_sync: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// Registration handle returned by `subscribe`
///
/// Dropping the handle keeps the listener registered; call `unsubscribe`.
pub struct Subscription {
    id: u64,
    subscribers: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    /// Remove the listener; returns false if it was already removed
    pub fn unsubscribe(&self) -> bool {
        let Some(subscribers) = self.subscribers.upgrade() else {
            return false;
        };
        let mut subscribers = subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subscribers.listeners.len();
        subscribers.listeners.retain(|(id, _)| *id != self.id);
        subscribers.listeners.len() != before
    }
}

struct Inner {
    config: AutoSaveConfig,
    local: Arc<dyn LocalStore>,
    reconciler: Arc<Reconciler>,
    recovery: Arc<RecoveryManager>,
    log: Arc<EventLog>,
    connectivity: Connectivity,
    lifecycle: Option<Arc<dyn LifecycleSource>>,
    fingerprinter: Arc<dyn Fingerprinter>,

    enabled: AtomicBool,
    saving: AtomicBool,
    syncing: AtomicBool,
    state: Mutex<State>,
    subscribers: Arc<Mutex<Subscribers>>,
    timers: Mutex<Vec<JoinHandle<()>>>,

    recovery_tx: mpsc::UnboundedSender<RecoveryRequest>,
    recovery_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RecoveryRequest>>>,
    recovery_backlog: AtomicUsize,
    consecutive_failures: AtomicU32,
    counters: Counters,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let timers = self
            .timers
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for timer in timers.drain(..) {
            timer.abort();
        }
    }
}

/// Scheduler of automatic pushes and pulls
///
/// Cheap to clone; all clones drive the same state.
#[derive(Clone)]
pub struct AutoSaveOrchestrator {
    inner: Arc<Inner>,
}

/// Non-owning orchestrator handle for background tasks and observers
#[derive(Clone)]
pub struct WeakOrchestrator {
    inner: Weak<Inner>,
}

impl WeakOrchestrator {
    pub fn upgrade(&self) -> Option<AutoSaveOrchestrator> {
        self.inner.upgrade().map(|inner| AutoSaveOrchestrator { inner })
    }
}

impl AutoSaveOrchestrator {
    pub fn new(config: AutoSaveConfig, deps: OrchestratorDeps) -> Self {
        let (recovery_tx, recovery_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                config,
                local: deps.local,
                reconciler: deps.reconciler,
                recovery: deps.recovery,
                log: deps.log,
                connectivity: deps.connectivity,
                lifecycle: deps.lifecycle,
                fingerprinter: deps.fingerprinter,
                enabled: AtomicBool::new(true),
                saving: AtomicBool::new(false),
                syncing: AtomicBool::new(false),
                state: Mutex::new(State::default()),
                subscribers: Arc::new(Mutex::new(Subscribers::default())),
                timers: Mutex::new(Vec::new()),
                recovery_tx,
                recovery_rx: Arc::new(tokio::sync::Mutex::new(recovery_rx)),
                recovery_backlog: AtomicUsize::new(0),
                consecutive_failures: AtomicU32::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakOrchestrator {
        WeakOrchestrator {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Start the recovery worker and the configured triggers
    ///
    /// Must be called from within a Tokio runtime. Calling it again replaces
    /// the running tasks.
    pub fn initialize(&self) {
        self.abort_timers();

        let fingerprint = self.current_fingerprint();
        self.state().observed_hash = Some(fingerprint);

        let triggers = &self.inner.config.triggers;
        let mut tasks = vec![self.spawn_recovery_worker()];

        if triggers.change_detection {
            tasks.push(self.spawn_change_detection());
        }
        if triggers.periodic {
            tasks.push(self.spawn_periodic_save());
        }
        if triggers.lifecycle {
            if let Some(source) = &self.inner.lifecycle {
                tasks.push(self.spawn_lifecycle_listener(source.subscribe()));
            }
        }

        self.inner.recovery.resume_probe_if_degraded();

        let count = tasks.len();
        *self.timers() = tasks;
        info!("Autosave initialized with {} background tasks", count);
        self.inner
            .log
            .record("autosave_initialized", json!({ "tasks": count }));
    }

    /// Stop every background task and drop all listeners
    pub fn cleanup(&self) {
        self.abort_timers();
        self.subscribers().listeners.clear();
        debug!("Autosave cleaned up");
    }

    /// Number of running background tasks
    pub fn active_tasks(&self) -> usize {
        self.timers().iter().filter(|t| !t.is_finished()).count()
    }

    fn abort_timers(&self) {
        for timer in self.timers().drain(..) {
            timer.abort();
        }
    }

    /// Register a listener for every `SyncEvent`
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut subscribers = self.subscribers();
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.listeners.push((id, Arc::new(listener)));

        Subscription {
            id,
            subscribers: Arc::downgrade(&self.inner.subscribers),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.subscribers().listeners.len()
    }

    fn emit(&self, event: SyncEvent) {
        // Snapshot so listeners may unsubscribe while being called
        let listeners: Vec<Listener> = self
            .subscribers()
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!("Sync event listener panicked on {}", event.kind().as_str());
            }
        }
    }

    /// Push the primary collection
    ///
    /// Automatic reasons are skipped while disabled or degraded; any reason
    /// is skipped while another push is running. Returns whether a push ran
    /// and succeeded.
    pub async fn trigger_save(&self, reason: SaveReason) -> bool {
        let inner = &self.inner;

        if reason.is_automatic() {
            if !inner.enabled.load(Ordering::SeqCst) {
                debug!("Autosave disabled, ignoring {} save", reason.as_str());
                return false;
            }
            if !inner.recovery.auto_sync_allowed() {
                debug!("Degraded mode, suppressing {} save", reason.as_str());
                return false;
            }
        }

        let Some(guard) = FlagGuard::try_acquire(&inner.saving) else {
            debug!("Save already in progress, ignoring {} save", reason.as_str());
            return false;
        };

        let fingerprint = self.current_fingerprint();
        self.emit(SyncEvent::SaveStart {
            reason,
            timestamp: Utc::now(),
        });
        inner
            .log
            .record("save_start", json!({ "reason": reason.as_str() }));

        let attempts = if reason == SaveReason::Unload {
            1
        } else {
            inner.config.max_retries
        };
        let outcome = self.push_with_retry(attempts).await;
        drop(guard);

        match outcome {
            Ok(result) => {
                // Written-back ids change the stored collection
                let fingerprint = if result.assigned_ids > 0 {
                    self.current_fingerprint()
                } else {
                    fingerprint
                };
                {
                    let mut state = self.state();
                    state.last_save = Some(Utc::now());
                    state.synced_hash = Some(fingerprint);
                    state.last_error = None;
                }
                inner.consecutive_failures.store(0, Ordering::SeqCst);
                inner.counters.saves.fetch_add(1, Ordering::Relaxed);

                info!("Saved {} records ({})", result.count, reason.as_str());
                inner.log.record(
                    "save_success",
                    json!({ "reason": reason.as_str(), "count": result.count }),
                );
                self.emit(SyncEvent::SaveSuccess {
                    reason,
                    result,
                    timestamp: Utc::now(),
                });
                true
            }
            Err(e) => {
                let message = match e {
                    SyncError::RetriesExhausted { last_error, .. } => last_error,
                    other => other.to_string(),
                };
                self.state().last_error = Some(message.clone());
                inner.counters.save_failures.fetch_add(1, Ordering::Relaxed);

                warn!("Save failed ({}): {}", reason.as_str(), message);
                inner.log.record(
                    "save_error",
                    json!({ "reason": reason.as_str(), "error": message }),
                );
                self.emit(SyncEvent::SaveError {
                    reason,
                    error: message.clone(),
                    timestamp: Utc::now(),
                });

                if reason != SaveReason::Unload {
                    self.request_recovery(message);
                }
                false
            }
        }
    }

    /// Run up to `attempts` push attempts, each raced against the timeout
    ///
    /// A timed-out attempt is not aborted and may still land later; upserts
    /// are keyed by id so that is harmless.
    async fn push_with_retry(&self, attempts: u32) -> Result<SyncResult, SyncError> {
        let config = &self.inner.config;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let reconciler = self.inner.reconciler.clone();
            let handle = tokio::spawn(async move { reconciler.push(None).await });

            match tokio::time::timeout(config.timeout(), handle).await {
                Ok(Ok(result)) if result.success => return Ok(result),
                Ok(Ok(result)) => {
                    last_error = result
                        .error_message()
                        .unwrap_or_else(|| "push failed".to_string());
                }
                Ok(Err(e)) => last_error = SyncError::Task(e.to_string()).to_string(),
                Err(_) => {
                    last_error =
                        SyncError::Timeout(format!("push attempt {} of {}", attempt, attempts))
                            .to_string();
                }
            }

            warn!("Push attempt {}/{} failed: {}", attempt, attempts, last_error);
            self.inner.log.record(
                "save_attempt_failed",
                json!({ "attempt": attempt, "error": last_error }),
            );

            if attempt < attempts {
                tokio::time::sleep(config.backoff_delay(attempt)).await;
            }
        }

        Err(SyncError::RetriesExhausted {
            attempts,
            last_error,
        })
    }

    fn request_recovery(&self, error: String) {
        let retry_count = self.inner.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        self.inner.recovery_backlog.fetch_add(1, Ordering::SeqCst);

        if self
            .inner
            .recovery_tx
            .send(RecoveryRequest { error, retry_count })
            .is_err()
        {
            self.inner.recovery_backlog.fetch_sub(1, Ordering::SeqCst);
            error!("Recovery queue closed; dropping request {}", retry_count);
        } else {
            debug!("Queued recovery request {}", retry_count);
        }
    }

    /// Recovery requests queued or being handled
    pub fn recovery_backlog(&self) -> usize {
        self.inner.recovery_backlog.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Replace the primary collection with the remote rows
    ///
    /// Skipped while a push runs or another pull runs. Automatic pulls are
    /// also skipped while disabled or degraded, and while holding unsynced
    /// data unless `hold_pulls_while_unsynced` is off.
    pub async fn trigger_download(&self, reason: PullReason) -> bool {
        let inner = &self.inner;

        if reason.is_automatic() {
            if !inner.enabled.load(Ordering::SeqCst) || !inner.recovery.auto_sync_allowed() {
                debug!("Automatic pull suppressed");
                return false;
            }
            if inner.config.hold_pulls_while_unsynced && self.has_unsynced_data() {
                debug!("Unsynced local data, skipping automatic pull");
                return false;
            }
        }

        if inner.saving.load(Ordering::SeqCst) {
            debug!("Save in progress, skipping pull");
            return false;
        }
        let Some(guard) = FlagGuard::try_acquire(&inner.syncing) else {
            debug!("Pull already in progress");
            return false;
        };

        self.emit(SyncEvent::SyncStart {
            reason,
            timestamp: Utc::now(),
        });
        inner.log.record("sync_start", json!({ "reason": reason }));

        let result = inner.reconciler.pull(PullOptions::default()).await;
        drop(guard);

        if result.success {
            let fingerprint = self.current_fingerprint();
            {
                let mut state = self.state();
                state.last_sync = Some(Utc::now());
                state.observed_hash = Some(fingerprint.clone());
                state.synced_hash = Some(fingerprint);
                state.last_error = None;
            }
            inner.counters.syncs.fetch_add(1, Ordering::Relaxed);
            if inner.recovery.exit_degraded("pull") {
                self.reset_failures();
            }

            info!("Pulled {} records", result.count);
            inner.log.record(
                "sync_success",
                json!({ "count": result.count, "lightweight": result.lightweight }),
            );
            self.emit(SyncEvent::SyncSuccess {
                reason,
                result,
                timestamp: Utc::now(),
            });
            true
        } else {
            let message = result
                .error_message()
                .unwrap_or_else(|| "pull failed".to_string());
            self.state().last_error = Some(message.clone());
            inner.counters.sync_failures.fetch_add(1, Ordering::Relaxed);

            warn!("Pull failed: {}", message);
            inner.log.record("sync_error", json!({ "error": message }));
            self.emit(SyncEvent::SyncError {
                reason,
                error: message,
                timestamp: Utc::now(),
            });
            false
        }
    }

    /// Push now and wait for the outcome
    pub async fn save_now(&self) -> bool {
        self.trigger_save(SaveReason::Manual).await
    }

    /// Pull now and wait for the outcome
    pub async fn sync_now(&self) -> bool {
        self.trigger_download(PullReason::Manual).await
    }

    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::SeqCst);
        info!("Autosave enabled");
        self.inner.log.record("autosave_enabled", json!({}));
    }

    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        info!("Autosave disabled");
        self.inner.log.record("autosave_disabled", json!({}));
    }

    /// Flush before teardown if anything is unsynced
    pub async fn before_unload(&self) -> UnloadDecision {
        if !self.has_unsynced_data() {
            return UnloadDecision::Allow;
        }

        let flushed = self.trigger_save(SaveReason::Unload).await;
        info!("Unload blocked for flush (flushed: {})", flushed);
        UnloadDecision::Block { flushed }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn is_saving(&self) -> bool {
        self.inner.saving.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.recovery.is_degraded()
    }

    pub fn last_save(&self) -> Option<DateTime<Utc>> {
        self.state().last_save
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.state().last_sync
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    pub fn clear_error(&self) {
        self.state().last_error = None;
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.inner.recovery
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.inner.reconciler
    }

    /// Records in the primary collection
    pub fn data_count(&self) -> usize {
        self.inner.reconciler.record_count()
    }

    /// Watched data exists and differs from what was last synced
    pub fn has_unsynced_data(&self) -> bool {
        if !self.has_watched_data() {
            return false;
        }
        let fingerprint = self.current_fingerprint();
        self.state().synced_hash.as_deref() != Some(fingerprint.as_str())
    }

    pub fn stats(&self) -> OrchestratorStats {
        let counters = &self.inner.counters;
        OrchestratorStats {
            saves: counters.saves.load(Ordering::Relaxed),
            save_failures: counters.save_failures.load(Ordering::Relaxed),
            syncs: counters.syncs.load(Ordering::Relaxed),
            sync_failures: counters.sync_failures.load(Ordering::Relaxed),
            recoveries: counters.recoveries.load(Ordering::Relaxed),
        }
    }

    fn watched_entries(&self) -> Vec<(String, Option<String>)> {
        self.inner
            .config
            .watched_keys
            .iter()
            .map(|key| {
                let value = self.inner.local.get(key).unwrap_or_else(|e| {
                    warn!("Cannot read watched key {}: {}", key, e);
                    None
                });
                (key.clone(), value)
            })
            .collect()
    }

    fn current_fingerprint(&self) -> String {
        self.inner.fingerprinter.fingerprint(&self.watched_entries())
    }

    fn has_watched_data(&self) -> bool {
        self.watched_entries()
            .iter()
            .any(|(_, value)| value.as_deref().map_or(false, is_meaningful))
    }

    /// Change-detection tick; returns whether the fingerprint moved
    async fn check_for_changes(&self) -> bool {
        let fingerprint = self.current_fingerprint();
        let previous = self.state().observed_hash.replace(fingerprint.clone());

        match previous {
            Some(previous) if previous != fingerprint => {
                debug!("Watched data changed");
                self.trigger_save(SaveReason::ChangeDetected).await;
                true
            }
            _ => false,
        }
    }

    async fn handle_lifecycle(&self, event: LifecycleEvent) {
        debug!("Lifecycle event: {:?}", event);
        match event {
            LifecycleEvent::FocusGained => {
                self.trigger_download(PullReason::FocusGained).await;
            }
            LifecycleEvent::Visible => {
                self.trigger_download(PullReason::Visible).await;
            }
            LifecycleEvent::FocusLost => {
                self.trigger_save(SaveReason::FocusLost).await;
            }
            LifecycleEvent::Hidden => {
                self.trigger_save(SaveReason::Hidden).await;
            }
            LifecycleEvent::Online => {
                self.inner.connectivity.set_online(true);
                self.inner.log.record("connectivity", json!({ "online": true }));
                if self.has_unsynced_data() {
                    self.trigger_save(SaveReason::Reconnected).await;
                }
            }
            LifecycleEvent::Offline => {
                self.inner.connectivity.set_online(false);
                self.inner
                    .log
                    .record("connectivity", json!({ "online": false }));
            }
            LifecycleEvent::BeforeUnload => {
                let decision = self.before_unload().await;
                self.inner
                    .log
                    .record("before_unload", json!({ "decision": decision }));
            }
        }
    }

    fn spawn_change_detection(&self) -> JoinHandle<()> {
        let weak = self.downgrade();
        let period = self.inner.config.change_check_interval();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                orchestrator.check_for_changes().await;
            }
            debug!("Change detection stopped");
        })
    }

    fn spawn_periodic_save(&self) -> JoinHandle<()> {
        let weak = self.downgrade();
        let period = self.inner.config.save_interval();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                if orchestrator.has_watched_data() {
                    orchestrator.trigger_save(SaveReason::Periodic).await;
                }
            }
            debug!("Periodic save stopped");
        })
    }

    fn spawn_lifecycle_listener(
        &self,
        mut events: broadcast::Receiver<LifecycleEvent>,
    ) -> JoinHandle<()> {
        let weak = self.downgrade();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} lifecycle events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                orchestrator.handle_lifecycle(event).await;
            }
            debug!("Lifecycle listener stopped");
        })
    }

    /// Drain recovery requests; also restart the ladder whenever degraded
    /// mode is left, whichever path cleared it
    fn spawn_recovery_worker(&self) -> JoinHandle<()> {
        let weak = self.downgrade();
        let requests = self.inner.recovery_rx.clone();
        let mut degraded = self.inner.recovery.degraded_state().watch();

        tokio::spawn(async move {
            let mut requests = requests.lock().await;
            loop {
                tokio::select! {
                    request = requests.recv() => {
                        let Some(request) = request else {
                            break;
                        };
                        let Some(orchestrator) = weak.upgrade() else {
                            break;
                        };
                        orchestrator.handle_recovery(request).await;
                    }
                    changed = degraded.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let active = *degraded.borrow_and_update();
                        if !active {
                            let Some(orchestrator) = weak.upgrade() else {
                                break;
                            };
                            orchestrator.reset_failures();
                        }
                    }
                }
            }
            debug!("Recovery worker stopped");
        })
    }

    fn reset_failures(&self) {
        let previous = self.inner.consecutive_failures.swap(0, Ordering::SeqCst);
        if previous > 0 {
            debug!("Failure counter reset after {} failed saves", previous);
        }
    }

    async fn handle_recovery(&self, request: RecoveryRequest) {
        let inner = &self.inner;
        let result = inner
            .recovery
            .recover(&request.error, request.retry_count)
            .await;

        if result.success {
            self.reset_failures();
            inner.counters.recoveries.fetch_add(1, Ordering::Relaxed);
            let fingerprint = self.current_fingerprint();
            {
                let mut state = self.state();
                state.synced_hash = Some(fingerprint);
                state.last_error = None;
            }
            info!("Recovered after {} failed saves", request.retry_count + 1);
        } else if result.is_skipped() {
            debug!("Recovery request {} skipped", request.retry_count);
        } else if inner.recovery.is_degraded() {
            self.state().last_error = Some(result.message.clone());
        }

        inner.recovery_backlog.fetch_sub(1, Ordering::SeqCst);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn timers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Empty collections and nulls do not count as data
fn is_meaningful(raw: &str) -> bool {
    !matches!(raw.trim(), "" | "[]" | "{}" | "null")
}
