//! Composition root
//!
//! `SyncEngine` wires one event log, reconciler, recovery manager,
//! orchestrator and status façade around a pair of stores. Nothing in the
//! engine is global; independent engines can share a process.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::autosave::{AutoSaveOrchestrator, OrchestratorDeps, UnloadDecision};
use crate::config::EngineConfig;
use crate::errors::Result;
use crate::event_log::EventLog;
use crate::fingerprint::{Blake3Fingerprint, Fingerprinter};
use crate::lifecycle::{Connectivity, LifecycleSource};
use crate::reconciler::Reconciler;
use crate::recovery::RecoveryManager;
use crate::status::StatusFacade;
use tidemark_store::{LocalStore, RemoteStore};

/// Builder for a `SyncEngine`
pub struct SyncEngineBuilder {
    config: EngineConfig,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    lifecycle: Option<Arc<dyn LifecycleSource>>,
    fingerprinter: Arc<dyn Fingerprinter>,
    connectivity: Connectivity,
}

impl SyncEngineBuilder {
    /// Feed host lifecycle signals to the orchestrator
    pub fn lifecycle(mut self, source: Arc<dyn LifecycleSource>) -> Self {
        self.lifecycle = Some(source);
        self
    }

    pub fn fingerprinter(mut self, fingerprinter: Arc<dyn Fingerprinter>) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    /// Share a connectivity flag with the host
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn build(self) -> Result<SyncEngine> {
        self.config.validate()?;

        let log = Arc::new(EventLog::new(self.local.clone(), self.config.log.clone()));
        let reconciler = Arc::new(Reconciler::new(
            self.local.clone(),
            self.remote.clone(),
            self.config.reconcile.clone(),
            log.clone(),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            self.local.clone(),
            reconciler.clone(),
            self.connectivity.clone(),
            self.config.recovery.clone(),
            log.clone(),
        ));
        let orchestrator = AutoSaveOrchestrator::new(
            self.config.autosave.clone(),
            OrchestratorDeps {
                local: self.local.clone(),
                reconciler: reconciler.clone(),
                recovery: recovery.clone(),
                log: log.clone(),
                connectivity: self.connectivity.clone(),
                lifecycle: self.lifecycle,
                fingerprinter: self.fingerprinter,
            },
        );
        let status = StatusFacade::new(&orchestrator, log.clone(), self.local.clone());

        info!("Sync engine built (session {})", log.session_id());

        Ok(SyncEngine {
            config: self.config,
            local: self.local,
            remote: self.remote,
            connectivity: self.connectivity,
            log,
            reconciler,
            recovery,
            orchestrator,
            status,
        })
    }
}

/// A complete synchronization engine
pub struct SyncEngine {
    config: EngineConfig,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Connectivity,
    log: Arc<EventLog>,
    reconciler: Arc<Reconciler>,
    recovery: Arc<RecoveryManager>,
    orchestrator: AutoSaveOrchestrator,
    status: StatusFacade,
}

impl SyncEngine {
    pub fn builder(
        config: EngineConfig,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            local,
            remote,
            lifecycle: None,
            fingerprinter: Arc::new(Blake3Fingerprint),
            connectivity: Connectivity::default(),
        }
    }

    /// Start background triggers, and status polling if an interval is given
    pub fn start(&self, status_poll: Option<Duration>) {
        self.orchestrator.initialize();
        if let Some(every) = status_poll {
            self.status.start_polling(every);
        }
        info!("Sync engine started");
    }

    /// Flush unsynced data, then stop every background task
    pub async fn shutdown(&self) -> UnloadDecision {
        let decision = self.orchestrator.before_unload().await;
        self.orchestrator.cleanup();
        self.status.stop();
        self.recovery.shutdown();
        info!("Sync engine stopped ({:?})", decision);
        decision
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn local(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn orchestrator(&self) -> &AutoSaveOrchestrator {
        &self.orchestrator
    }

    pub fn status(&self) -> &StatusFacade {
        &self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SyncError;
    use crate::lifecycle::ChannelLifecycle;
    use tidemark_store::{LocalStoreExt, MemoryRemote, MemoryStore};

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.autosave.max_retries = 0;

        let result = SyncEngine::builder(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryRemote::new()),
        )
        .build();
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_engines_are_independent() {
        let remote = Arc::new(MemoryRemote::new());
        let first = SyncEngine::builder(
            EngineConfig::default(),
            Arc::new(MemoryStore::new()),
            remote.clone(),
        )
        .build()
        .unwrap();
        let second = SyncEngine::builder(
            EngineConfig::default(),
            Arc::new(MemoryStore::new()),
            remote.clone(),
        )
        .lifecycle(Arc::new(ChannelLifecycle::new()))
        .build()
        .unwrap();

        first.orchestrator().disable();
        assert!(!first.status().refresh().enabled);
        assert!(second.status().refresh().enabled);
        assert_ne!(first.log().session_id(), second.log().session_id());
    }

    #[tokio::test]
    async fn test_shutdown_flushes() {
        let local = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemote::new());
        let engine = SyncEngine::builder(EngineConfig::default(), local.clone(), remote.clone())
            .build()
            .unwrap();
        engine.start(None);

        local
            .set_json("records", &vec![serde_json::json!({"id": "a"})])
            .unwrap();

        let decision = engine.shutdown().await;
        assert_eq!(decision, UnloadDecision::Block { flushed: true });
        assert_eq!(remote.rows("records").await.len(), 1);
        assert_eq!(engine.orchestrator().active_tasks(), 0);
    }
}
