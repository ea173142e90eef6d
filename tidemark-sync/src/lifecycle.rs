//! Host lifecycle signals and connectivity
//!
//! The orchestrator never talks to a windowing system directly. Hosts feed
//! focus, visibility, connectivity and unload signals through a
//! `LifecycleSource`; dropping the receiver unsubscribes.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Host environment signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    FocusGained,
    FocusLost,
    Hidden,
    Visible,
    Online,
    Offline,
    BeforeUnload,
}

/// Source of lifecycle signals
pub trait LifecycleSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent>;
}

/// Lifecycle source driven by explicit `emit` calls
#[derive(Debug, Clone)]
pub struct ChannelLifecycle {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for ChannelLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelLifecycle {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    /// Deliver a signal, returning how many subscribers received it
    pub fn emit(&self, event: LifecycleEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl LifecycleSource for ChannelLifecycle {
    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

/// Shared network-online flag
#[derive(Debug, Clone)]
pub struct Connectivity {
    online: Arc<AtomicBool>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Update the flag, returning the previous value
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_lifecycle_fan_out() {
        let source = ChannelLifecycle::new();
        assert_eq!(source.emit(LifecycleEvent::Hidden), 0);

        let mut first = source.subscribe();
        let mut second = source.subscribe();
        assert_eq!(source.emit(LifecycleEvent::FocusGained), 2);

        assert_eq!(first.recv().await.unwrap(), LifecycleEvent::FocusGained);
        assert_eq!(second.recv().await.unwrap(), LifecycleEvent::FocusGained);

        drop(second);
        assert_eq!(source.emit(LifecycleEvent::Visible), 1);
    }

    #[test]
    fn test_connectivity_shared_between_clones() {
        let connectivity = Connectivity::default();
        let clone = connectivity.clone();

        assert!(clone.set_online(false));
        assert!(!connectivity.is_online());
    }
}
