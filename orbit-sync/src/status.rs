//! Connection status and the listener set notified on changes.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::lock;

/// Network connection state as seen by consumers.
///
/// `Disconnected` doubles as "not applicable" when no network channel is
/// configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// A status callback. Identity is the `Arc` allocation.
pub type StatusListener = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Set of status listeners keyed by `Arc` identity.
///
/// Adding the same listener twice keeps one registration; removing an
/// unknown listener is a no-op.
#[derive(Default)]
pub struct StatusListeners {
    listeners: Mutex<Vec<StatusListener>>,
}

impl StatusListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Returns `false` if it was already registered.
    pub fn add(&self, listener: StatusListener) -> bool {
        let mut listeners = lock(&self.listeners);
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub fn remove(&self, listener: &StatusListener) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Invoke every listener synchronously.
    ///
    /// Listeners run outside the lock so they may add or remove listeners.
    pub fn notify(&self, status: ConnectionStatus) {
        let snapshot: Vec<StatusListener> = lock(&self.listeners).clone();
        for listener in snapshot {
            listener(status);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.listeners).clear();
    }
}
