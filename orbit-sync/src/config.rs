//! Coordinator and network configuration.
//!
//! Plain values come from `Default` or JSON; collaborators (storage, bus,
//! custom network channel) are attached with the `with_*` builders.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::BroadcastBus;
use crate::error::SyncError;
use crate::network::NetworkChannel;
use crate::storage::StorageAdapter;
use crate::tab::TabMessage;

/// Reconnect policy of the network channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    /// First reconnect delay; doubles per consecutive failure
    pub retry_delay_ms: u64,
    /// Upper bound for the reconnect delay
    pub max_retry_delay_ms: u64,
    /// Consecutive failures before the circuit breaker trips
    pub max_failures: u32,
    /// WebSocket sub-protocols offered to the server
    pub protocols: Vec<String>,
    pub connect_timeout_ms: u64,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            max_failures: 3,
            protocols: Vec::new(),
            connect_timeout_ms: 10_000,
        }
    }
}

/// Configuration of one [`Coordinator`](crate::Coordinator).
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Identifies the replicated document; required
    pub store_id: String,
    pub enable_tab_sync: bool,
    pub persist_debounce_ms: u64,
    pub network_url: Option<String>,
    pub network: NetworkOptions,
    #[serde(skip)]
    pub storage: Option<Arc<dyn StorageAdapter>>,
    /// Bus used for tab sync; the process-wide bus when unset
    #[serde(skip)]
    pub tab_bus: Option<BroadcastBus<TabMessage>>,
    /// Overrides the WebSocket channel built from `network_url`
    #[serde(skip)]
    pub network_channel: Option<Arc<dyn NetworkChannel>>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            store_id: String::new(),
            enable_tab_sync: true,
            persist_debounce_ms: 300,
            network_url: None,
            network: NetworkOptions::default(),
            storage: None,
            tab_bus: None,
            network_channel: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn new(store_id: impl Into<String>) -> Self {
        Self {
            store_id: store_id.into(),
            ..Self::default()
        }
    }

    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_tab_bus(mut self, bus: BroadcastBus<TabMessage>) -> Self {
        self.tab_bus = Some(bus);
        self
    }

    pub fn with_tab_sync(mut self, enabled: bool) -> Self {
        self.enable_tab_sync = enabled;
        self
    }

    pub fn with_network_url(mut self, url: impl Into<String>) -> Self {
        self.network_url = Some(url.into());
        self
    }

    pub fn with_network_options(mut self, options: NetworkOptions) -> Self {
        self.network = options;
        self
    }

    pub fn with_network_channel(mut self, channel: Arc<dyn NetworkChannel>) -> Self {
        self.network_channel = Some(channel);
        self
    }

    pub fn with_persist_debounce(mut self, delay: Duration) -> Self {
        self.persist_debounce_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.store_id.trim().is_empty() {
            return Err(SyncError::Config("store_id must not be empty".into()));
        }
        if self.network.max_failures == 0 {
            return Err(SyncError::Config("max_failures must be at least 1".into()));
        }
        if self.network.retry_delay_ms == 0 {
            return Err(SyncError::Config("retry_delay_ms must be positive".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for CoordinatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorConfig")
            .field("store_id", &self.store_id)
            .field("enable_tab_sync", &self.enable_tab_sync)
            .field("persist_debounce_ms", &self.persist_debounce_ms)
            .field("network_url", &self.network_url)
            .field("network", &self.network)
            .field("storage", &self.storage.is_some())
            .field("tab_bus", &self.tab_bus.is_some())
            .field("network_channel", &self.network_channel.is_some())
            .finish()
    }
}
