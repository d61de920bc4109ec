//! # orbit-sync — Local-first synchronization for Orbit documents
//!
//! A [`Coordinator`] owns one replicated document and keeps it in sync
//! across durable storage, other instances in the same process, and a
//! remote relay.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌───────────────┐
//!                    │  Coordinator  │
//!                    │ (per store)   │
//!                    └───────┬───────┘
//!        ┌───────────────────┼────────────────────┐
//!        ▼                   ▼                    ▼
//! ┌─────────────┐    ┌───────────────┐    ┌───────────────┐
//! │ Storage     │    │ TabBroadcast  │    │ WebSocket     │
//! │ (debounced) │    │ (in-process)  │    │ (reconnects)  │
//! └─────────────┘    └───────────────┘    └───────┬───────┘
//!                                                 │ Binary Proto
//!                                         ┌───────┴───────┐
//!                                         │  RelayServer  │
//!                                         │ (room/store)  │
//!                                         └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`] — lifecycle, echo suppression, circuit breaker
//! - [`storage`] — persistence adapters (memory, file, RocksDB)
//! - [`tab`] — in-process broadcast between replicas of a store
//! - [`network`] — reconnecting WebSocket channel
//! - [`relay`] — WebSocket relay server
//! - [`protocol`] — binary wire protocol (bincode-encoded SyncMessage)
//! - [`presence`] — ephemeral per-peer presence

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod debounce;
pub mod error;
pub mod network;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod status;
pub mod storage;
pub mod tab;

// Re-exports for convenience
pub use bus::{BroadcastBus, BusChannel, BusStats, WeakBusChannel};
pub use config::{CoordinatorConfig, NetworkOptions};
pub use coordinator::Coordinator;
pub use error::{ProtocolError, StorageError, SyncError};
pub use network::{ChannelEvent, NetworkChannel, WebSocketChannel};
pub use presence::{AwarenessMessage, PresenceState, TextCursor};
pub use protocol::{MessageType, SyncMessage};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use status::{ConnectionStatus, StatusListener};
pub use storage::{FileStorage, MemoryStorage, StorageAdapter};
pub use tab::TabMessage;

pub use orbit_core;

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
