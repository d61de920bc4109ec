//! Network synchronization channel.
//!
//! A channel exchanges deltas with a remote peer over a persistent
//! connection and reports its lifecycle as a stream of [`ChannelEvent`]s.
//! The coordinator owns the failure policy (circuit breaker); the channel
//! only retries with backoff while auto-reconnect is enabled.
//!
//! ```text
//!            connect()
//! Disconnected ───────► Connecting ──ok──► Connected
//!      ▲                    │                  │
//!      │◄── error + backoff ┘                  │
//!      └────────────── close / disconnect() ◄──┘
//! ```

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::NetworkOptions;
use crate::presence::PresenceState;
use crate::status::ConnectionStatus;

pub mod websocket;

pub use websocket::WebSocketChannel;

/// Lifecycle and data events emitted by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Status(ConnectionStatus),
    /// A connection attempt failed or an established connection broke.
    ConnectionError(String),
    /// Delta received from the remote side.
    Update(Vec<u8>),
}

/// A bidirectional, reconnecting message channel to a remote peer group.
pub trait NetworkChannel: Send + Sync {
    /// Start connecting in the background. No-op while already running.
    fn connect(&self);

    /// Drop the connection and stop any pending retry. Idempotent.
    fn disconnect(&self);

    /// Disconnect permanently; later `connect` calls are ignored.
    fn destroy(&self);

    fn set_auto_reconnect(&self, enabled: bool);

    fn auto_reconnect(&self) -> bool;

    fn status(&self) -> ConnectionStatus;

    /// Take the event stream. Only the first caller receives it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    /// Send a delta. Returns `false` if it was dropped because the channel
    /// is not connected.
    fn send_update(&self, update: Vec<u8>) -> bool;

    /// Presence of remote peers currently known to the channel.
    fn presence(&self) -> HashMap<Uuid, PresenceState>;

    /// Publish (or clear, with `None`) this peer's presence.
    fn set_local_presence(&self, state: Option<PresenceState>);
}

/// Delay before reconnect attempt number `attempt` (1-based).
///
/// Doubles from `retry_delay_ms` per consecutive failure, capped at
/// `max_retry_delay_ms`.
pub fn backoff_delay(options: &NetworkOptions, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let delay = options
        .retry_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(options.max_retry_delay_ms.max(options.retry_delay_ms));
    Duration::from_millis(delay)
}
