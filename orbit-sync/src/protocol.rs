//! Binary relay protocol.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┐
//! │ msg_type │ peer_id   │ store_id     │ payload  │
//! │ 1 byte   │ 16 bytes  │ len + UTF-8  │ variable │
//! └──────────┴───────────┴──────────────┴──────────┘
//! ```
//!
//! `Update` and `State` payloads are opaque document deltas; `Awareness`
//! payloads are bincode-encoded [`AwarenessMessage`]s.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::presence::AwarenessMessage;

/// Message types for the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Peer announces itself in a store room
    Join = 1,
    /// Peer left the room
    Leave = 2,
    /// Incremental document delta
    Update = 3,
    /// Full encoded document state
    State = 4,
    /// Presence update
    Awareness = 5,
    /// Heartbeat ping
    Ping = 6,
    /// Heartbeat pong
    Pong = 7,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub store_id: String,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, store_id: &str, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            store_id: store_id.to_string(),
            payload,
        }
    }

    pub fn join(peer_id: Uuid, store_id: &str) -> Self {
        Self::new(MessageType::Join, peer_id, store_id, Vec::new())
    }

    pub fn leave(peer_id: Uuid, store_id: &str) -> Self {
        Self::new(MessageType::Leave, peer_id, store_id, Vec::new())
    }

    /// Create an incremental delta message.
    pub fn update(peer_id: Uuid, store_id: &str, delta: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, store_id, delta)
    }

    /// Create a full-state message.
    pub fn state(peer_id: Uuid, store_id: &str, state: Vec<u8>) -> Self {
        Self::new(MessageType::State, peer_id, store_id, state)
    }

    /// Create a presence message.
    pub fn awareness(
        peer_id: Uuid,
        store_id: &str,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Awareness, peer_id, store_id, message.encode()?))
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the presence payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        AwarenessMessage::decode(&self.payload)
    }

    /// Whether the payload is a document delta.
    pub fn carries_delta(&self) -> bool {
        matches!(self.msg_type, MessageType::Update | MessageType::State)
    }
}
