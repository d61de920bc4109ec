//! Presence: who else is looking at a store, and where their cursor is.
//!
//! ```text
//! set_local_presence()
//!       │
//!       ▼
//! AwarenessMessage::Update ──► relay ──► remote PresenceTable::handle()
//! ```
//!
//! Presence is ephemeral. It is never written into the replicated
//! document and never persisted.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Default idle timeout after which silent peers are dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Cursor or selection inside a named text. Offsets are char indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextCursor {
    pub text: String,
    pub anchor: u32,
    pub head: u32,
}

impl TextCursor {
    pub fn caret(text: impl Into<String>, at: u32) -> Self {
        Self { text: text.into(), anchor: at, head: at }
    }

    pub fn is_selection(&self) -> bool {
        self.anchor != self.head
    }
}

/// Presence state published by one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub name: String,
    /// RGBA color for cursor rendering
    pub color: [f32; 4],
    pub cursor: Option<TextCursor>,
    /// Free-form application fields
    pub fields: BTreeMap<String, String>,
}

impl PresenceState {
    /// Presence with a stable color derived from `peer_id`.
    pub fn for_peer(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color_for(peer_id),
            cursor: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_cursor(mut self, cursor: TextCursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Stable, well-separated color for a peer.
///
/// The hue comes from the id; saturation and lightness are fixed so every
/// color stays readable.
pub fn color_for(peer_id: Uuid) -> [f32; 4] {
    let hash = peer_id.as_u128();
    let hue = ((hash & 0xFFFF) as f32) / 65535.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    [r, g, b, 1.0]
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Presence messages carried inside `SyncMessage` awareness payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full presence state of a peer (sent on join and on every change).
    Update { peer_id: Uuid, state: PresenceState },
    /// Peer cleared its presence or disconnected.
    Leave { peer_id: Uuid },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn peer_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Update { peer_id, .. } => *peer_id,
            AwarenessMessage::Leave { peer_id } => *peer_id,
        }
    }
}

#[derive(Debug, Clone)]
struct RemotePeer {
    state: PresenceState,
    last_seen: Instant,
}

/// Remote peers' presence, keyed by peer id.
#[derive(Debug)]
pub struct PresenceTable {
    local_peer: Uuid,
    peers: HashMap<Uuid, RemotePeer>,
    idle_timeout: Duration,
}

impl PresenceTable {
    pub fn new(local_peer: Uuid) -> Self {
        Self::with_idle_timeout(local_peer, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(local_peer: Uuid, idle_timeout: Duration) -> Self {
        Self {
            local_peer,
            peers: HashMap::new(),
            idle_timeout,
        }
    }

    /// Apply an incoming presence message. Returns whether the table changed.
    pub fn handle(&mut self, msg: &AwarenessMessage) -> bool {
        if msg.peer_id() == self.local_peer {
            return false;
        }
        match msg {
            AwarenessMessage::Update { peer_id, state } => {
                let changed = self.peers.get(peer_id).map_or(true, |p| p.state != *state);
                self.peers.insert(
                    *peer_id,
                    RemotePeer { state: state.clone(), last_seen: Instant::now() },
                );
                changed
            }
            AwarenessMessage::Leave { peer_id } => self.remove(peer_id),
        }
    }

    pub fn remove(&mut self, peer_id: &Uuid) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    /// Drop peers that have been silent for longer than the idle timeout.
    pub fn cleanup_idle(&mut self) -> Vec<Uuid> {
        let timeout = self.idle_timeout;
        let idle: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &idle {
            self.peers.remove(id);
        }
        idle
    }

    pub fn get(&self, peer_id: &Uuid) -> Option<&PresenceState> {
        self.peers.get(peer_id).map(|p| &p.state)
    }

    pub fn snapshot(&self) -> HashMap<Uuid, PresenceState> {
        self.peers
            .iter()
            .map(|(id, p)| (*id, p.state.clone()))
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn local_peer(&self) -> Uuid {
        self.local_peer
    }
}
