//! WebSocket relay with room-based store routing.
//!
//! ```text
//! Peer A ──┐
//!          ├── Room (store_id) ── YrsDocument ── BusChannel
//! Peer B ──┘                                        │
//!                                       ┌───────────┼───────────┐
//!                                       ▼           ▼           ▼
//!                                    Peer A      Peer B      Peer C
//! ```
//!
//! Each room keeps an authoritative document so a joining peer receives
//! the full state immediately, plus the latest presence of every peer.
//! Deltas and presence are fanned out to every other peer in the room.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use orbit_core::{Origin, ReplicatedDocument, YrsDocument};

use crate::bus::{BroadcastBus, BusChannel};
use crate::error::ProtocolError;
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, SyncMessage};

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Messages buffered per peer before it starts lagging
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Ephemeral port on loopback.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
}

/// Encoded message fanned out inside a room.
struct Frame {
    sender: Uuid,
    bytes: Vec<u8>,
}

struct Room {
    doc: YrsDocument,
    peers: HashMap<Uuid, SocketAddr>,
    /// Latest encoded awareness message per peer
    presence: HashMap<Uuid, Vec<u8>>,
}

/// Membership of one connection in a room.
struct Membership {
    peer_id: Uuid,
    store_id: String,
    channel: BusChannel<Frame>,
    receiver: broadcast::Receiver<Arc<Frame>>,
}

/// The relay server. Clones share rooms and statistics.
#[derive(Clone)]
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RwLock<HashMap<String, Room>>>,
    bus: BroadcastBus<Frame>,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let bus = BroadcastBus::new(config.broadcast_capacity);
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            bus,
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub async fn bind(&self) -> io::Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener`, one task per connection.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");
            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.handle_connection(stream, addr).await {
                    log::warn!("connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            active_rooms: self.rooms.read().await.len(),
        }
    }

    /// Full state of a room's document, if the room exists.
    pub async fn room_state(&self, store_id: &str) -> Option<Vec<u8>> {
        self.rooms
            .read()
            .await
            .get(store_id)
            .map(|room| room.doc.encode_full_state())
    }

    pub async fn peer_count(&self, store_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(store_id)
            .map_or(0, |room| room.peers.len())
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ProtocolError> {
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, echo_subprotocol)
            .await
            .map_err(|e| ProtocolError::WebSocket(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::debug!("websocket established with {addr}");

        let mut membership: Option<Membership> = None;
        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };
                        let replies = self.handle_message(sync_msg, &data, addr, &mut membership).await;
                        let mut failed = None;
                        for reply in replies {
                            if let Err(e) = ws_sender.send(Message::Binary(reply.into())).await {
                                failed = Some(e);
                                break;
                            }
                        }
                        if let Some(e) = failed {
                            break Err(ProtocolError::WebSocket(e.to_string()));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(ProtocolError::WebSocket(e.to_string())),
                },
                frame = recv_frame(&mut membership) => match frame {
                    Ok(frame) => {
                        let own = membership.as_ref().is_some_and(|m| m.peer_id == frame.sender);
                        if own {
                            continue;
                        }
                        if let Err(e) = ws_sender.send(Message::Binary(frame.bytes.clone().into())).await {
                            break Err(ProtocolError::WebSocket(e.to_string()));
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        if let Some(m) = &membership {
                            m.channel.record_dropped(n);
                            log::warn!("peer {} lagged by {n} messages", m.peer_id);
                        }
                    }
                    Err(RecvError::Closed) => break Ok(()),
                },
            }
        };

        if let Some(m) = membership.take() {
            self.leave(m).await;
        }
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::debug!("connection closed from {addr}");
        result
    }

    /// Process one message; returns frames to send back to the sender.
    async fn handle_message(
        &self,
        msg: SyncMessage,
        raw: &[u8],
        addr: SocketAddr,
        membership: &mut Option<Membership>,
    ) -> Vec<Vec<u8>> {
        match msg.msg_type {
            MessageType::Join => {
                if membership.is_some() {
                    return Vec::new();
                }
                let (joined, replies) = self.join(msg.peer_id, &msg.store_id, addr).await;
                *membership = Some(joined);
                replies
            }
            MessageType::Update | MessageType::State => {
                let Some(m) = membership.as_ref() else {
                    log::debug!("update from {addr} before join ignored");
                    return Vec::new();
                };
                {
                    let rooms = self.rooms.read().await;
                    if let Some(room) = rooms.get(&m.store_id) {
                        if let Err(e) = room.doc.apply_delta(&msg.payload, Origin::Network) {
                            log::warn!("rejecting delta from {}: {e}", m.peer_id);
                            return Vec::new();
                        }
                    }
                }
                // Peers only need deltas; a joined peer already has the state.
                let relayed = match msg.msg_type {
                    MessageType::State => SyncMessage::update(m.peer_id, &m.store_id, msg.payload)
                        .encode()
                        .unwrap_or_default(),
                    _ => raw.to_vec(),
                };
                if !relayed.is_empty() {
                    m.channel.publish(Frame { sender: m.peer_id, bytes: relayed });
                }
                Vec::new()
            }
            MessageType::Awareness => {
                let Some(m) = membership.as_ref() else {
                    return Vec::new();
                };
                match AwarenessMessage::decode(&msg.payload) {
                    Ok(AwarenessMessage::Leave { .. }) => {
                        self.set_presence(&m.store_id, m.peer_id, None).await;
                    }
                    Ok(AwarenessMessage::Update { ref state, .. }) => {
                        log::trace!("presence of {} ({}) in {}", m.peer_id, state.name, m.store_id);
                        self.set_presence(&m.store_id, m.peer_id, Some(raw.to_vec())).await;
                    }
                    Err(e) => {
                        log::warn!("bad awareness payload from {}: {e}", m.peer_id);
                        return Vec::new();
                    }
                }
                m.channel.publish(Frame { sender: m.peer_id, bytes: raw.to_vec() });
                Vec::new()
            }
            MessageType::Leave => {
                if let Some(m) = membership.take() {
                    self.leave(m).await;
                }
                Vec::new()
            }
            MessageType::Ping => SyncMessage::pong(Uuid::nil()).encode().into_iter().collect(),
            MessageType::Pong => Vec::new(),
        }
    }

    async fn join(&self, peer_id: Uuid, store_id: &str, addr: SocketAddr) -> (Membership, Vec<Vec<u8>>) {
        let channel = self.bus.channel(store_id);
        let receiver = channel.subscribe();

        let mut replies = Vec::new();
        {
            let mut rooms = self.rooms.write().await;
            let room = rooms.entry(store_id.to_string()).or_insert_with(|| {
                log::info!("room {store_id} opened");
                Room {
                    doc: YrsDocument::new(),
                    peers: HashMap::new(),
                    presence: HashMap::new(),
                }
            });
            room.peers.insert(peer_id, addr);

            let state = SyncMessage::state(Uuid::nil(), store_id, room.doc.encode_full_state());
            match state.encode() {
                Ok(bytes) => replies.push(bytes),
                Err(e) => log::error!("failed to encode state of {store_id}: {e}"),
            }
            replies.extend(room.presence.values().cloned());
            log::info!("peer {peer_id} joined {store_id} ({} peers)", room.peers.len());
        }

        (
            Membership {
                peer_id,
                store_id: store_id.to_string(),
                channel,
                receiver,
            },
            replies,
        )
    }

    async fn set_presence(&self, store_id: &str, peer_id: Uuid, encoded: Option<Vec<u8>>) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(store_id) {
            match encoded {
                Some(bytes) => {
                    room.presence.insert(peer_id, bytes);
                }
                None => {
                    room.presence.remove(&peer_id);
                }
            }
        }
    }

    async fn leave(&self, membership: Membership) {
        let Membership { peer_id, store_id, channel, receiver } = membership;
        drop(receiver);

        if let Ok(bytes) = SyncMessage::leave(peer_id, &store_id).encode() {
            channel.publish(Frame { sender: peer_id, bytes });
        }
        drop(channel);

        let mut rooms = self.rooms.write().await;
        let empty = match rooms.get_mut(&store_id) {
            Some(room) => {
                room.peers.remove(&peer_id);
                room.presence.remove(&peer_id);
                room.peers.is_empty()
            }
            None => false,
        };
        if empty {
            rooms.remove(&store_id);
            self.bus.remove_if_unused(&store_id);
            log::info!("room {store_id} removed (empty)");
        } else {
            log::info!("peer {peer_id} left {store_id}");
        }
    }
}

/// Accept the first sub-protocol the client offers, if any.
fn echo_subprotocol(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').map(str::trim).find(|p| !p.is_empty()))
        .map(str::to_owned);
    if let Some(protocol) = offered {
        if let Ok(value) = protocol.parse() {
            response.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }
    }
    Ok(response)
}

async fn recv_frame(membership: &mut Option<Membership>) -> Result<Arc<Frame>, RecvError> {
    match membership {
        Some(m) => m.receiver.recv().await,
        None => std::future::pending().await,
    }
}
