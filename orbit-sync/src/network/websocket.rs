//! WebSocket implementation of [`NetworkChannel`].
//!
//! One background task owns the socket. It connects, announces the peer
//! with `Join` (plus presence), then multiplexes incoming frames and the
//! outgoing queue until the socket closes. On failure it backs off and
//! retries while auto-reconnect is enabled.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use super::{backoff_delay, ChannelEvent, NetworkChannel};
use crate::config::NetworkOptions;
use crate::error::ProtocolError;
use crate::lock;
use crate::presence::{AwarenessMessage, PresenceState, PresenceTable};
use crate::protocol::{MessageType, SyncMessage};
use crate::status::ConnectionStatus;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Shared {
    url: String,
    store_id: String,
    peer_id: Uuid,
    options: NetworkOptions,
    status: Mutex<ConnectionStatus>,
    auto_reconnect: AtomicBool,
    destroyed: AtomicBool,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    presence: Mutex<PresenceTable>,
    local_presence: Mutex<Option<PresenceState>>,
}

impl Shared {
    fn emit(&self, event: ChannelEvent) {
        // The receiver is gone once the owner shut down.
        let _ = self.events_tx.send(event);
    }

    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut current = lock(&self.status);
            if *current == status {
                return;
            }
            *current = status;
        }
        log::debug!("channel {} -> {status}", self.url);
        self.emit(ChannelEvent::Status(status));
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn enqueue(&self, msg: &SyncMessage) -> bool {
        let encoded = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("failed to encode {:?}: {e}", msg.msg_type);
                return false;
            }
        };
        match lock(&self.outgoing).as_ref() {
            Some(tx) => tx.send(encoded).is_ok(),
            None => false,
        }
    }

    fn presence_message(&self) -> Option<SyncMessage> {
        let message = match lock(&self.local_presence).clone() {
            Some(state) => AwarenessMessage::Update { peer_id: self.peer_id, state },
            None => return None,
        };
        match SyncMessage::awareness(self.peer_id, &self.store_id, &message) {
            Ok(msg) => Some(msg),
            Err(e) => {
                log::warn!("failed to encode presence: {e}");
                None
            }
        }
    }

    fn handle_frame(&self, data: &[u8]) {
        let msg = match SyncMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("dropping undecodable frame: {e}");
                return;
            }
        };
        if msg.peer_id == self.peer_id {
            return;
        }
        match msg.msg_type {
            MessageType::Update | MessageType::State => {
                self.emit(ChannelEvent::Update(msg.payload));
            }
            MessageType::Awareness => match msg.awareness_message() {
                Ok(awareness) => {
                    lock(&self.presence).handle(&awareness);
                }
                Err(e) => log::warn!("bad awareness payload from {}: {e}", msg.peer_id),
            },
            MessageType::Leave => {
                lock(&self.presence).remove(&msg.peer_id);
            }
            MessageType::Ping => {
                self.enqueue(&SyncMessage::pong(self.peer_id));
            }
            MessageType::Join | MessageType::Pong => {}
        }
    }

    fn reset_connection(&self) {
        *lock(&self.outgoing) = None;
        lock(&self.presence).clear();
    }
}

/// Reconnecting WebSocket channel to a relay.
pub struct WebSocketChannel {
    shared: Arc<Shared>,
}

impl WebSocketChannel {
    /// Create a disconnected channel. No I/O happens until `connect`.
    pub fn new(url: impl Into<String>, store_id: impl Into<String>, options: NetworkOptions) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer_id = Uuid::new_v4();
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                store_id: store_id.into(),
                peer_id,
                options,
                status: Mutex::new(ConnectionStatus::Disconnected),
                auto_reconnect: AtomicBool::new(true),
                destroyed: AtomicBool::new(false),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                outgoing: Mutex::new(None),
                task: Mutex::new(None),
                presence: Mutex::new(PresenceTable::new(peer_id)),
                local_presence: Mutex::new(None),
            }),
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.shared.peer_id
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }
}

impl NetworkChannel for WebSocketChannel {
    fn connect(&self) {
        if self.shared.is_destroyed() {
            return;
        }
        let mut task = lock(&self.shared.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                log::error!("cannot connect to {} outside a tokio runtime: {e}", self.shared.url);
                return;
            }
        };
        *task = Some(runtime.spawn(run(self.shared.clone())));
    }

    fn disconnect(&self) {
        if let Some(task) = lock(&self.shared.task).take() {
            task.abort();
        }
        self.shared.reset_connection();
        self.shared.set_status(ConnectionStatus::Disconnected);
    }

    fn destroy(&self) {
        self.shared.destroyed.store(true, Ordering::SeqCst);
        self.shared.auto_reconnect.store(false, Ordering::SeqCst);
        self.disconnect();
    }

    fn set_auto_reconnect(&self, enabled: bool) {
        self.shared.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    fn auto_reconnect(&self) -> bool {
        self.shared.auto_reconnect.load(Ordering::SeqCst)
    }

    fn status(&self) -> ConnectionStatus {
        *lock(&self.shared.status)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        lock(&self.shared.events_rx).take()
    }

    fn send_update(&self, update: Vec<u8>) -> bool {
        let msg = SyncMessage::update(self.shared.peer_id, &self.shared.store_id, update);
        let sent = self.shared.enqueue(&msg);
        if !sent {
            log::debug!("update dropped, {} not connected", self.shared.url);
        }
        sent
    }

    fn presence(&self) -> HashMap<Uuid, PresenceState> {
        lock(&self.shared.presence).snapshot()
    }

    fn set_local_presence(&self, state: Option<PresenceState>) {
        let cleared = state.is_none();
        *lock(&self.shared.local_presence) = state;
        if cleared {
            let leave = AwarenessMessage::Leave { peer_id: self.shared.peer_id };
            if let Ok(msg) = SyncMessage::awareness(self.shared.peer_id, &self.shared.store_id, &leave) {
                self.shared.enqueue(&msg);
            }
        } else if let Some(msg) = self.shared.presence_message() {
            self.shared.enqueue(&msg);
        }
    }
}

async fn open(shared: &Shared) -> Result<WsStream, ProtocolError> {
    let mut request = shared
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ProtocolError::WebSocket(e.to_string()))?;
    if !shared.options.protocols.is_empty() {
        let value = HeaderValue::from_str(&shared.options.protocols.join(", "))
            .map_err(|e| ProtocolError::WebSocket(e.to_string()))?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }

    let timeout = Duration::from_millis(shared.options.connect_timeout_ms);
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)).await {
        Err(_) => Err(ProtocolError::Timeout),
        Ok(Err(e)) => Err(ProtocolError::WebSocket(e.to_string())),
        Ok(Ok((stream, _response))) => Ok(stream),
    }
}

async fn run(shared: Arc<Shared>) {
    let mut attempt: u32 = 0;
    loop {
        if shared.is_destroyed() {
            break;
        }
        shared.set_status(ConnectionStatus::Connecting);

        match open(&shared).await {
            Ok(stream) => {
                attempt = 0;
                log::info!("connected to {} as {}", shared.url, shared.peer_id);
                serve(&shared, stream).await;
                shared.reset_connection();
                shared.set_status(ConnectionStatus::Disconnected);
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                log::warn!("connection to {} failed (attempt {attempt}): {e}", shared.url);
                shared.emit(ChannelEvent::ConnectionError(e.to_string()));
                shared.set_status(ConnectionStatus::Disconnected);
            }
        }

        if !shared.auto_reconnect.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(backoff_delay(&shared.options, attempt)).await;
        if !shared.auto_reconnect.load(Ordering::SeqCst) {
            break;
        }
    }
}

async fn serve(shared: &Arc<Shared>, stream: WsStream) {
    let (mut writer, mut reader) = stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    *lock(&shared.outgoing) = Some(out_tx);

    shared.enqueue(&SyncMessage::join(shared.peer_id, &shared.store_id));
    if let Some(msg) = shared.presence_message() {
        shared.enqueue(&msg);
    }
    shared.set_status(ConnectionStatus::Connected);

    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(Message::Binary(data))) => shared.handle_frame(&data),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("read from {} failed: {e}", shared.url);
                    break;
                }
            },
            outgoing = out_rx.recv() => match outgoing {
                Some(bytes) => {
                    if let Err(e) = writer.send(Message::Binary(bytes.into())).await {
                        log::debug!("write to {} failed: {e}", shared.url);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = writer.close().await;
    log::info!("disconnected from {}", shared.url);
}
