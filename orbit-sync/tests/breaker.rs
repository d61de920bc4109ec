//! Circuit breaker and network echo suppression, driven by a scripted
//! channel instead of a real socket.

use orbit_sync::orbit_core::{Origin, ReplicatedDocument, YrsDocument};
use orbit_sync::{
    BroadcastBus, ChannelEvent, ConnectionStatus, Coordinator, CoordinatorConfig, NetworkChannel,
    NetworkOptions, PresenceState, StatusListener,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

struct MockChannel {
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    auto_reconnect: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    destroyed: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MockChannel {
    fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            auto_reconnect: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn emit(&self, event: ChannelEvent) {
        self.events_tx.send(event).unwrap();
    }

    fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

impl NetworkChannel for MockChannel {
    fn connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus::Disconnected
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    fn send_update(&self, update: Vec<u8>) -> bool {
        self.sent.lock().unwrap().push(update);
        true
    }

    fn presence(&self) -> HashMap<Uuid, PresenceState> {
        HashMap::new()
    }

    fn set_local_presence(&self, _state: Option<PresenceState>) {}
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn recording_listener() -> (StatusListener, Arc<Mutex<Vec<ConnectionStatus>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener: StatusListener = Arc::new(move |status| sink.lock().unwrap().push(status));
    (listener, seen)
}

async fn coordinator_with(channel: Arc<MockChannel>, store_id: &str) -> Coordinator {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = CoordinatorConfig::new(store_id)
        .with_tab_bus(BroadcastBus::new(16))
        .with_network_options(NetworkOptions {
            max_failures: 3,
            ..NetworkOptions::default()
        })
        .with_network_channel(channel);
    let coordinator = Coordinator::new(config).unwrap();
    coordinator.initialize().await.unwrap();
    coordinator
}

#[tokio::test]
async fn test_breaker_trips_after_max_failures() {
    let channel = MockChannel::new();
    let coordinator = coordinator_with(channel.clone(), "breaker").await;
    let (listener, seen) = recording_listener();
    coordinator.on_status_change(listener);
    assert_eq!(channel.connects.load(Ordering::SeqCst), 1);

    for i in 0..3 {
        channel.emit(ChannelEvent::ConnectionError(format!("refused #{i}")));
    }
    settle().await;

    assert_eq!(coordinator.failure_count(), 3);
    assert!(!channel.auto_reconnect());
    assert_eq!(channel.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(channel.connects.load(Ordering::SeqCst), 1, "no automatic retry after tripping");
    assert_eq!(coordinator.status(), ConnectionStatus::Disconnected);
    assert_eq!(*seen.lock().unwrap(), vec![ConnectionStatus::Disconnected]);

    // Further errors do not trip again.
    channel.emit(ChannelEvent::ConnectionError("still down".into()));
    settle().await;
    assert_eq!(channel.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_breaker_stays_closed_below_threshold() {
    let channel = MockChannel::new();
    let coordinator = coordinator_with(channel.clone(), "below").await;

    channel.emit(ChannelEvent::ConnectionError("one".into()));
    channel.emit(ChannelEvent::ConnectionError("two".into()));
    settle().await;

    assert_eq!(coordinator.failure_count(), 2);
    assert!(channel.auto_reconnect());
    assert_eq!(channel.disconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_manual_reconnect_resets_failures() {
    let channel = MockChannel::new();
    let coordinator = coordinator_with(channel.clone(), "manual").await;
    let (listener, seen) = recording_listener();
    coordinator.on_status_change(listener);

    for _ in 0..3 {
        channel.emit(ChannelEvent::ConnectionError("down".into()));
    }
    settle().await;
    assert!(!channel.auto_reconnect());

    assert!(coordinator.reconnect());
    assert_eq!(channel.connects.load(Ordering::SeqCst), 2);
    assert!(!channel.auto_reconnect(), "manual reconnect is a single attempt");

    channel.emit(ChannelEvent::Status(ConnectionStatus::Connecting));
    channel.emit(ChannelEvent::Status(ConnectionStatus::Connected));
    settle().await;

    assert_eq!(coordinator.failure_count(), 0);
    assert_eq!(coordinator.status(), ConnectionStatus::Connected);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
        ]
    );
}

#[tokio::test]
async fn test_connected_pushes_full_state() {
    let channel = MockChannel::new();
    let coordinator = coordinator_with(channel.clone(), "catch-up").await;
    coordinator.replace_text("body", "written offline").unwrap();
    let before = channel.sent().len();

    channel.emit(ChannelEvent::Status(ConnectionStatus::Connected));
    settle().await;

    let sent = channel.sent();
    assert_eq!(sent.len(), before + 1);
    let remote = YrsDocument::new();
    remote.apply_delta(sent.last().unwrap(), Origin::Network).unwrap();
    assert_eq!(remote.text_content("body"), "written offline");
}

#[tokio::test]
async fn test_network_updates_are_not_echoed() {
    let channel = MockChannel::new();
    let coordinator = coordinator_with(channel.clone(), "echo").await;

    coordinator.replace_text("body", "local").unwrap();
    assert_eq!(channel.sent().len(), 1, "local writes go out");

    let remote = YrsDocument::new();
    remote.replace_text("other", "remote", Origin::Local).unwrap();
    channel.emit(ChannelEvent::Update(remote.encode_full_state()));
    settle().await;

    assert_eq!(coordinator.document().text_content("other"), "remote");
    assert_eq!(channel.sent().len(), 1, "network deltas are not sent back");
}

#[tokio::test]
async fn test_dispose_destroys_channel() {
    let channel = MockChannel::new();
    let coordinator = coordinator_with(channel.clone(), "teardown").await;
    coordinator.dispose().await.unwrap();

    assert!(channel.destroyed.load(Ordering::SeqCst));
    assert!(!channel.auto_reconnect());
    assert!(!coordinator.reconnect());
    assert_eq!(coordinator.status(), ConnectionStatus::Disconnected);
}
