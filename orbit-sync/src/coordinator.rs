//! Synchronization coordinator.
//!
//! Owns one replicated document and multiplexes it across up to three
//! channels. Every inbound delta is applied under the origin of the
//! channel it came from, so no channel ever receives its own echo.
//!
//! ```text
//!                       ┌──────────────────────┐
//!   consumer writes ──► │   ReplicatedDocument │
//!                       └──────────┬───────────┘
//!                        on_change │ (delta, origin)
//!            ┌─────────────────────┼──────────────────────┐
//!            ▼                     ▼                      ▼
//!   DebouncedTask ──► save   TabBroadcastSync      NetworkChannel
//!   (any origin)             (origin != Tab(self)) (origin != Network)
//! ```
//!
//! Connection errors feed a circuit breaker: after `max_failures`
//! consecutive errors auto-reconnect is switched off, the channel is
//! disconnected, and status listeners see `Disconnected`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, OnceCell};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use orbit_core::{Origin, ReplicatedDocument, TextEdit, YrsDocument};

use crate::config::CoordinatorConfig;
use crate::debounce::DebouncedTask;
use crate::error::SyncError;
use crate::lock;
use crate::network::{ChannelEvent, NetworkChannel, WebSocketChannel};
use crate::presence::PresenceState;
use crate::status::{ConnectionStatus, StatusListener, StatusListeners};
use crate::storage::StorageAdapter;
use crate::tab::{self, TabBroadcastSync};

struct Inner<D: ReplicatedDocument> {
    store_id: String,
    doc: Arc<D>,
    storage: Option<Arc<dyn StorageAdapter>>,
    persist_timer: DebouncedTask,
    /// Serializes encode + save so an older snapshot never lands last
    flush_lock: AsyncMutex<()>,
    /// Persisted state has been merged into the document
    loaded: OnceCell<()>,
    initialized: OnceCell<()>,
    disposed: AtomicBool,
    tab: Option<TabBroadcastSync<D>>,
    network: Option<Arc<dyn NetworkChannel>>,
    status: Mutex<ConnectionStatus>,
    failures: AtomicU32,
    max_failures: u32,
    listeners: StatusListeners,
    subscriptions: Mutex<Vec<D::Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns a replicated document and keeps it in sync with storage, other
/// tabs, and the network.
pub struct Coordinator<D: ReplicatedDocument = YrsDocument> {
    inner: Arc<Inner<D>>,
}

impl Coordinator<YrsDocument> {
    /// Create a coordinator over a fresh `yrs` document. Performs no I/O.
    pub fn new(config: CoordinatorConfig) -> Result<Self, SyncError> {
        Self::with_document(config, YrsDocument::new())
    }
}

impl<D: ReplicatedDocument> Coordinator<D> {
    /// Create a coordinator over `doc`. Performs no I/O; a configured
    /// network channel starts disconnected.
    pub fn with_document(config: CoordinatorConfig, doc: D) -> Result<Self, SyncError> {
        config.validate()?;
        let CoordinatorConfig {
            store_id,
            enable_tab_sync,
            persist_debounce_ms,
            network_url,
            network: options,
            storage,
            tab_bus,
            network_channel,
        } = config;

        let tab = enable_tab_sync.then(|| {
            TabBroadcastSync::new(store_id.clone(), tab_bus.unwrap_or_else(tab::global_bus))
        });
        let network: Option<Arc<dyn NetworkChannel>> = match (network_channel, network_url) {
            (Some(channel), _) => Some(channel),
            (None, Some(url)) => Some(Arc::new(WebSocketChannel::new(
                url,
                store_id.clone(),
                options.clone(),
            ))),
            (None, None) => None,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                store_id,
                doc: Arc::new(doc),
                storage,
                persist_timer: DebouncedTask::new(std::time::Duration::from_millis(
                    persist_debounce_ms,
                )),
                flush_lock: AsyncMutex::new(()),
                loaded: OnceCell::new(),
                initialized: OnceCell::new(),
                disposed: AtomicBool::new(false),
                tab,
                network,
                status: Mutex::new(ConnectionStatus::Disconnected),
                failures: AtomicU32::new(0),
                max_failures: options.max_failures,
                listeners: StatusListeners::new(),
                subscriptions: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Load persisted state, then wire persistence, tab sync and network.
    ///
    /// Idempotent: concurrent and repeated calls share one initialization.
    /// A failed initialization may be retried.
    pub async fn initialize(&self) -> Result<(), SyncError> {
        if self.inner.is_disposed() {
            return Err(SyncError::Disposed);
        }
        let inner = self.inner.clone();
        self.inner
            .initialized
            .get_or_try_init(|| async move { inner.run_initialize().await })
            .await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.initialized()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub fn store_id(&self) -> &str {
        &self.inner.store_id
    }

    /// Borrow the document, e.g. to open a write transaction.
    pub fn document(&self) -> &D {
        &self.inner.doc
    }

    /// Handle to a named map. Fails with `Disposed` after `dispose`.
    pub fn map(&self, name: &str) -> Result<D::Map, SyncError> {
        self.ensure_live()?;
        Ok(self.inner.doc.map(name))
    }

    pub fn text(&self, name: &str) -> Result<D::Text, SyncError> {
        self.ensure_live()?;
        Ok(self.inner.doc.text(name))
    }

    pub fn sequence(&self, name: &str) -> Result<D::Sequence, SyncError> {
        self.ensure_live()?;
        Ok(self.inner.doc.sequence(name))
    }

    fn ensure_live(&self) -> Result<(), SyncError> {
        if self.inner.is_disposed() {
            return Err(SyncError::Disposed);
        }
        Ok(())
    }

    /// Replace a named text with `new_text` using the minimal edit.
    pub fn replace_text(&self, name: &str, new_text: &str) -> Result<Option<TextEdit>, SyncError> {
        Ok(self.inner.doc.replace_text(name, new_text, Origin::Local)?)
    }

    /// Save the full state now, cancelling any pending debounced save.
    ///
    /// Before `initialize` the persisted record is merged first, so stored
    /// history is never overwritten by a partial document.
    pub async fn persist(&self) -> Result<(), SyncError> {
        self.ensure_live()?;
        self.inner.persist_timer.cancel();
        self.inner.ensure_loaded().await?;
        self.inner.flush().await
    }

    /// Flush, tear down every channel, destroy the document and dispose
    /// storage. Later calls are no-ops; the first error is returned.
    pub async fn dispose(&self) -> Result<(), SyncError> {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_error: Option<SyncError> = None;

        inner.persist_timer.cancel();
        // A record that failed to load is left untouched.
        let final_save = match inner.ensure_loaded().await {
            Ok(()) => inner.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = final_save {
            log::error!("final persist of {} failed: {e}", inner.store_id);
            first_error = Some(e);
        }

        inner.teardown();
        inner.doc.destroy();

        if let Some(storage) = &inner.storage {
            if let Err(e) = storage.dispose().await {
                first_error = first_error.or(Some(e.into()));
            }
        }

        log::info!("coordinator {} disposed", inner.store_id);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Connection status; always `Disconnected` without a network channel.
    pub fn status(&self) -> ConnectionStatus {
        *lock(&self.inner.status)
    }

    /// Register a status listener. Returns `false` if already registered.
    pub fn on_status_change(&self, listener: StatusListener) -> bool {
        self.inner.listeners.add(listener)
    }

    pub fn off_status_change(&self, listener: &StatusListener) -> bool {
        self.inner.listeners.remove(listener)
    }

    /// Consecutive connection errors since the last successful connect.
    pub fn failure_count(&self) -> u32 {
        self.inner.failures.load(Ordering::SeqCst)
    }

    /// One manual connection attempt. Does not re-enable auto-reconnect
    /// after the breaker has tripped. Returns `false` without a channel.
    pub fn reconnect(&self) -> bool {
        match &self.inner.network {
            Some(network) if !self.inner.is_disposed() => {
                log::info!("manual reconnect of {}", self.inner.store_id);
                network.connect();
                true
            }
            _ => false,
        }
    }

    /// Presence of remote peers, keyed by peer id.
    pub fn presence(&self) -> HashMap<Uuid, PresenceState> {
        self.inner
            .network
            .as_ref()
            .map(|n| n.presence())
            .unwrap_or_default()
    }

    /// Publish or clear this replica's presence on the network channel.
    pub fn set_local_presence(&self, state: Option<PresenceState>) {
        if let Some(network) = &self.inner.network {
            network.set_local_presence(state);
        }
    }

    pub fn has_network(&self) -> bool {
        self.inner.network.is_some()
    }

    pub fn has_pending_persist(&self) -> bool {
        self.inner.persist_timer.is_pending()
    }
}

impl<D: ReplicatedDocument> Inner<D> {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    async fn run_initialize(self: Arc<Self>) -> Result<(), SyncError> {
        let runtime = Handle::current();

        self.ensure_loaded().await?;
        if self.is_disposed() {
            return Err(SyncError::Disposed);
        }

        if self.storage.is_some() {
            let weak = Arc::downgrade(&self);
            let handle = runtime.clone();
            let subscription = self.doc.on_change(move |_delta, _origin| {
                if let Some(inner) = weak.upgrade() {
                    inner.schedule_persist(&handle);
                }
            })?;
            lock(&self.subscriptions).push(subscription);
        }

        if let Some(tab) = &self.tab {
            tab.activate(&runtime, &self.doc)?;
        }

        if let Some(network) = &self.network {
            let outbound = network.clone();
            let subscription = self.doc.on_change(move |delta, origin| {
                if *origin != Origin::Network {
                    outbound.send_update(delta.to_vec());
                }
            })?;
            lock(&self.subscriptions).push(subscription);

            if let Some(events) = network.take_events() {
                let task = runtime.spawn(network_events(Arc::downgrade(&self), events));
                lock(&self.tasks).push(task);
            }
            network.connect();
        }

        log::info!("coordinator {} initialized", self.store_id);
        Ok(())
    }

    /// Merge the persisted record once, before anything is saved.
    async fn ensure_loaded(&self) -> Result<(), SyncError> {
        self.loaded
            .get_or_try_init(|| async {
                if let Some(storage) = &self.storage {
                    if let Some(blob) = storage.load(&self.store_id).await? {
                        self.doc.apply_delta(&blob, Origin::Storage)?;
                        log::info!("loaded {} bytes for {}", blob.len(), self.store_id);
                    }
                }
                Ok::<(), SyncError>(())
            })
            .await?;
        Ok(())
    }

    fn schedule_persist(self: &Arc<Self>, runtime: &Handle) {
        if self.is_disposed() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        self.persist_timer.schedule(runtime, async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.is_disposed() {
                return;
            }
            if let Err(e) = inner.flush().await {
                log::error!("background persist of {} failed: {e}", inner.store_id);
            }
        });
    }

    async fn flush(&self) -> Result<(), SyncError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        // Encode under the lock: a save still in flight finishes first, then
        // the newest state is written.
        let _guard = self.flush_lock.lock().await;
        let state = self.doc.encode_full_state();
        storage.save(&self.store_id, &state).await?;
        log::debug!("persisted {} ({} bytes)", self.store_id, state.len());
        Ok(())
    }

    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut current = lock(&self.status);
            if *current == status {
                return;
            }
            *current = status;
        }
        self.listeners.notify(status);
    }

    fn handle_network_event(&self, event: ChannelEvent) {
        if self.is_disposed() {
            return;
        }
        let Some(network) = &self.network else {
            return;
        };
        match event {
            ChannelEvent::Status(ConnectionStatus::Connected) => {
                self.failures.store(0, Ordering::SeqCst);
                // Edits made offline and loaded history reach the peer.
                network.send_update(self.doc.encode_full_state());
                self.set_status(ConnectionStatus::Connected);
            }
            ChannelEvent::Status(status) => self.set_status(status),
            ChannelEvent::ConnectionError(reason) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                log::warn!(
                    "{}: connection error {failures}/{}: {reason}",
                    self.store_id,
                    self.max_failures
                );
                if failures >= self.max_failures && network.auto_reconnect() {
                    self.trip_breaker(network.as_ref(), failures);
                }
            }
            ChannelEvent::Update(delta) => {
                if let Err(e) = self.doc.apply_delta(&delta, Origin::Network) {
                    log::warn!("dropping network update for {}: {e}", self.store_id);
                }
            }
        }
    }

    fn trip_breaker(&self, network: &dyn NetworkChannel, failures: u32) {
        log::info!(
            "{}: giving up after {failures} connection errors, auto-reconnect disabled",
            self.store_id
        );
        network.set_auto_reconnect(false);
        network.disconnect();
        *lock(&self.status) = ConnectionStatus::Disconnected;
        self.listeners.notify(ConnectionStatus::Disconnected);
    }

    /// Drop subscriptions and stop every background activity.
    fn teardown(&self) {
        self.persist_timer.cancel();
        lock(&self.subscriptions).clear();
        if let Some(tab) = &self.tab {
            tab.deactivate();
        }
        if let Some(network) = &self.network {
            network.set_auto_reconnect(false);
            network.destroy();
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        *lock(&self.status) = ConnectionStatus::Disconnected;
    }
}

impl<D: ReplicatedDocument> Drop for Inner<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn network_events<D: ReplicatedDocument>(
    inner: Weak<Inner<D>>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_network_event(event);
    }
}
