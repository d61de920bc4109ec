//! Same-device replication between coordinators sharing a bus.
//!
//! ```text
//!  doc change (origin != Tab(self)) ──► publish TabMessage ──► bus topic
//!                                                                 │
//!  apply_delta(.., Tab(self)) ◄── filter store_id / sender ◄──────┘
//! ```
//!
//! Deltas applied from the bus carry `Origin::Tab(self)` and are therefore
//! never published again by the same instance.

use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use orbit_core::{DocumentError, Origin, ReplicatedDocument};

use crate::bus::{BroadcastBus, BusChannel, WeakBusChannel};
use crate::lock;

/// Prefix of every tab bus topic; the store id follows.
pub const TAB_TOPIC_PREFIX: &str = "orbit-sync:";

/// Message exchanged between same-device coordinators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabMessage {
    pub store_id: String,
    pub sender: Uuid,
    pub update: Vec<u8>,
}

/// Topic name for a store.
pub fn topic_for(store_id: &str) -> String {
    format!("{TAB_TOPIC_PREFIX}{store_id}")
}

/// Process-wide tab bus used when no bus is configured explicitly.
pub fn global_bus() -> BroadcastBus<TabMessage> {
    static BUS: OnceLock<BroadcastBus<TabMessage>> = OnceLock::new();
    BUS.get_or_init(BroadcastBus::default).clone()
}

struct Active<D: ReplicatedDocument> {
    subscription: D::Subscription,
    channel: BusChannel<TabMessage>,
    task: JoinHandle<()>,
}

/// Tab broadcast replication for one document.
pub struct TabBroadcastSync<D: ReplicatedDocument> {
    store_id: String,
    instance_id: Uuid,
    bus: BroadcastBus<TabMessage>,
    active: Mutex<Option<Active<D>>>,
}

impl<D: ReplicatedDocument> TabBroadcastSync<D> {
    pub fn new(store_id: impl Into<String>, bus: BroadcastBus<TabMessage>) -> Self {
        Self {
            store_id: store_id.into(),
            instance_id: Uuid::new_v4(),
            bus,
            active: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn origin(&self) -> Origin {
        Origin::Tab(self.instance_id)
    }

    pub fn is_active(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Start replicating `doc`. A second call while active is a no-op.
    pub fn activate(&self, runtime: &Handle, doc: &Arc<D>) -> Result<(), DocumentError> {
        let mut active = lock(&self.active);
        if active.is_some() {
            return Ok(());
        }

        let topic = topic_for(&self.store_id);
        let channel = self.bus.channel(&topic);
        let receiver = channel.subscribe();

        let publisher = channel.clone();
        let store_id = self.store_id.clone();
        let instance = self.instance_id;
        let own_origin = self.origin();
        let subscription = doc.on_change(move |delta, origin| {
            if *origin == own_origin {
                return;
            }
            let reached = publisher.publish(TabMessage {
                store_id: store_id.clone(),
                sender: instance,
                update: delta.to_vec(),
            });
            // The publisher's own receiver counts as one.
            if reached <= 1 {
                log::debug!("tab update on {} had no other listeners", publisher.name());
            }
        })?;

        let task = runtime.spawn(receive_loop(
            receiver,
            channel.downgrade(),
            Arc::downgrade(doc),
            self.store_id.clone(),
            instance,
        ));

        log::debug!("tab sync active on {topic} as {instance}");
        *active = Some(Active { subscription, channel, task });
        Ok(())
    }

    /// Stop replicating and close the bus channel. Safe to call repeatedly.
    pub fn deactivate(&self) {
        let Some(active) = lock(&self.active).take() else {
            return;
        };
        drop(active.subscription);
        active.task.abort();
        drop(active.channel);
        self.bus.remove_if_unused(&topic_for(&self.store_id));
        log::debug!("tab sync deactivated for {}", self.store_id);
    }
}

impl<D: ReplicatedDocument> Drop for TabBroadcastSync<D> {
    fn drop(&mut self) {
        self.deactivate();
    }
}

async fn receive_loop<D: ReplicatedDocument>(
    mut receiver: tokio::sync::broadcast::Receiver<Arc<TabMessage>>,
    channel: WeakBusChannel<TabMessage>,
    doc: Weak<D>,
    store_id: String,
    instance: Uuid,
) {
    loop {
        let message = match receiver.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(missed)) => {
                log::warn!("tab receiver for {store_id} lagged, missed {missed} updates");
                channel.record_dropped(missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if message.sender == instance || message.store_id != store_id {
            continue;
        }
        let Some(doc) = doc.upgrade() else {
            break;
        };
        if let Err(e) = doc.apply_delta(&message.update, Origin::Tab(instance)) {
            log::warn!("dropping tab update for {store_id}: {e}");
        }
    }
}
