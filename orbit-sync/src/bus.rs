//! In-process publish/subscribe bus scoped by topic name.
//!
//! Every topic owns one tokio broadcast channel, so a publish is O(1)
//! regardless of the number of subscribers. Each subscriber buffers up to
//! `capacity` messages; a subscriber that falls further behind loses the
//! oldest messages and is told how many it missed.
//!
//! ```text
//! BroadcastBus ── "orbit-sync:notes" ──► BusChannel ─┬─► Receiver (tab A)
//!              │                                     └─► Receiver (tab B)
//!              └─ "orbit-sync:todo"  ──► BusChannel ───► Receiver (tab C)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;

use crate::lock;

/// Default number of messages buffered per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Statistics for one topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers: usize,
}

struct Topic<T> {
    sender: broadcast::Sender<Arc<T>>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Registry of topics. Cloning shares the registry.
pub struct BroadcastBus<T> {
    topics: Arc<Mutex<HashMap<String, Arc<Topic<T>>>>>,
    capacity: usize,
}

impl<T> Clone for BroadcastBus<T> {
    fn clone(&self) -> Self {
        Self {
            topics: self.topics.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: Send + Sync + 'static> Default for BroadcastBus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl<T: Send + Sync + 'static> BroadcastBus<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Get or create the channel for `topic`.
    pub fn channel(&self, topic: &str) -> BusChannel<T> {
        let mut topics = lock(&self.topics);
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(self.capacity);
                log::debug!("bus topic opened: {topic}");
                Arc::new(Topic {
                    sender,
                    messages_sent: AtomicU64::new(0),
                    messages_dropped: AtomicU64::new(0),
                })
            })
            .clone();
        BusChannel {
            name: topic.to_string(),
            topic: entry,
        }
    }

    /// Close `topic` if no `BusChannel` handle refers to it any more.
    pub fn remove_if_unused(&self, topic: &str) -> bool {
        let mut topics = lock(&self.topics);
        let unused = topics
            .get(topic)
            .is_some_and(|t| Arc::strong_count(t) == 1);
        if unused {
            topics.remove(topic);
            log::debug!("bus topic closed: {topic}");
        }
        unused
    }

    pub fn topic_count(&self) -> usize {
        lock(&self.topics).len()
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        lock(&self.topics).contains_key(topic)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Handle on one topic of a [`BroadcastBus`].
pub struct BusChannel<T> {
    name: String,
    topic: Arc<Topic<T>>,
}

impl<T> Clone for BusChannel<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            topic: self.topic.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> BusChannel<T> {
    /// Publish to every current subscriber, including the publisher's own.
    ///
    /// Returns the number of subscribers reached; zero when nobody listens.
    pub fn publish(&self, message: T) -> usize {
        let count = self.topic.sender.send(Arc::new(message)).unwrap_or(0);
        self.topic.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<T>> {
        self.topic.sender.subscribe()
    }

    /// Record messages a lagging subscriber missed.
    pub fn record_dropped(&self, count: u64) {
        self.topic.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            messages_sent: self.topic.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.topic.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.topic.sender.receiver_count(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle that does not keep the topic open.
    pub fn downgrade(&self) -> WeakBusChannel<T> {
        WeakBusChannel {
            topic: Arc::downgrade(&self.topic),
        }
    }
}

/// Non-owning handle for background receivers.
pub struct WeakBusChannel<T> {
    topic: Weak<Topic<T>>,
}

impl<T> WeakBusChannel<T> {
    /// Record missed messages; `false` once the topic is closed.
    pub fn record_dropped(&self, count: u64) -> bool {
        match self.topic.upgrade() {
            Some(topic) => {
                topic.messages_dropped.fetch_add(count, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus: BroadcastBus<String> = BroadcastBus::new(16);
        let channel = bus.channel("room");
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        assert_eq!(channel.publish("hi".to_string()), 2);
        assert_eq!(*a.recv().await.unwrap(), "hi");
        assert_eq!(*b.recv().await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus: BroadcastBus<u32> = BroadcastBus::new(16);
        let one = bus.channel("one");
        let two = bus.channel("two");
        let mut rx_two = two.subscribe();

        one.publish(1);
        two.publish(2);
        assert_eq!(*rx_two.recv().await.unwrap(), 2);
        assert!(rx_two.try_recv().is_err());
    }

    #[test]
    fn test_same_topic_shares_channel() {
        let bus: BroadcastBus<u32> = BroadcastBus::default();
        let a = bus.channel("shared");
        let b = bus.clone().channel("shared");
        let _rx = a.subscribe();

        assert_eq!(b.publish(7), 1);
        assert_eq!(a.stats().messages_sent, 1);
        assert_eq!(bus.topic_count(), 1);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus: BroadcastBus<u32> = BroadcastBus::default();
        let channel = bus.channel("empty");
        assert_eq!(channel.publish(1), 0);
        assert_eq!(channel.stats().subscribers, 0);
    }

    #[test]
    fn test_remove_if_unused() {
        let bus: BroadcastBus<u32> = BroadcastBus::default();
        let channel = bus.channel("t");
        let copy = channel.clone();

        assert!(!bus.remove_if_unused("t"));
        drop(channel);
        assert!(!bus.remove_if_unused("t"));
        drop(copy);
        assert!(bus.remove_if_unused("t"));
        assert!(!bus.has_topic("t"));
        assert!(!bus.remove_if_unused("t"));
    }

    #[test]
    fn test_weak_handle_does_not_keep_topic() {
        let bus: BroadcastBus<u32> = BroadcastBus::default();
        let channel = bus.channel("w");
        let weak = channel.downgrade();

        assert!(weak.record_dropped(2));
        assert_eq!(channel.stats().messages_dropped, 2);
        drop(channel);
        assert!(bus.remove_if_unused("w"));
        assert!(!weak.record_dropped(1));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_reports_missed() {
        let bus: BroadcastBus<u32> = BroadcastBus::new(2);
        let channel = bus.channel("lag");
        let mut rx = channel.subscribe();
        for i in 0..5 {
            channel.publish(i);
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                channel.record_dropped(n);
                assert_eq!(n, 3);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(channel.stats().messages_dropped, 3);
    }
}
