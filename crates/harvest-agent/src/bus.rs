//! In-process message bus: per-worker mailboxes, broadcast, and topics.
//!
//! Delivery is FIFO per mailbox. Broadcast fans out in worker registration
//! order; publish fans out in subscription order. Send and receive failures
//! are reported as `false`/`None`, never as errors.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use harvest_core::config::BusConfig;
use harvest_core::message::Message;

/// Receiving half of a mailbox. Requeued messages are served before the
/// channel.
struct Inbox {
    rx: mpsc::UnboundedReceiver<Message>,
    requeued: VecDeque<Message>,
}

impl Inbox {
    async fn next(&mut self) -> Option<Message> {
        match self.requeued.pop_front() {
            Some(message) => Some(message),
            None => self.rx.recv().await,
        }
    }
}

struct Mailbox {
    tx: mpsc::UnboundedSender<Message>,
    inbox: Arc<Mutex<Inbox>>,
    pending: Arc<AtomicUsize>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            inbox: Arc::new(Mutex::new(Inbox {
                rx,
                requeued: VecDeque::new(),
            })),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[derive(Default)]
struct Registry {
    mailboxes: IndexMap<String, Mailbox>,
    topics: IndexMap<String, IndexSet<String>>,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    broadcasts: AtomicU64,
    published: AtomicU64,
}

/// Bus statistics.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BusStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub broadcasts: u64,
    pub published: u64,
    pub active_workers: usize,
    pub topics: usize,
    pub message_log_size: usize,
}

pub struct MessageBus {
    registry: Mutex<Registry>,
    log: Mutex<VecDeque<Message>>,
    log_capacity: usize,
    receive_timeout: Duration,
    counters: Counters,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_config(&BusConfig::default())
    }

    pub fn with_config(config: &BusConfig) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            log: Mutex::new(VecDeque::new()),
            log_capacity: config.message_log_capacity,
            receive_timeout: Duration::from_millis(config.receive_timeout_ms),
            counters: Counters::default(),
        }
    }

    /// Default wait used by mailbox loops polling this bus.
    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    /// Create a mailbox for `worker_id`. Registering twice is a no-op.
    pub async fn register(&self, worker_id: &str) {
        let mut registry = self.registry.lock().await;
        if registry.mailboxes.contains_key(worker_id) {
            return;
        }
        registry
            .mailboxes
            .insert(worker_id.to_string(), Mailbox::new());
        info!(worker = %worker_id, "Registered mailbox");
    }

    /// Drop the worker's mailbox and remove it from every topic.
    pub async fn unregister(&self, worker_id: &str) {
        let mut registry = self.registry.lock().await;
        if registry.mailboxes.shift_remove(worker_id).is_none() {
            return;
        }
        for subscribers in registry.topics.values_mut() {
            subscribers.shift_remove(worker_id);
        }
        info!(worker = %worker_id, "Unregistered mailbox");
    }

    pub async fn is_registered(&self, worker_id: &str) -> bool {
        self.registry.lock().await.mailboxes.contains_key(worker_id)
    }

    /// Worker ids in registration order.
    pub async fn workers(&self) -> Vec<String> {
        self.registry.lock().await.mailboxes.keys().cloned().collect()
    }

    /// Enqueue a message for its receiver.
    ///
    /// Returns `false` without enqueuing when the message has expired or the
    /// receiver has no mailbox.
    pub async fn send(&self, message: Message) -> bool {
        if message.is_expired() {
            debug!(id = %message.id, "Dropping expired message");
            return false;
        }

        {
            let registry = self.registry.lock().await;
            let Some(mailbox) = registry.mailboxes.get(&message.receiver) else {
                warn!(receiver = %message.receiver, "Receiver not registered");
                return false;
            };
            mailbox.pending.fetch_add(1, Ordering::AcqRel);
            if mailbox.tx.send(message.clone()).is_err() {
                mailbox.pending.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
        }

        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        let mut log = self.log.lock().await;
        if log.len() >= self.log_capacity {
            log.pop_front();
        }
        if self.log_capacity > 0 {
            log.push_back(message);
        }
        true
    }

    /// Wait up to `timeout` for the next message in `worker_id`'s mailbox.
    pub async fn receive(&self, worker_id: &str, timeout: Duration) -> Option<Message> {
        let (inbox, pending) = {
            let registry = self.registry.lock().await;
            let mailbox = registry.mailboxes.get(worker_id)?;
            (mailbox.inbox.clone(), mailbox.pending.clone())
        };

        let message = tokio::time::timeout(timeout, async move {
            let mut inbox = inbox.lock().await;
            inbox.next().await
        })
        .await
        .ok()
        .flatten()?;

        pending.fetch_sub(1, Ordering::AcqRel);
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        Some(message)
    }

    /// Put messages already taken from `worker_id`'s mailbox back at its
    /// front, keeping their order.
    ///
    /// Expired messages are dropped. Returns the number requeued.
    pub async fn requeue_front(&self, worker_id: &str, messages: Vec<Message>) -> usize {
        if messages.is_empty() {
            return 0;
        }
        let (inbox, pending) = {
            let registry = self.registry.lock().await;
            let Some(mailbox) = registry.mailboxes.get(worker_id) else {
                warn!(worker = %worker_id, dropped = messages.len(), "Requeue to unregistered mailbox");
                return 0;
            };
            (mailbox.inbox.clone(), mailbox.pending.clone())
        };

        let total = messages.len();
        let live: Vec<Message> = messages.into_iter().filter(|m| !m.is_expired()).collect();
        if live.len() < total {
            warn!(worker = %worker_id, dropped = total - live.len(), "Dropped expired messages on requeue");
        }

        let requeued = live.len();
        let mut inbox = inbox.lock().await;
        for message in live.into_iter().rev() {
            inbox.requeued.push_front(message);
        }
        pending.fetch_add(requeued, Ordering::AcqRel);
        self.counters
            .received
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(requeued as u64))
            })
            .ok();
        requeued
    }

    /// Deliver a copy to every registered worker except the sender.
    ///
    /// Returns the number of copies delivered.
    pub async fn broadcast(&self, message: Message) -> usize {
        let targets: Vec<String> = {
            let registry = self.registry.lock().await;
            registry
                .mailboxes
                .keys()
                .filter(|id| **id != message.sender)
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        for target in targets {
            if self.send(message.retarget(target)).await {
                delivered += 1;
            }
        }
        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        debug!(sender = %message.sender, delivered, "Broadcast");
        delivered
    }

    /// Subscribe a registered worker to a topic. Unregistered workers are refused.
    pub async fn subscribe(&self, worker_id: &str, topic: &str) -> bool {
        let mut registry = self.registry.lock().await;
        if !registry.mailboxes.contains_key(worker_id) {
            warn!(worker = %worker_id, topic = %topic, "Refusing subscription for unregistered worker");
            return false;
        }
        registry
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(worker_id.to_string());
        true
    }

    /// Returns whether the worker was subscribed.
    pub async fn unsubscribe(&self, worker_id: &str, topic: &str) -> bool {
        let mut registry = self.registry.lock().await;
        registry
            .topics
            .get_mut(topic)
            .is_some_and(|subscribers| subscribers.shift_remove(worker_id))
    }

    /// Deliver a copy to every current subscriber of `topic`.
    pub async fn publish(&self, topic: &str, message: Message) -> usize {
        let subscribers: Vec<String> = {
            let registry = self.registry.lock().await;
            match registry.topics.get(topic) {
                Some(set) => set.iter().cloned().collect(),
                None => Vec::new(),
            }
        };

        let mut delivered = 0;
        for subscriber in subscribers {
            if self.send(message.retarget(subscriber)).await {
                delivered += 1;
            }
        }
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(topic = %topic, delivered, "Published");
        delivered
    }

    /// Messages waiting in the worker's mailbox, or `None` if it has none.
    pub async fn queue_size(&self, worker_id: &str) -> Option<usize> {
        let registry = self.registry.lock().await;
        registry
            .mailboxes
            .get(worker_id)
            .map(|m| m.pending.load(Ordering::Acquire))
    }

    /// The last `limit` delivered messages, oldest first.
    pub async fn recent_messages(&self, limit: usize) -> Vec<Message> {
        let log = self.log.lock().await;
        let skip = log.len().saturating_sub(limit);
        log.iter().skip(skip).cloned().collect()
    }

    pub async fn stats(&self) -> BusStats {
        let (active_workers, topics) = {
            let registry = self.registry.lock().await;
            (registry.mailboxes.len(), registry.topics.len())
        };
        BusStats {
            messages_sent: self.counters.sent.load(Ordering::Relaxed),
            messages_received: self.counters.received.load(Ordering::Relaxed),
            broadcasts: self.counters.broadcasts.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            active_workers,
            topics,
            message_log_size: self.log.lock().await.len(),
        }
    }

    /// Drain every mailbox and clear all registries. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let mut registry = self.registry.lock().await;
        let mut drained = 0usize;
        for mailbox in registry.mailboxes.values() {
            // A receiver blocked in `receive` holds the lock; dropping the
            // sender below closes that channel anyway.
            if let Ok(mut inbox) = mailbox.inbox.try_lock() {
                drained += inbox.requeued.len();
                inbox.requeued.clear();
                while inbox.rx.try_recv().is_ok() {
                    drained += 1;
                }
            }
        }
        registry.mailboxes.clear();
        registry.topics.clear();
        self.log.lock().await.clear();
        if drained > 0 {
            debug!(drained, "Drained mailboxes during cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::message::{MessageType, BROADCAST};
    use harvest_core::types::Params;

    const SHORT: Duration = Duration::from_millis(50);

    fn event(sender: &str, receiver: &str) -> Message {
        Message::new(sender, receiver, MessageType::Event, Params::new())
    }

    #[tokio::test]
    async fn send_and_receive_fifo() {
        let bus = MessageBus::new();
        bus.register("a").await;
        bus.register("b").await;

        let first = event("a", "b");
        let second = event("a", "b");
        assert!(bus.send(first.clone()).await);
        assert!(bus.send(second.clone()).await);
        assert_eq!(bus.queue_size("b").await, Some(2));

        assert_eq!(bus.receive("b", SHORT).await.unwrap().id, first.id);
        assert_eq!(bus.receive("b", SHORT).await.unwrap().id, second.id);
        assert!(bus.receive("b", SHORT).await.is_none());
        assert_eq!(bus.queue_size("b").await, Some(0));
    }

    #[tokio::test]
    async fn send_to_unregistered_receiver_fails() {
        let bus = MessageBus::new();
        bus.register("a").await;
        assert!(!bus.send(event("a", "ghost")).await);
        assert_eq!(bus.stats().await.messages_sent, 0);
        assert_eq!(bus.stats().await.message_log_size, 0);
        assert!(bus.queue_size("ghost").await.is_none());
    }

    #[tokio::test]
    async fn expired_message_is_not_enqueued() {
        let bus = MessageBus::new();
        bus.register("b").await;
        let mut msg = event("a", "b").with_ttl(0);
        msg.timestamp = msg.timestamp - chrono::Duration::seconds(1);
        assert!(!bus.send(msg).await);
        assert_eq!(bus.queue_size("b").await, Some(0));
    }

    #[tokio::test]
    async fn requeue_front_keeps_order_ahead_of_later_messages() {
        let bus = MessageBus::new();
        bus.register("b").await;
        let msgs: Vec<Message> = (0..4).map(|_| event("a", "b")).collect();
        for msg in &msgs[..3] {
            assert!(bus.send(msg.clone()).await);
        }
        let taken = vec![
            bus.receive("b", SHORT).await.unwrap(),
            bus.receive("b", SHORT).await.unwrap(),
        ];
        assert!(bus.send(msgs[3].clone()).await);

        assert_eq!(bus.requeue_front("b", taken).await, 2);
        assert_eq!(bus.queue_size("b").await, Some(4));
        for msg in &msgs {
            assert_eq!(bus.receive("b", SHORT).await.unwrap().id, msg.id);
        }
        assert_eq!(bus.stats().await.messages_received, 4);
    }

    #[tokio::test]
    async fn requeue_front_drops_expired_messages() {
        let bus = MessageBus::new();
        bus.register("b").await;
        assert!(bus.send(event("a", "b").with_ttl(1)).await);
        let mut stale = bus.receive("b", SHORT).await.unwrap();
        stale.timestamp = stale.timestamp - chrono::Duration::seconds(5);
        let fresh = event("a", "b");

        assert_eq!(bus.requeue_front("b", vec![stale, fresh.clone()]).await, 1);
        assert_eq!(bus.receive("b", SHORT).await.unwrap().id, fresh.id);
        assert!(bus.receive("b", SHORT).await.is_none());
        assert_eq!(bus.requeue_front("ghost", vec![event("a", "ghost")]).await, 0);
    }

    #[test]
    fn receive_timeout_comes_from_config() {
        let bus = MessageBus::with_config(&BusConfig {
            receive_timeout_ms: 75,
            ..BusConfig::default()
        });
        assert_eq!(bus.receive_timeout(), Duration::from_millis(75));
    }

    #[tokio::test]
    async fn receive_unknown_worker_is_none() {
        let bus = MessageBus::new();
        assert!(bus.receive("nobody", SHORT).await.is_none());
    }

    #[tokio::test]
    async fn register_twice_is_noop() {
        let bus = MessageBus::new();
        bus.register("a").await;
        bus.register("b").await;
        assert!(bus.send(event("b", "a")).await);
        bus.register("a").await;
        assert_eq!(bus.queue_size("a").await, Some(1));
        assert_eq!(bus.workers().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn broadcast_skips_sender_in_registration_order() {
        let bus = MessageBus::new();
        for id in ["supervisor", "explorer", "analyst", "validator"] {
            bus.register(id).await;
        }
        let msg = event("supervisor", BROADCAST);
        assert_eq!(bus.broadcast(msg.clone()).await, 3);
        assert_eq!(bus.queue_size("supervisor").await, Some(0));

        let receivers: Vec<String> = bus
            .recent_messages(10)
            .await
            .into_iter()
            .map(|m| m.receiver)
            .collect();
        assert_eq!(receivers, vec!["explorer", "analyst", "validator"]);

        let copy = bus.receive("analyst", SHORT).await.unwrap();
        assert_eq!(copy.id, msg.id);
        assert_eq!(copy.timestamp, msg.timestamp);
        assert_eq!(copy.receiver, "analyst");
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_only() {
        let bus = MessageBus::new();
        for id in ["a", "b", "c"] {
            bus.register(id).await;
        }
        assert!(bus.subscribe("c", "patterns").await);
        assert!(bus.subscribe("a", "patterns").await);
        assert!(!bus.subscribe("ghost", "patterns").await);

        assert_eq!(bus.publish("patterns", event("b", "patterns")).await, 2);
        let receivers: Vec<String> = bus
            .recent_messages(2)
            .await
            .into_iter()
            .map(|m| m.receiver)
            .collect();
        assert_eq!(receivers, vec!["c", "a"]);

        assert!(bus.unsubscribe("c", "patterns").await);
        assert!(!bus.unsubscribe("c", "patterns").await);
        assert_eq!(bus.publish("patterns", event("b", "patterns")).await, 1);
        assert_eq!(bus.publish("empty", event("b", "empty")).await, 0);
    }

    #[tokio::test]
    async fn unregister_removes_topic_membership() {
        let bus = MessageBus::new();
        bus.register("a").await;
        bus.subscribe("a", "news").await;
        bus.unregister("a").await;
        assert!(!bus.is_registered("a").await);
        assert_eq!(bus.publish("news", event("x", "news")).await, 0);
    }

    #[tokio::test]
    async fn message_log_is_bounded() {
        let bus = MessageBus::with_config(&BusConfig {
            message_log_capacity: 2,
            ..Default::default()
        });
        bus.register("b").await;
        for _ in 0..5 {
            bus.send(event("a", "b")).await;
        }
        let stats = bus.stats().await;
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.message_log_size, 2);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let bus = MessageBus::new();
        bus.register("a").await;
        bus.register("b").await;
        bus.subscribe("a", "t").await;
        bus.send(event("a", "b")).await;

        bus.cleanup().await;
        bus.cleanup().await;

        let stats = bus.stats().await;
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.topics, 0);
        assert_eq!(stats.message_log_size, 0);
        assert!(bus.receive("b", SHORT).await.is_none());
    }
}
