//! In-process publish/subscribe broker.
//!
//! [`MemoryBroker`] routes messages between [`MemoryClient`]s with MQTT
//! filter semantics: `+` and `#` wildcards, and `$share/{group}/` shared
//! subscriptions served round-robin. Each subscription gets a bounded mpsc
//! channel; a full channel drops the message for that subscriber only, so a
//! slow consumer cannot stall the publisher.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::topic::{strip_share_prefix, topic_matches_filter};
use courier_core::{AckToken, InboundMessage, PubSubTransport, PublishProperties, Subscription};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Broker-wide settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Capacity of each subscription's delivery channel.
    pub subscription_channel_capacity: usize,
    /// Attach an acknowledgement token to every delivered message.
    pub require_ack: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscription_channel_capacity: 256,
            require_ack: true,
        }
    }
}

/// Identifier assigned to each subscription by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

#[derive(Debug)]
struct Subscriber {
    client_id: String,
    filter: String,
    tx: mpsc::Sender<InboundMessage>,
}

#[derive(Debug, Default)]
struct BrokerStats {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    acknowledged: Arc<AtomicU64>,
}

#[derive(Debug)]
struct BrokerInner {
    config: BrokerConfig,
    subscribers: DashMap<SubscriptionId, Subscriber>,
    next_id: AtomicU64,
    share_cursors: DashMap<String, AtomicUsize>,
    stats: BrokerStats,
}

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                subscribers: DashMap::new(),
                // Subscription ids start at 1 (0 means "none").
                next_id: AtomicU64::new(1),
                share_cursors: DashMap::new(),
                stats: BrokerStats::default(),
            }),
        }
    }

    /// Connects a new client session with the given identity.
    #[must_use]
    pub fn client(&self, client_id: impl Into<String>) -> MemoryClient {
        MemoryClient {
            client_id: client_id.into(),
            broker: Arc::clone(&self.inner),
            filters: DashMap::new(),
            failing_publishes: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.inner.stats.published.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn delivered_count(&self) -> u64 {
        self.inner.stats.delivered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.inner.stats.dropped.load(Ordering::Relaxed)
    }

    /// Number of delivered messages their receivers have acknowledged.
    #[must_use]
    pub fn acknowledged_count(&self) -> u64 {
        self.inner.stats.acknowledged.load(Ordering::Relaxed)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerInner {
    fn register(&self, client_id: &str, filter: &str) -> (SubscriptionId, mpsc::Receiver<InboundMessage>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.subscription_channel_capacity);
        self.subscribers.insert(
            id,
            Subscriber {
                client_id: client_id.to_string(),
                filter: filter.to_string(),
                tx,
            },
        );
        (id, rx)
    }

    /// Picks the recipients for `topic`: every plain match, plus one member
    /// per shared-subscription group.
    fn route(&self, topic: &str) -> Vec<mpsc::Sender<InboundMessage>> {
        let mut direct = Vec::new();
        let mut groups: BTreeMap<String, Vec<(SubscriptionId, mpsc::Sender<InboundMessage>)>> =
            BTreeMap::new();

        for entry in &self.subscribers {
            let sub = entry.value();
            if !topic_matches_filter(&sub.filter, topic) {
                continue;
            }
            if strip_share_prefix(&sub.filter).is_some() {
                groups
                    .entry(sub.filter.clone())
                    .or_default()
                    .push((*entry.key(), sub.tx.clone()));
            } else {
                direct.push(sub.tx.clone());
            }
        }

        for (filter, mut members) in groups {
            members.sort_by_key(|(id, _)| *id);
            let cursor = self
                .share_cursors
                .entry(filter)
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed);
            let (_, tx) = members.swap_remove(cursor % members.len());
            direct.push(tx);
        }
        direct
    }

    fn deliver(&self, topic: &str, payload: &Bytes, properties: &PublishProperties) {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        for tx in self.route(topic) {
            let mut message = InboundMessage::new(topic, payload.clone(), properties.clone());
            if self.config.require_ack {
                let (ack_tx, ack_rx) = oneshot::channel();
                message = message.with_ack(AckToken::new(ack_tx));
                let acknowledged = Arc::clone(&self.stats.acknowledged);
                tokio::spawn(async move {
                    if ack_rx.await.is_ok() {
                        acknowledged.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
            match tx.try_send(message) {
                Ok(()) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(topic, "subscription channel full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(topic, "subscriber went away before delivery");
                }
            }
        }
    }
}

/// One client session on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryClient {
    client_id: String,
    broker: Arc<BrokerInner>,
    filters: DashMap<String, SubscriptionId>,
    failing_publishes: AtomicU32,
}

impl MemoryClient {
    /// Makes the next `count` publishes fail with a transport error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Drops every subscription held by this client.
    pub fn disconnect(&self) {
        let filters: Vec<String> = self.filters.iter().map(|e| e.key().clone()).collect();
        for filter in filters {
            if let Some((_, id)) = self.filters.remove(&filter) {
                self.broker.subscribers.remove(&id);
            }
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PubSubTransport for MemoryClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        properties: PublishProperties,
    ) -> anyhow::Result<()> {
        if self.take_injected_failure() {
            anyhow::bail!("injected publish failure for client {}", self.client_id);
        }
        if topic.is_empty() || topic.contains(['+', '#']) {
            anyhow::bail!("invalid publish topic {topic:?}");
        }
        self.broker.deliver(topic, &payload, &properties);
        Ok(())
    }

    async fn subscribe(&self, topic_filter: &str) -> anyhow::Result<Subscription> {
        if topic_filter.is_empty() {
            anyhow::bail!("empty topic filter");
        }
        let (id, rx) = self.broker.register(&self.client_id, topic_filter);
        if let Some(previous) = self.filters.insert(topic_filter.to_string(), id) {
            self.broker.subscribers.remove(&previous);
        }
        debug!(client_id = %self.client_id, filter = topic_filter, "subscribed");
        Ok(Subscription::new(topic_filter, rx))
    }

    async fn unsubscribe(&self, topic_filter: &str) -> anyhow::Result<()> {
        if let Some((_, id)) = self.filters.remove(topic_filter) {
            if let Some((_, sub)) = self.broker.subscribers.remove(&id) {
                debug!(client_id = %sub.client_id, filter = topic_filter, "unsubscribed");
            }
        }
        Ok(())
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
