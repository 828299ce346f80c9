use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::types::{InboundMessage, PublishProperties};

/// Ordered stream of messages delivered for one topic filter.
#[derive(Debug)]
pub struct Subscription {
    filter: String,
    rx: mpsc::Receiver<InboundMessage>,
}

impl Subscription {
    #[must_use]
    pub fn new(filter: impl Into<String>, rx: mpsc::Receiver<InboundMessage>) -> Self {
        Self {
            filter: filter.into(),
            rx,
        }
    }

    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Next message, or `None` once the transport closes the subscription.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

/// Publish/subscribe transport consumed by every protocol component.
/// Implementations: MQTT client sessions, the in-memory broker (tests, demos).
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Identity of this client on the transport.
    fn client_id(&self) -> &str;

    /// Publish a message. Resolves once the transport accepted it.
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        properties: PublishProperties,
    ) -> anyhow::Result<()>;

    /// Subscribe to a topic filter (MQTT wildcard and shared-subscription syntax).
    async fn subscribe(&self, topic_filter: &str) -> anyhow::Result<Subscription>;

    /// Stop delivery for a topic filter previously subscribed.
    async fn unsubscribe(&self, topic_filter: &str) -> anyhow::Result<()>;
}
