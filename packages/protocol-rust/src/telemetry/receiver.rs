//! Telemetry receiver: subscribes to a topic pattern and decodes deliveries.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use courier_core::headers;
use courier_core::topic::tokens;
use courier_core::{
    AckToken, InboundMessage, PayloadCodec, ProtocolError, PubSubTransport, Subscription,
    Timestamp, TopicPattern, TopicTokens,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cloud_event::CloudEvent;
use crate::clock::SharedHlc;
use crate::config::{shared_filter, ReceiverOptions};
use crate::wire;

/// One received telemetry message.
#[derive(Debug)]
pub struct TelemetryDelivery<T> {
    pub payload: T,
    /// From the `{senderId}` topic token, else the `__srcId` header.
    pub sender_id: Option<String>,
    pub topic: String,
    pub topic_tokens: TopicTokens,
    pub cloud_event: Option<CloudEvent>,
    pub timestamp: Option<Timestamp>,
    pub custom_user_data: Vec<(String, String)>,
    ack: Option<AckToken>,
}

impl<T> TelemetryDelivery<T> {
    /// Acknowledges the message to the transport. Only needed with
    /// `auto_ack` disabled; later calls do nothing.
    pub fn ack(&mut self) {
        if let Some(ack) = self.ack.take() {
            ack.ack();
        }
    }

    /// Whether the message still awaits acknowledgement.
    #[must_use]
    pub fn needs_ack(&self) -> bool {
        self.ack.is_some()
    }
}

/// Receives telemetry of one kind.
pub struct TelemetryReceiver<T, C> {
    telemetry_name: String,
    transport: Arc<dyn PubSubTransport>,
    hlc: SharedHlc,
    codec: C,
    pattern: TopicPattern,
    filter: String,
    auto_ack: bool,
    subscription: Mutex<Option<Subscription>>,
    cancel: CancellationToken,
    _payload: PhantomData<fn() -> T>,
}

impl<T, C> TelemetryReceiver<T, C>
where
    C: PayloadCodec<T>,
{
    /// Builds a receiver. The subscription is made by [`start`](Self::start)
    /// or on the first [`recv`](Self::recv).
    ///
    /// # Errors
    ///
    /// `ConfigurationInvalid` if the topic pattern or service group is invalid.
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        hlc: SharedHlc,
        options: ReceiverOptions,
        codec: C,
    ) -> Result<Self, ProtocolError> {
        options.validate()?;
        let pattern = TopicPattern::new(
            "topic_pattern",
            &options.topic_pattern,
            &options.construction_tokens(),
        )?;
        let filter = shared_filter(options.service_group_id.as_deref(), pattern.as_subscribe_topic());

        Ok(Self {
            telemetry_name: options.telemetry_name,
            transport,
            hlc,
            codec,
            pattern,
            filter,
            auto_ack: options.auto_ack,
            subscription: Mutex::new(None),
            cancel: CancellationToken::new(),
            _payload: PhantomData,
        })
    }

    /// Filter the subscription uses.
    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Token that ends [`recv`](Self::recv) and [`run`](Self::run) when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribes to the telemetry topic if not already subscribed.
    ///
    /// # Errors
    ///
    /// `TransportError` if the subscription fails.
    pub async fn start(&self) -> Result<(), ProtocolError> {
        let mut slot = self.subscription.lock().await;
        self.ensure_subscribed(&mut slot).await
    }

    /// Next delivery, or `None` once the receiver is shut down or the
    /// transport closes the subscription.
    ///
    /// Messages that fail to decode are yielded as errors; the stream
    /// continues afterwards.
    pub async fn recv(&self) -> Option<Result<TelemetryDelivery<T>, ProtocolError>> {
        let mut delivery = self.next().await?;
        if self.auto_ack {
            if let Ok(delivery) = delivery.as_mut() {
                delivery.ack();
            }
        }
        Some(delivery)
    }

    /// Drives [`recv`](Self::recv) until shutdown, handing each item to
    /// `callback`. With `auto_ack` the message is acknowledged once the
    /// callback returns.
    pub async fn run<F, Fut>(&self, mut callback: F)
    where
        F: FnMut(Result<TelemetryDelivery<T>, ProtocolError>) -> Fut,
        Fut: Future<Output = ()>,
    {
        while let Some(mut item) = self.next().await {
            let ack = match item.as_mut() {
                Ok(delivery) if self.auto_ack => delivery.ack.take(),
                _ => None,
            };
            callback(item).await;
            if let Some(ack) = ack {
                ack.ack();
            }
        }
        debug!(telemetry = %self.telemetry_name, "telemetry receiver loop ended");
    }

    /// Ends every pending `recv` and unsubscribes.
    ///
    /// # Errors
    ///
    /// `TransportError` if the unsubscribe fails.
    pub async fn shutdown(&self) -> Result<(), ProtocolError> {
        self.cancel.cancel();
        let had_subscription = self.subscription.lock().await.take().is_some();
        if had_subscription {
            self.transport
                .unsubscribe(&self.filter)
                .await
                .map_err(|err| ProtocolError::transport("failed to unsubscribe from telemetry", err))?;
        }
        info!(telemetry = %self.telemetry_name, "telemetry receiver stopped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn ensure_subscribed(&self, slot: &mut Option<Subscription>) -> Result<(), ProtocolError> {
        if slot.is_some() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(ProtocolError::cancellation("telemetry receiver has been shut down"));
        }
        let subscription = self.transport.subscribe(&self.filter).await.map_err(|err| {
            ProtocolError::transport("failed to subscribe to telemetry", err).into_shallow()
        })?;
        *slot = Some(subscription);
        info!(telemetry = %self.telemetry_name, filter = %self.filter, "telemetry receiver subscribed");
        Ok(())
    }

    /// Next decoded message with its ack token still attached.
    async fn next(&self) -> Option<Result<TelemetryDelivery<T>, ProtocolError>> {
        let mut slot = self.subscription.lock().await;
        if self.cancel.is_cancelled() {
            return None;
        }
        if let Err(err) = self.ensure_subscribed(&mut slot).await {
            return Some(Err(err));
        }
        let subscription = slot.as_mut()?;

        let mut message = tokio::select! {
            () = self.cancel.cancelled() => return None,
            next = subscription.recv() => next?,
        };

        let ack = message.take_ack();
        match self.decode(&message) {
            Ok(mut delivery) => {
                delivery.ack = ack;
                Some(Ok(delivery))
            }
            Err(err) => {
                warn!(
                    telemetry = %self.telemetry_name,
                    topic = %message.topic,
                    error = %err,
                    "undecodable telemetry"
                );
                // Redelivery would fail the same way.
                if let Some(ack) = ack {
                    ack.ack();
                }
                Some(Err(err.with_command_name(self.telemetry_name.clone())))
            }
        }
    }

    fn decode(&self, message: &InboundMessage) -> Result<TelemetryDelivery<T>, ProtocolError> {
        let properties = &message.properties;

        // Telemetry is peer-originated like a request; there is no response kind to use.
        wire::check_version(properties, ProtocolError::unsupported_request_version)?;

        let timestamp = properties
            .user_property(headers::TIMESTAMP)
            .map(|raw| self.hlc.observe_header(raw))
            .transpose()?;

        let payload = self
            .codec
            .decode(
                &message.payload,
                properties.content_type.as_deref(),
                properties.format_indicator,
            )
            .map_err(wire::decode_error)?;

        let cloud_event = CloudEvent::from_properties(properties).transpose()?;
        let excluded: &[&str] = if cloud_event.is_some() {
            headers::cloud_event::ALL
        } else {
            &[]
        };

        let topic_tokens = self.pattern.match_topic(&message.topic).unwrap_or_default();
        let sender_id = topic_tokens
            .get(tokens::SENDER_ID)
            .cloned()
            .or_else(|| properties.user_property(headers::SOURCE_ID).map(str::to_string));

        Ok(TelemetryDelivery {
            payload,
            sender_id,
            topic: message.topic.clone(),
            topic_tokens,
            cloud_event,
            timestamp,
            custom_user_data: headers::custom_user_data(&properties.user_properties, excluded),
            ack: None,
        })
    }
}

impl<T, C> std::fmt::Debug for TelemetryReceiver<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryReceiver")
            .field("telemetry_name", &self.telemetry_name)
            .field("filter", &self.filter)
            .field("auto_ack", &self.auto_ack)
            .finish_non_exhaustive()
    }
}
