//! Telemetry sender: fire-and-forget publishes on a topic pattern.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use courier_core::headers;
use courier_core::topic::CUSTOM_TOKEN_PREFIX;
use courier_core::{
    PayloadCodec, ProtocolError, ProtocolVersion, PubSubTransport, PublishProperties,
    TopicPattern, TopicTokens,
};
use tracing::debug;

use super::cloud_event::CloudEvent;
use crate::clock::SharedHlc;
use crate::command::request::check_user_data;
use crate::config::SenderOptions;
use crate::wire::expiry_seconds;

/// Expiry applied when a message does not set one.
pub const DEFAULT_TELEMETRY_EXPIRY: Duration = Duration::from_secs(10);

/// One telemetry message.
#[derive(Debug, Clone)]
pub struct TelemetryMessage<T> {
    pub payload: T,
    pub topic_tokens: TopicTokens,
    pub cloud_event: Option<CloudEvent>,
    pub message_expiry: Duration,
    pub custom_user_data: Vec<(String, String)>,
}

impl<T> TelemetryMessage<T> {
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            topic_tokens: TopicTokens::new(),
            cloud_event: None,
            message_expiry: DEFAULT_TELEMETRY_EXPIRY,
            custom_user_data: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_topic_token(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.topic_tokens.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_custom_topic_token(self, name: &str, value: impl Into<String>) -> Self {
        self.with_topic_token(format!("{CUSTOM_TOKEN_PREFIX}{name}"), value)
    }

    #[must_use]
    pub fn with_cloud_event(mut self, cloud_event: CloudEvent) -> Self {
        self.cloud_event = Some(cloud_event);
        self
    }

    #[must_use]
    pub fn with_message_expiry(mut self, expiry: Duration) -> Self {
        self.message_expiry = expiry;
        self
    }

    #[must_use]
    pub fn with_user_data(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_user_data.push((name.into(), value.into()));
        self
    }
}

/// Publishes telemetry of one kind.
pub struct TelemetrySender<T, C> {
    telemetry_name: String,
    transport: Arc<dyn PubSubTransport>,
    hlc: SharedHlc,
    codec: C,
    pattern: TopicPattern,
    _payload: PhantomData<fn(T)>,
}

impl<T, C> TelemetrySender<T, C>
where
    C: PayloadCodec<T>,
{
    /// # Errors
    ///
    /// `ConfigurationInvalid` if the telemetry name is empty or the topic
    /// pattern is malformed.
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        hlc: SharedHlc,
        options: SenderOptions,
        codec: C,
    ) -> Result<Self, ProtocolError> {
        options.validate()?;
        let tokens = options.construction_tokens(transport.client_id());
        let pattern = TopicPattern::new("topic_pattern", &options.topic_pattern, &tokens)?;
        Ok(Self {
            telemetry_name: options.telemetry_name,
            transport,
            hlc,
            codec,
            pattern,
            _payload: PhantomData,
        })
    }

    #[must_use]
    pub fn telemetry_name(&self) -> &str {
        &self.telemetry_name
    }

    /// Publishes `message`. Resolves once the transport accepted it.
    ///
    /// # Errors
    ///
    /// Shallow `ArgumentInvalid`, `ConfigurationInvalid` or `PayloadInvalid`
    /// if the message cannot be built; `TransportError` if the publish fails.
    pub async fn send(&self, message: TelemetryMessage<T>) -> Result<(), ProtocolError> {
        self.publish(message)
            .await
            .map_err(|err| err.with_command_name(self.telemetry_name.clone()))
    }

    async fn publish(&self, message: TelemetryMessage<T>) -> Result<(), ProtocolError> {
        let expiry = validate_expiry(message.message_expiry)?;
        check_user_data(&message.custom_user_data)?;
        let topic = self.pattern.resolve(&message.topic_tokens)?;

        let payload = self.codec.encode(&message.payload).map_err(|err| {
            ProtocolError::payload_invalid(format!("failed to encode telemetry: {err}"))
                .with_source(err)
                .into_shallow()
        })?;

        let content_type = self.codec.content_type();
        let mut properties = PublishProperties {
            content_type: (!content_type.is_empty()).then(|| content_type.to_string()),
            format_indicator: self.codec.format_indicator(),
            message_expiry_interval: Some(expiry),
            user_properties: message.custom_user_data,
            ..PublishProperties::default()
        };
        if let Some(cloud_event) = &message.cloud_event {
            cloud_event.write_headers(&topic, &mut properties)?;
        }
        properties.push_user_property(headers::PROTOCOL_VERSION, ProtocolVersion::CURRENT.to_string());
        properties.push_user_property(headers::SOURCE_ID, self.transport.client_id());
        properties.push_user_property(headers::TIMESTAMP, self.hlc.now().to_string());

        self.transport
            .publish(&topic, payload, properties)
            .await
            .map_err(|err| ProtocolError::transport("failed to publish telemetry", err))?;

        debug!(telemetry = %self.telemetry_name, topic = %topic, "telemetry sent");
        Ok(())
    }
}

impl<T, C> std::fmt::Debug for TelemetrySender<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetrySender")
            .field("telemetry_name", &self.telemetry_name)
            .finish_non_exhaustive()
    }
}

fn validate_expiry(expiry: Duration) -> Result<u32, ProtocolError> {
    let invalid = |message: &str| {
        ProtocolError::argument_invalid(
            "message_expiry",
            Some(format!("{}ms", expiry.as_millis())),
            message,
        )
    };
    if expiry.is_zero() {
        return Err(invalid("telemetry expiry must be positive"));
    }
    expiry_seconds(expiry).ok_or_else(|| invalid("telemetry expiry exceeds u32::MAX seconds"))
}

#[cfg(test)]
mod tests {
    use courier_core::{ErrorKind, JsonCodec};

    use super::*;
    use crate::transport::MemoryBroker;

    fn sender(broker: &MemoryBroker) -> TelemetrySender<f64, JsonCodec<f64>> {
        TelemetrySender::new(
            Arc::new(broker.client("sensor-1")),
            SharedHlc::new("sensor-1"),
            SenderOptions {
                telemetry_name: "temperature".into(),
                topic_pattern: "sensors/{senderId}/{telemetryName}/{ex:room}".into(),
                ..SenderOptions::default()
            },
            JsonCodec::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn publishes_with_protocol_headers() {
        let broker = MemoryBroker::new();
        let listener = broker.client("listener");
        let mut sub = listener.subscribe("sensors/#").await.unwrap();

        sender(&broker)
            .send(
                TelemetryMessage::new(21.5)
                    .with_custom_topic_token("room", "kitchen")
                    .with_cloud_event(
                        CloudEvent::new("urn:sensor-1").with_data_schema("schemas/celsius.json"),
                    )
                    .with_user_data("unit", "C"),
            )
            .await
            .unwrap();

        let message = sub.recv().await.unwrap();
        let props = &message.properties;
        assert_eq!(message.topic, "sensors/sensor-1/temperature/kitchen");
        assert_eq!(&message.payload[..], b"21.5");
        assert_eq!(props.message_expiry_interval, Some(10));
        assert_eq!(props.user_property(headers::SOURCE_ID), Some("sensor-1"));
        assert_eq!(props.user_property(headers::PROTOCOL_VERSION), Some("1.0"));
        assert!(props.user_property(headers::TIMESTAMP).is_some());
        assert_eq!(props.user_property("unit"), Some("C"));
        assert_eq!(
            props.user_property(headers::cloud_event::SUBJECT),
            Some("sensors/sensor-1/temperature/kitchen")
        );
    }

    #[tokio::test]
    async fn invalid_messages_fail_before_publishing() {
        let broker = MemoryBroker::new();
        let sender = sender(&broker);

        let unresolved = sender.send(TelemetryMessage::new(1.0)).await.unwrap_err();
        assert_eq!(unresolved.kind(), ErrorKind::ConfigurationInvalid);
        assert!(unresolved.is_shallow());

        let zero = sender
            .send(
                TelemetryMessage::new(1.0)
                    .with_custom_topic_token("room", "hall")
                    .with_message_expiry(Duration::ZERO),
            )
            .await
            .unwrap_err();
        assert_eq!(zero.kind(), ErrorKind::ArgumentInvalid);

        let no_source = sender
            .send(
                TelemetryMessage::new(1.0)
                    .with_custom_topic_token("room", "hall")
                    .with_cloud_event(CloudEvent::new("")),
            )
            .await
            .unwrap_err();
        assert_eq!(no_source.kind(), ErrorKind::ConfigurationInvalid);

        let no_schema = sender
            .send(
                TelemetryMessage::new(1.0)
                    .with_custom_topic_token("room", "hall")
                    .with_cloud_event(CloudEvent::new("urn:s").with_type("x")),
            )
            .await
            .unwrap_err();
        assert_eq!(no_schema.kind(), ErrorKind::ConfigurationInvalid);
        assert_eq!(no_schema.property_name(), Some("data_schema"));

        let bad_level = sender
            .send(TelemetryMessage::new(1.0).with_custom_topic_token("room", "a/b"))
            .await
            .unwrap_err();
        assert_eq!(bad_level.kind(), ErrorKind::ArgumentInvalid);
        assert!(bad_level.is_shallow());

        assert_eq!(broker.published_count(), 0);
    }

    #[test]
    fn unnamed_sender_is_rejected() {
        let broker = MemoryBroker::new();
        let err = TelemetrySender::<f64, _>::new(
            Arc::new(broker.client("sensor-1")),
            SharedHlc::new("sensor-1"),
            SenderOptions {
                topic_pattern: "sensors/{senderId}".into(),
                ..SenderOptions::default()
            },
            JsonCodec::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
        assert_eq!(err.property_name(), Some("telemetry_name"));
    }

    #[tokio::test]
    async fn transport_failure_is_reported() {
        let broker = MemoryBroker::new();
        let client = Arc::new(broker.client("sensor-1"));
        let sender: TelemetrySender<f64, _> = TelemetrySender::new(
            Arc::clone(&client) as Arc<dyn PubSubTransport>,
            SharedHlc::new("sensor-1"),
            SenderOptions {
                telemetry_name: "temperature".into(),
                topic_pattern: "sensors/{telemetryName}".into(),
                ..SenderOptions::default()
            },
            JsonCodec::default(),
        )
        .unwrap();

        client.fail_next_publishes(1);
        let err = sender.send(TelemetryMessage::new(3.0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportError);
        assert!(!err.is_shallow());
        assert!(sender.send(TelemetryMessage::new(3.0)).await.is_ok());
    }
}
