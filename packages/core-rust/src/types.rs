use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// MQTT v5 payload format indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatIndicator {
    /// Opaque bytes.
    #[default]
    Unspecified,
    /// UTF-8 character data.
    Utf8,
}

/// Per-message metadata carried alongside the payload.
///
/// Mirrors the MQTT v5 publish properties the protocol relies on. User
/// properties keep their arrival order and may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub content_type: Option<String>,
    pub format_indicator: FormatIndicator,
    pub correlation_data: Option<Bytes>,
    pub response_topic: Option<String>,
    /// Remaining lifetime in whole seconds.
    pub message_expiry_interval: Option<u32>,
    pub user_properties: Vec<(String, String)>,
}

impl PublishProperties {
    /// First user property named `name`.
    #[must_use]
    pub fn user_property(&self, name: &str) -> Option<&str> {
        self.user_properties
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Appends a user property.
    pub fn push_user_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.user_properties.push((name.into(), value.into()));
    }
}

/// Acknowledges an inbound message back to the transport.
#[derive(Debug)]
pub struct AckToken(oneshot::Sender<()>);

impl AckToken {
    #[must_use]
    pub fn new(tx: oneshot::Sender<()>) -> Self {
        Self(tx)
    }

    pub fn ack(self) {
        // The transport may have given up on the message already.
        let _ = self.0.send(());
    }
}

/// A message delivered on a subscription.
#[derive(Debug)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub properties: PublishProperties,
    ack: Option<AckToken>,
}

impl InboundMessage {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Bytes, properties: PublishProperties) -> Self {
        Self {
            topic: topic.into(),
            payload,
            properties,
            ack: None,
        }
    }

    /// Attaches the token the receiver must fire once it is done with the message.
    #[must_use]
    pub fn with_ack(mut self, token: AckToken) -> Self {
        self.ack = Some(token);
        self
    }

    /// Takes the acknowledgement token, if the transport asked for one.
    pub fn take_ack(&mut self) -> Option<AckToken> {
        self.ack.take()
    }
}

/// `major.minor` protocol version carried in `__protVer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Version spoken by this implementation.
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    /// Major versions this implementation accepts.
    pub const SUPPORTED_MAJOR: &'static [u16] = &[1];

    #[must_use]
    pub fn is_supported(self) -> bool {
        Self::SUPPORTED_MAJOR.contains(&self.major)
    }

    /// Renders the supported majors as the space-separated header value.
    #[must_use]
    pub fn supported_majors_header() -> String {
        Self::SUPPORTED_MAJOR
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Parses a space-separated list of major versions.
    #[must_use]
    pub fn parse_majors(value: &str) -> Vec<u16> {
        value
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect()
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s.split_once('.').ok_or_else(|| s.to_string())?;
        Ok(Self {
            major: major.parse().map_err(|_| s.to_string())?,
            minor: minor.parse().map_err(|_| s.to_string())?,
        })
    }
}
