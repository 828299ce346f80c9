//! CloudEvents envelope carried in telemetry user properties.

use chrono::{DateTime, SecondsFormat, Utc};
use courier_core::headers::cloud_event as ce;
use courier_core::{ProtocolError, PublishProperties};
use uuid::Uuid;

/// CloudEvents specification version written by senders.
pub const CLOUD_EVENT_SPEC_VERSION: &str = "1.0";

/// Event type used when the sender does not set one.
pub const DEFAULT_EVENT_TYPE: &str = "courier.telemetry";

/// Envelope metadata attached to a telemetry message.
///
/// The data schema is required: an envelope without one is incomplete and
/// is rejected at send time. `id`, `time` and `subject` are filled in at
/// send time when left unset; the subject defaults to the resolved telemetry
/// topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudEvent {
    pub source: String,
    pub event_type: String,
    pub spec_version: String,
    pub id: Option<String>,
    pub time: Option<DateTime<Utc>>,
    pub subject: Option<String>,
    pub data_schema: Option<String>,
}

impl CloudEvent {
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            event_type: DEFAULT_EVENT_TYPE.to_string(),
            spec_version: CLOUD_EVENT_SPEC_VERSION.to_string(),
            id: None,
            time: None,
            subject: None,
            data_schema: None,
        }
    }

    #[must_use]
    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn with_data_schema(mut self, data_schema: impl Into<String>) -> Self {
        self.data_schema = Some(data_schema.into());
        self
    }

    /// Validates the envelope and appends its fields to `properties`.
    ///
    /// # Errors
    ///
    /// `ConfigurationInvalid` if the source, type or spec version is empty,
    /// or the data schema is missing or empty.
    pub(crate) fn write_headers(
        &self,
        topic: &str,
        properties: &mut PublishProperties,
    ) -> Result<(), ProtocolError> {
        for (name, value) in [
            ("source", &self.source),
            ("event_type", &self.event_type),
            ("spec_version", &self.spec_version),
        ] {
            if value.trim().is_empty() {
                return Err(ProtocolError::configuration_invalid(
                    name,
                    Some(value.clone()),
                    format!("cloud event {name} must not be empty"),
                ));
            }
        }
        let schema = match self.data_schema.as_deref() {
            Some(schema) if !schema.trim().is_empty() => schema,
            other => {
                return Err(ProtocolError::configuration_invalid(
                    "data_schema",
                    other.map(str::to_string),
                    "cloud event data schema is required alongside the other envelope fields",
                ));
            }
        };

        let id = self.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let time = self.time.unwrap_or_else(Utc::now);

        properties.push_user_property(ce::SPEC_VERSION, self.spec_version.as_str());
        properties.push_user_property(ce::TYPE, self.event_type.as_str());
        properties.push_user_property(ce::SOURCE, self.source.as_str());
        properties.push_user_property(ce::ID, id);
        properties.push_user_property(ce::TIME, time.to_rfc3339_opts(SecondsFormat::Millis, true));
        properties.push_user_property(ce::SUBJECT, self.subject.as_deref().unwrap_or(topic));
        properties.push_user_property(ce::DATA_SCHEMA, schema);
        Ok(())
    }

    /// Reads an envelope from received properties. `None` when the message
    /// carries no `specversion`.
    ///
    /// # Errors
    ///
    /// `HeaderMissing` if a required field is absent; `HeaderInvalid` if the
    /// time is not RFC 3339.
    pub(crate) fn from_properties(
        properties: &PublishProperties,
    ) -> Option<Result<Self, ProtocolError>> {
        let spec_version = properties.user_property(ce::SPEC_VERSION)?;
        Some(Self::parse(spec_version, properties))
    }

    fn parse(spec_version: &str, properties: &PublishProperties) -> Result<Self, ProtocolError> {
        let required = |name: &str| {
            properties
                .user_property(name)
                .map(str::to_string)
                .ok_or_else(|| ProtocolError::header_missing(name))
        };

        let time = properties
            .user_property(ce::TIME)
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|err| ProtocolError::header_invalid(ce::TIME, raw).with_source(err))
            })
            .transpose()?;

        Ok(Self {
            source: required(ce::SOURCE)?,
            event_type: required(ce::TYPE)?,
            spec_version: spec_version.to_string(),
            id: Some(required(ce::ID)?),
            time,
            subject: properties.user_property(ce::SUBJECT).map(str::to_string),
            data_schema: properties.user_property(ce::DATA_SCHEMA).map(str::to_string),
        })
    }
}
