//! Names of the user properties and MQTT properties that carry protocol metadata.
//!
//! User properties starting with [`RESERVED_PREFIX`] belong to the protocol;
//! everything else is custom user data passed through untouched.

/// Prefix reserved for protocol user properties.
pub const RESERVED_PREFIX: &str = "__";

pub const PROTOCOL_VERSION: &str = "__protVer";
pub const SOURCE_ID: &str = "__srcId";
pub const TIMESTAMP: &str = "__ts";
pub const IDEMPOTENT: &str = "__idem";
pub const FENCING_TOKEN: &str = "__ft";
pub const STATUS: &str = "__stat";
pub const STATUS_MESSAGE: &str = "__stMsg";
pub const IS_APPLICATION_ERROR: &str = "__apErr";
pub const INVALID_PROPERTY_NAME: &str = "__propName";
pub const INVALID_PROPERTY_VALUE: &str = "__propVal";
pub const REQUEST_PROTOCOL_VERSION: &str = "__requestProtVer";
pub const SUPPORTED_MAJOR_VERSIONS: &str = "__supProtMajVer";

// Display names for MQTT publish properties, used in error reports.
pub const CORRELATION_DATA: &str = "Correlation Data";
pub const RESPONSE_TOPIC: &str = "Response Topic";
pub const MESSAGE_EXPIRY: &str = "Message Expiry";
pub const CONTENT_TYPE: &str = "Content Type";
pub const FORMAT_INDICATOR: &str = "Payload Format Indicator";

/// `CloudEvents` attribute names (MQTT binding, carried as user properties).
pub mod cloud_event {
    pub const SPEC_VERSION: &str = "specversion";
    pub const TYPE: &str = "type";
    pub const SOURCE: &str = "source";
    pub const ID: &str = "id";
    pub const TIME: &str = "time";
    pub const SUBJECT: &str = "subject";
    pub const DATA_SCHEMA: &str = "dataschema";

    pub const ALL: &[&str] = &[SPEC_VERSION, TYPE, SOURCE, ID, TIME, SUBJECT, DATA_SCHEMA];
}

/// Returns `true` for user properties owned by the protocol.
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

/// User properties that are neither protocol headers nor `excluded`.
#[must_use]
pub fn custom_user_data(properties: &[(String, String)], excluded: &[&str]) -> Vec<(String, String)> {
    properties
        .iter()
        .filter(|(k, _)| !is_reserved(k) && !excluded.contains(&k.as_str()))
        .cloned()
        .collect()
}
