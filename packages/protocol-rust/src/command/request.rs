//! Request and response values exchanged with command handlers.

use std::time::Duration;

use courier_core::topic::CUSTOM_TOKEN_PREFIX;
use courier_core::{ProtocolError, Timestamp, TopicTokens};
use uuid::Uuid;

use crate::fencing::FencingToken;

/// Timeout applied when a request does not set one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// A command request.
///
/// Built by callers of the invoker with the `with_*` methods. On the executor
/// side the protocol fills in the invoker identity, timestamp and correlation
/// id before the value reaches the handler.
#[derive(Debug, Clone)]
pub struct CommandRequest<T> {
    pub payload: T,
    /// User properties outside the reserved `__` namespace.
    pub custom_user_data: Vec<(String, String)>,
    /// Per-call topic tokens, e.g. the target `executorId`.
    pub topic_tokens: TopicTokens,
    /// Invoker: how long to wait for a response. Executor: remaining expiry.
    pub timeout: Duration,
    /// Safe to execute more than once; enables retries and longer caching.
    pub idempotent: bool,
    pub fencing_token: Option<FencingToken>,
    pub invoker_id: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub correlation_id: Option<Uuid>,
}

impl<T> CommandRequest<T> {
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            custom_user_data: Vec::new(),
            topic_tokens: TopicTokens::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            idempotent: false,
            fencing_token: None,
            invoker_id: None,
            timestamp: None,
            correlation_id: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Binds a protocol token such as `executorId` for this call only.
    #[must_use]
    pub fn with_topic_token(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.topic_tokens.insert(name.into(), value.into());
        self
    }

    /// Binds a custom token, referenced in patterns as `{ex:name}`.
    #[must_use]
    pub fn with_custom_topic_token(self, name: &str, value: impl Into<String>) -> Self {
        self.with_topic_token(format!("{CUSTOM_TOKEN_PREFIX}{name}"), value)
    }

    #[must_use]
    pub fn with_fencing_token(mut self, token: FencingToken) -> Self {
        self.fencing_token = Some(token);
        self
    }

    #[must_use]
    pub fn with_user_data(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_user_data.push((name.into(), value.into()));
        self
    }
}

/// A command response.
#[derive(Debug, Clone)]
pub struct CommandResponse<T> {
    pub payload: T,
    pub custom_user_data: Vec<(String, String)>,
    /// Executor's HLC timestamp, present on received responses.
    pub timestamp: Option<Timestamp>,
}

impl<T> CommandResponse<T> {
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            custom_user_data: Vec::new(),
            timestamp: None,
        }
    }

    #[must_use]
    pub fn with_user_data(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_user_data.push((name.into(), value.into()));
        self
    }
}

/// Failure reported by a handler's business logic.
///
/// Reaches the invoker as `ExecutionException` with `in_application` set.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ApplicationError {
    message: String,
    property_name: Option<String>,
    property_value: Option<String>,
}

impl ApplicationError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            property_name: None,
            property_value: None,
        }
    }

    /// Names the input the handler objected to.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.property_name = Some(name.into());
        self.property_value = value;
        self
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ApplicationError> for ProtocolError {
    fn from(err: ApplicationError) -> Self {
        let base = ProtocolError::execution_exception(err.message);
        match err.property_name {
            Some(name) => base.with_property(name, err.property_value),
            None => base,
        }
    }
}

/// Rejects user data that would collide with protocol headers.
pub(crate) fn check_user_data(user_data: &[(String, String)]) -> Result<(), ProtocolError> {
    match user_data
        .iter()
        .find(|(name, _)| courier_core::headers::is_reserved(name))
    {
        Some((name, value)) => Err(ProtocolError::argument_invalid(
            name.clone(),
            Some(value.clone()),
            format!("user property {name:?} uses the reserved \"__\" prefix"),
        )),
        None => Ok(()),
    }
}
