//! Error taxonomy shared by every protocol component.
//!
//! A [`ProtocolError`] carries exactly one [`ErrorKind`]. Client-local kinds are
//! detected inside the calling process and never cross the wire; remote kinds
//! may be produced by a peer and travel back in response headers. Each kind has
//! a dedicated constructor that demands the context meaningful to it, and the
//! error exposes that context through accessors only.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // Client-local.
    Timeout,
    Cancellation,
    ConfigurationInvalid,
    ArgumentInvalid,
    TransportError,
    // Remote / protocol.
    HeaderMissing,
    HeaderInvalid,
    PayloadInvalid,
    StateInvalid,
    InternalLogicError,
    UnknownError,
    InvocationException,
    ExecutionException,
    UnsupportedRequestVersion,
    UnsupportedResponseVersion,
}

impl ErrorKind {
    /// Returns `true` for kinds that are only ever raised inside the local process.
    ///
    /// `Timeout` is listed here even though an executor may also report one.
    #[must_use]
    pub fn is_client_local(self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::Cancellation
                | Self::ConfigurationInvalid
                | Self::ArgumentInvalid
                | Self::TransportError
        )
    }

    /// Stable name used in logs and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Cancellation => "cancellation",
            Self::ConfigurationInvalid => "configuration_invalid",
            Self::ArgumentInvalid => "argument_invalid",
            Self::TransportError => "transport_error",
            Self::HeaderMissing => "header_missing",
            Self::HeaderInvalid => "header_invalid",
            Self::PayloadInvalid => "payload_invalid",
            Self::StateInvalid => "state_invalid",
            Self::InternalLogicError => "internal_logic_error",
            Self::UnknownError => "unknown_error",
            Self::InvocationException => "invocation_exception",
            Self::ExecutionException => "execution_exception",
            Self::UnsupportedRequestVersion => "unsupported_request_version",
            Self::UnsupportedResponseVersion => "unsupported_response_version",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nested cause attached to an error. Shared so errors stay cheaply cloneable.
pub type ErrorSource = Arc<dyn StdError + Send + Sync + 'static>;

/// Structured protocol error. Immutable once handed to a caller.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ProtocolError {
    kind: ErrorKind,
    message: String,
    property_name: Option<String>,
    property_value: Option<String>,
    header_name: Option<String>,
    header_value: Option<String>,
    timeout_name: Option<String>,
    timeout_value: Option<Duration>,
    command_name: Option<String>,
    request_protocol_version: Option<String>,
    supported_major_versions: Vec<u16>,
    is_shallow: bool,
    is_remote: bool,
    in_application: bool,
    #[source]
    source: Option<ErrorSource>,
}

impl ProtocolError {
    fn bare(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            property_name: None,
            property_value: None,
            header_name: None,
            header_value: None,
            timeout_name: None,
            timeout_value: None,
            command_name: None,
            request_protocol_version: None,
            supported_major_versions: Vec::new(),
            is_shallow: false,
            is_remote: false,
            in_application: false,
            source: None,
        }
    }

    // -----------------------------------------------------------------------
    // Client-local constructors
    // -----------------------------------------------------------------------

    /// The named timeout of `value` elapsed before the operation completed.
    #[must_use]
    pub fn timeout(timeout_name: impl Into<String>, value: Duration) -> Self {
        let timeout_name = timeout_name.into();
        let mut err = Self::bare(
            ErrorKind::Timeout,
            format!("{timeout_name} of {}ms elapsed", value.as_millis()),
        );
        err.timeout_name = Some(timeout_name);
        err.timeout_value = Some(value);
        err
    }

    /// The caller abandoned the operation.
    #[must_use]
    pub fn cancellation(message: impl Into<String>) -> Self {
        Self::bare(ErrorKind::Cancellation, message)
    }

    /// A component was configured with an unusable value. Always shallow.
    #[must_use]
    pub fn configuration_invalid(
        property_name: impl Into<String>,
        property_value: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut err = Self::bare(ErrorKind::ConfigurationInvalid, message);
        err.property_name = Some(property_name.into());
        err.property_value = property_value;
        err.is_shallow = true;
        err
    }

    /// A call was made with an unusable argument. Always shallow.
    #[must_use]
    pub fn argument_invalid(
        property_name: impl Into<String>,
        property_value: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut err = Self::bare(ErrorKind::ArgumentInvalid, message);
        err.property_name = Some(property_name.into());
        err.property_value = property_value;
        err.is_shallow = true;
        err
    }

    /// The transport failed to carry out a local publish/subscribe request.
    #[must_use]
    pub fn transport(message: impl Into<String>, cause: anyhow::Error) -> Self {
        let boxed: Box<dyn StdError + Send + Sync + 'static> = cause.into();
        let mut err = Self::bare(ErrorKind::TransportError, message);
        err.source = Some(Arc::from(boxed));
        err
    }

    // -----------------------------------------------------------------------
    // Remote / protocol constructors
    // -----------------------------------------------------------------------

    /// A required header was absent.
    #[must_use]
    pub fn header_missing(header_name: impl Into<String>) -> Self {
        let header_name = header_name.into();
        let mut err = Self::bare(
            ErrorKind::HeaderMissing,
            format!("required header {header_name:?} is missing"),
        );
        err.header_name = Some(header_name);
        err
    }

    /// A header was present but carried an unusable value.
    #[must_use]
    pub fn header_invalid(header_name: impl Into<String>, header_value: impl Into<String>) -> Self {
        let header_name = header_name.into();
        let header_value = header_value.into();
        let mut err = Self::bare(
            ErrorKind::HeaderInvalid,
            format!("header {header_name:?} has invalid value {header_value:?}"),
        );
        err.header_name = Some(header_name);
        err.header_value = Some(header_value);
        err
    }

    /// The payload could not be encoded or decoded.
    #[must_use]
    pub fn payload_invalid(message: impl Into<String>) -> Self {
        Self::bare(ErrorKind::PayloadInvalid, message)
    }

    /// The peer is not in a state that allows the request to be served.
    #[must_use]
    pub fn state_invalid(property_name: Option<String>, message: impl Into<String>) -> Self {
        let mut err = Self::bare(ErrorKind::StateInvalid, message);
        err.property_name = property_name;
        err
    }

    /// The protocol layer violated one of its own invariants.
    #[must_use]
    pub fn internal_logic(property_name: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::bare(ErrorKind::InternalLogicError, message);
        err.property_name = Some(property_name.into());
        err
    }

    /// A failure that could not be classified.
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::bare(ErrorKind::UnknownError, message)
    }

    /// The handler could not be invoked on the request.
    #[must_use]
    pub fn invocation_exception(message: impl Into<String>, in_application: bool) -> Self {
        let mut err = Self::bare(ErrorKind::InvocationException, message);
        err.in_application = in_application;
        err
    }

    /// The handler's business logic reported a failure.
    #[must_use]
    pub fn execution_exception(message: impl Into<String>) -> Self {
        let mut err = Self::bare(ErrorKind::ExecutionException, message);
        err.in_application = true;
        err
    }

    /// The receiving side does not speak the inbound message's protocol
    /// version. Raised by executors for requests and by telemetry receivers
    /// for telemetry, which has no response of its own.
    #[must_use]
    pub fn unsupported_request_version(
        request_version: impl Into<String>,
        supported_major_versions: Vec<u16>,
    ) -> Self {
        let request_version = request_version.into();
        let mut err = Self::bare(
            ErrorKind::UnsupportedRequestVersion,
            format!(
                "request protocol version {request_version:?} is not supported (supported majors: {supported_major_versions:?})"
            ),
        );
        err.request_protocol_version = Some(request_version);
        err.supported_major_versions = supported_major_versions;
        err
    }

    /// The invoker does not speak the response's protocol version.
    #[must_use]
    pub fn unsupported_response_version(
        response_version: impl Into<String>,
        supported_major_versions: Vec<u16>,
    ) -> Self {
        let response_version = response_version.into();
        let mut err = Self::bare(
            ErrorKind::UnsupportedResponseVersion,
            format!(
                "response protocol version {response_version:?} is not supported (supported majors: {supported_major_versions:?})"
            ),
        );
        err.request_protocol_version = Some(response_version);
        err.supported_major_versions = supported_major_versions;
        err
    }

    // -----------------------------------------------------------------------
    // Qualifiers applied before the error is handed out
    // -----------------------------------------------------------------------

    /// Marks the error as reported by a remote peer.
    #[must_use]
    pub fn into_remote(mut self) -> Self {
        self.is_remote = true;
        self.is_shallow = false;
        self
    }

    /// Marks a client-side error as raised before anything left the process.
    #[must_use]
    pub fn into_shallow(mut self) -> Self {
        self.is_shallow = true;
        self
    }

    /// Attaches the property that triggered the failure.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.property_name = Some(name.into());
        self.property_value = value;
        self
    }

    /// Attaches the timeout that fired on the remote side.
    #[must_use]
    pub fn with_timeout(mut self, name: impl Into<String>, value: Duration) -> Self {
        self.timeout_name = Some(name.into());
        self.timeout_value = Some(value);
        self
    }

    /// Records which command the error belongs to.
    #[must_use]
    pub fn with_command_name(mut self, command_name: impl Into<String>) -> Self {
        self.command_name = Some(command_name.into());
        self
    }

    /// Attaches a nested cause.
    #[must_use]
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn property_name(&self) -> Option<&str> {
        self.property_name.as_deref()
    }

    #[must_use]
    pub fn property_value(&self) -> Option<&str> {
        self.property_value.as_deref()
    }

    #[must_use]
    pub fn header_name(&self) -> Option<&str> {
        self.header_name.as_deref()
    }

    #[must_use]
    pub fn header_value(&self) -> Option<&str> {
        self.header_value.as_deref()
    }

    #[must_use]
    pub fn timeout_name(&self) -> Option<&str> {
        self.timeout_name.as_deref()
    }

    #[must_use]
    pub fn timeout_value(&self) -> Option<Duration> {
        self.timeout_value
    }

    #[must_use]
    pub fn command_name(&self) -> Option<&str> {
        self.command_name.as_deref()
    }

    /// Protocol version the peer presented when a version check failed.
    #[must_use]
    pub fn protocol_version(&self) -> Option<&str> {
        self.request_protocol_version.as_deref()
    }

    #[must_use]
    pub fn supported_major_versions(&self) -> &[u16] {
        &self.supported_major_versions
    }

    /// `true` when the failure happened before any message left the process.
    #[must_use]
    pub fn is_shallow(&self) -> bool {
        self.is_shallow
    }

    /// `true` when the failure was reported by a remote peer.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    /// `true` when the handler's business logic raised the failure intentionally.
    #[must_use]
    pub fn in_application(&self) -> bool {
        self.in_application
    }

    /// Transient failures are the only ones a retry can fix.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Timeout | ErrorKind::TransportError | ErrorKind::StateInvalid
        )
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn header_invalid_carries_name_and_value() {
        let err = ProtocolError::header_invalid("__ts", "garbage");
        assert_eq!(err.kind(), ErrorKind::HeaderInvalid);
        assert_eq!(err.header_name(), Some("__ts"));
        assert_eq!(err.header_value(), Some("garbage"));
        assert!(!err.is_remote());
        assert!(err.to_string().contains("__ts"));
    }

    #[test]
    fn configuration_errors_are_shallow() {
        let err = ProtocolError::configuration_invalid("request_topic_pattern", None, "empty");
        assert!(err.is_shallow());
        assert!(err.kind().is_client_local());
    }

    #[test]
    fn timeout_records_name_and_value() {
        let err = ProtocolError::timeout("CommandTimeout", Duration::from_millis(250));
        assert_eq!(err.timeout_name(), Some("CommandTimeout"));
        assert_eq!(err.timeout_value(), Some(Duration::from_millis(250)));
        assert!(!err.is_shallow());
        assert!(err.is_transient());
    }

    #[test]
    fn transport_error_exposes_cause() {
        let err = ProtocolError::transport("publish failed", anyhow::anyhow!("socket closed"));
        assert_eq!(err.kind(), ErrorKind::TransportError);
        let source = err.source().expect("cause attached");
        assert_eq!(source.to_string(), "socket closed");
    }

    #[test]
    fn remote_qualifier_clears_shallow() {
        let err = ProtocolError::argument_invalid("timeout", Some("0".into()), "zero").into_remote();
        assert!(err.is_remote());
        assert!(!err.is_shallow());
    }

    #[test]
    fn execution_exception_is_in_application() {
        let err = ProtocolError::execution_exception("insufficient funds");
        assert!(err.in_application());
        assert!(!err.kind().is_client_local());
        assert!(!err.is_transient());
    }

    #[test]
    fn unsupported_versions_record_supported_majors() {
        let err = ProtocolError::unsupported_request_version("2.0", vec![1]);
        assert_eq!(err.protocol_version(), Some("2.0"));
        assert_eq!(err.supported_major_versions(), &[1]);
    }
}
