//! Mapping between [`ProtocolError`] and response status headers.
//!
//! Executors report failures as an HTTP-style status code in `__stat` plus a
//! few qualifying user properties; invokers rebuild the error from them.
//!
//! | Status | Extra headers                          | Kind                        |
//! |--------|----------------------------------------|-----------------------------|
//! | 400    | none                                   | `PayloadInvalid`            |
//! | 400    | `__propName`                           | `HeaderMissing`             |
//! | 400    | `__propName`, `__propVal`              | `HeaderInvalid`             |
//! | 408    | `__propName`, `__propVal` (timeout)    | `Timeout`                   |
//! | 415    | `__propName`, `__propVal`              | `HeaderInvalid`             |
//! | 422    | `__apErr`                              | `InvocationException`       |
//! | 500    | `__apErr=true`                         | `ExecutionException`        |
//! | 500    | `__propName`                           | `InternalLogicError`        |
//! | 500    | none                                   | `UnknownError`              |
//! | 503    | optional `__propName`                  | `StateInvalid`              |
//! | 505    | `__requestProtVer`, `__supProtMajVer`  | `UnsupportedRequestVersion` |

use std::time::Duration;

use courier_core::headers;
use courier_core::{CodecError, ErrorKind, ProtocolError, ProtocolVersion, PublishProperties};
use http::StatusCode;

/// Timeout name reported when a handler outlives its request's expiry.
pub const EXECUTION_TIMEOUT: &str = "ExecutionTimeout";

fn is_content_header(name: Option<&str>) -> bool {
    matches!(name, Some(headers::CONTENT_TYPE | headers::FORMAT_INDICATOR))
}

/// Status code an executor reports for `err`.
#[must_use]
pub fn status_for(err: &ProtocolError) -> StatusCode {
    match err.kind() {
        ErrorKind::HeaderInvalid if is_content_header(err.header_name()) => {
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        }
        ErrorKind::PayloadInvalid | ErrorKind::HeaderMissing | ErrorKind::HeaderInvalid => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::InvocationException => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::StateInvalid => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::UnsupportedRequestVersion => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
        ErrorKind::ExecutionException
        | ErrorKind::InternalLogicError
        | ErrorKind::UnknownError
        | ErrorKind::Cancellation
        | ErrorKind::ConfigurationInvalid
        | ErrorKind::ArgumentInvalid
        | ErrorKind::TransportError
        | ErrorKind::UnsupportedResponseVersion => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Writes `err` into the user properties of an error response.
pub fn write_error(err: &ProtocolError, properties: &mut PublishProperties) {
    let status = status_for(err);
    properties.push_user_property(headers::STATUS, status.as_u16().to_string());
    properties.push_user_property(headers::STATUS_MESSAGE, err.message());

    let mut push = |name: &str, value: Option<&str>| {
        if let Some(value) = value {
            properties.push_user_property(name, value);
        }
    };

    match err.kind() {
        ErrorKind::HeaderMissing => push(headers::INVALID_PROPERTY_NAME, err.header_name()),
        ErrorKind::HeaderInvalid => {
            push(headers::INVALID_PROPERTY_NAME, err.header_name());
            push(headers::INVALID_PROPERTY_VALUE, Some(err.header_value().unwrap_or_default()));
        }
        ErrorKind::Timeout => {
            push(headers::INVALID_PROPERTY_NAME, err.timeout_name());
            let millis = err.timeout_value().map(|d| d.as_millis().to_string());
            push(headers::INVALID_PROPERTY_VALUE, millis.as_deref());
        }
        ErrorKind::InvocationException => {
            push(headers::IS_APPLICATION_ERROR, Some(bool_str(err.in_application())));
            push(headers::INVALID_PROPERTY_NAME, err.property_name());
            push(headers::INVALID_PROPERTY_VALUE, err.property_value());
        }
        ErrorKind::ExecutionException => {
            push(headers::IS_APPLICATION_ERROR, Some("true"));
            push(headers::INVALID_PROPERTY_NAME, err.property_name());
            push(headers::INVALID_PROPERTY_VALUE, err.property_value());
        }
        ErrorKind::InternalLogicError | ErrorKind::StateInvalid => {
            push(headers::INVALID_PROPERTY_NAME, err.property_name());
            push(headers::INVALID_PROPERTY_VALUE, err.property_value());
        }
        ErrorKind::UnsupportedRequestVersion => {
            push(headers::REQUEST_PROTOCOL_VERSION, err.protocol_version());
            let majors = err
                .supported_major_versions()
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            push(headers::SUPPORTED_MAJOR_VERSIONS, Some(majors.as_str()));
        }
        _ => {}
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Interprets the status headers of a response.
///
/// Returns `Ok(())` for a success status and the reconstructed remote error
/// otherwise.
///
/// # Errors
///
/// A missing or unparsable status is reported as a local `HeaderMissing` or
/// `HeaderInvalid`; any failure status is returned as a remote error.
pub fn read_status(properties: &PublishProperties) -> Result<(), ProtocolError> {
    let Some(raw) = properties.user_property(headers::STATUS) else {
        return Err(ProtocolError::header_missing(headers::STATUS));
    };
    let status = raw
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ProtocolError::header_invalid(headers::STATUS, raw))?;

    if status.is_success() {
        return Ok(());
    }

    let message = properties
        .user_property(headers::STATUS_MESSAGE)
        .map_or_else(
            || status.canonical_reason().unwrap_or("error").to_string(),
            str::to_string,
        );
    let prop_name = properties.user_property(headers::INVALID_PROPERTY_NAME);
    let prop_value = properties.user_property(headers::INVALID_PROPERTY_VALUE);
    let application = properties.user_property(headers::IS_APPLICATION_ERROR) == Some("true");

    let err = match status {
        StatusCode::BAD_REQUEST => match (prop_name, prop_value) {
            (Some(name), Some(value)) => ProtocolError::header_invalid(name, value),
            (Some(name), None) => ProtocolError::header_missing(name),
            _ => ProtocolError::payload_invalid(message),
        },
        StatusCode::UNSUPPORTED_MEDIA_TYPE => ProtocolError::header_invalid(
            prop_name.unwrap_or(headers::CONTENT_TYPE),
            prop_value.unwrap_or_default(),
        ),
        StatusCode::REQUEST_TIMEOUT => {
            let value = prop_value
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(Duration::ZERO, Duration::from_millis);
            ProtocolError::timeout(prop_name.unwrap_or(EXECUTION_TIMEOUT), value)
        }
        StatusCode::UNPROCESSABLE_ENTITY => with_optional_property(
            ProtocolError::invocation_exception(message, application),
            prop_name,
            prop_value,
        ),
        StatusCode::INTERNAL_SERVER_ERROR if application => with_optional_property(
            ProtocolError::execution_exception(message),
            prop_name,
            prop_value,
        ),
        StatusCode::INTERNAL_SERVER_ERROR => match prop_name {
            Some(name) => ProtocolError::internal_logic(name, message)
                .with_property(name, prop_value.map(str::to_string)),
            None => ProtocolError::unknown(message),
        },
        StatusCode::SERVICE_UNAVAILABLE => with_optional_property(
            ProtocolError::state_invalid(None, message),
            prop_name,
            prop_value,
        ),
        StatusCode::HTTP_VERSION_NOT_SUPPORTED => ProtocolError::unsupported_request_version(
            properties
                .user_property(headers::REQUEST_PROTOCOL_VERSION)
                .unwrap_or_default(),
            properties
                .user_property(headers::SUPPORTED_MAJOR_VERSIONS)
                .map(ProtocolVersion::parse_majors)
                .unwrap_or_default(),
        ),
        other => ProtocolError::unknown(format!("unexpected status {}: {message}", other.as_u16())),
    };
    Err(err.into_remote())
}

fn with_optional_property(
    err: ProtocolError,
    name: Option<&str>,
    value: Option<&str>,
) -> ProtocolError {
    match name {
        Some(name) => err.with_property(name, value.map(str::to_string)),
        None => err,
    }
}

/// Maps a codec failure on an inbound message to the protocol error the peer sees.
#[must_use]
pub fn decode_error(err: CodecError) -> ProtocolError {
    match &err {
        CodecError::UnsupportedContentType { actual, .. } => {
            ProtocolError::header_invalid(headers::CONTENT_TYPE, actual.clone())
        }
        CodecError::UnsupportedFormat { actual, .. } => {
            ProtocolError::header_invalid(headers::FORMAT_INDICATOR, format!("{actual:?}"))
        }
        CodecError::Encode(_) | CodecError::Decode(_) => {
            ProtocolError::payload_invalid(err.to_string()).with_source(err)
        }
    }
}

/// Checks the `__protVer` header. An absent header means the current version.
///
/// # Errors
///
/// Returns the error built by `reject` when the version is unparsable or its
/// major version is not supported.
pub fn check_version(
    properties: &PublishProperties,
    reject: fn(String, Vec<u16>) -> ProtocolError,
) -> Result<ProtocolVersion, ProtocolError> {
    let Some(raw) = properties.user_property(headers::PROTOCOL_VERSION) else {
        return Ok(ProtocolVersion::CURRENT);
    };
    match raw.parse::<ProtocolVersion>() {
        Ok(version) if version.is_supported() => Ok(version),
        _ => Err(reject(raw.to_string(), ProtocolVersion::SUPPORTED_MAJOR.to_vec())),
    }
}

/// Rounds a duration up to whole seconds for the message expiry property.
///
/// Returns `None` when the duration does not fit the 32-bit property.
#[must_use]
pub fn expiry_seconds(duration: Duration) -> Option<u32> {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    u32::try_from(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(err: &ProtocolError) -> ProtocolError {
        let mut props = PublishProperties::default();
        write_error(err, &mut props);
        read_status(&props).unwrap_err()
    }

    #[test]
    fn header_missing_travels_as_400_with_name_only() {
        let err = ProtocolError::header_missing(headers::CORRELATION_DATA);
        assert_eq!(status_for(&err), StatusCode::BAD_REQUEST);

        let back = round_trip(&err);
        assert_eq!(back.kind(), ErrorKind::HeaderMissing);
        assert_eq!(back.header_name(), Some("Correlation Data"));
        assert!(back.is_remote());
    }

    #[test]
    fn content_type_mismatch_is_415() {
        let err = ProtocolError::header_invalid(headers::CONTENT_TYPE, "text/plain");
        assert_eq!(status_for(&err), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        let back = round_trip(&err);
        assert_eq!(back.kind(), ErrorKind::HeaderInvalid);
        assert_eq!(back.header_value(), Some("text/plain"));
    }

    #[test]
    fn payload_invalid_is_bare_400() {
        let back = round_trip(&ProtocolError::payload_invalid("bad json"));
        assert_eq!(back.kind(), ErrorKind::PayloadInvalid);
        assert_eq!(back.message(), "bad json");
    }

    #[test]
    fn execution_timeout_keeps_name_and_value() {
        let err = ProtocolError::timeout(EXECUTION_TIMEOUT, Duration::from_millis(1500));
        let back = round_trip(&err);
        assert_eq!(back.kind(), ErrorKind::Timeout);
        assert_eq!(back.timeout_name(), Some(EXECUTION_TIMEOUT));
        assert_eq!(back.timeout_value(), Some(Duration::from_millis(1500)));
        assert!(back.is_remote());
    }

    #[test]
    fn application_and_invocation_failures_are_distinguished() {
        let exec = round_trip(
            &ProtocolError::execution_exception("insufficient funds")
                .with_property("amount", Some("-1".into())),
        );
        assert_eq!(exec.kind(), ErrorKind::ExecutionException);
        assert!(exec.in_application());
        assert_eq!(exec.property_name(), Some("amount"));

        let invocation = round_trip(&ProtocolError::invocation_exception("handler panicked", false));
        assert_eq!(invocation.kind(), ErrorKind::InvocationException);
        assert!(!invocation.in_application());
    }

    #[test]
    fn internal_logic_and_unknown_share_500() {
        let internal = round_trip(&ProtocolError::internal_logic("response", "encode failed"));
        assert_eq!(internal.kind(), ErrorKind::InternalLogicError);
        assert_eq!(internal.property_name(), Some("response"));

        let unknown = round_trip(&ProtocolError::unknown("???"));
        assert_eq!(unknown.kind(), ErrorKind::UnknownError);
    }

    #[test]
    fn state_invalid_and_versions_round_trip() {
        let state = round_trip(&ProtocolError::state_invalid(
            Some("max_concurrent_handlers".into()),
            "busy",
        ));
        assert_eq!(state.kind(), ErrorKind::StateInvalid);
        assert_eq!(state.property_name(), Some("max_concurrent_handlers"));

        let version = round_trip(&ProtocolError::unsupported_request_version("9.0", vec![1, 2]));
        assert_eq!(version.kind(), ErrorKind::UnsupportedRequestVersion);
        assert_eq!(version.protocol_version(), Some("9.0"));
        assert_eq!(version.supported_major_versions(), &[1, 2]);
    }

    #[test]
    fn success_and_malformed_status() {
        let mut ok = PublishProperties::default();
        ok.push_user_property(headers::STATUS, "200");
        assert!(read_status(&ok).is_ok());

        let missing = read_status(&PublishProperties::default()).unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::HeaderMissing);
        assert!(!missing.is_remote());

        let mut garbage = PublishProperties::default();
        garbage.push_user_property(headers::STATUS, "abc");
        assert_eq!(read_status(&garbage).unwrap_err().kind(), ErrorKind::HeaderInvalid);
    }

    #[test]
    fn version_check() {
        let mut props = PublishProperties::default();
        assert_eq!(
            check_version(&props, ProtocolError::unsupported_request_version).unwrap(),
            ProtocolVersion::CURRENT
        );
        props.push_user_property(headers::PROTOCOL_VERSION, "2.0");
        let err = check_version(&props, ProtocolError::unsupported_request_version).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedRequestVersion);
        assert_eq!(err.supported_major_versions(), ProtocolVersion::SUPPORTED_MAJOR);
    }

    #[test]
    fn expiry_rounds_up() {
        assert_eq!(expiry_seconds(Duration::from_millis(100)), Some(1));
        assert_eq!(expiry_seconds(Duration::from_secs(3)), Some(3));
        assert_eq!(expiry_seconds(Duration::from_millis(3001)), Some(4));
        assert_eq!(expiry_seconds(Duration::from_secs(u64::from(u32::MAX) + 1)), None);
    }
}
