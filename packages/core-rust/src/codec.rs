//! Payload codecs keyed by content type.
//!
//! The protocol engine is generic over [`PayloadCodec`]; the built-in codecs
//! cover JSON, named-field `MsgPack`, raw bytes and empty payloads.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::FormatIndicator;

/// Errors raised while encoding or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("content type {actual:?} does not match expected {expected:?}")]
    UnsupportedContentType { expected: String, actual: String },
    #[error("payload format indicator {actual:?} does not match expected {expected:?}")]
    UnsupportedFormat {
        expected: FormatIndicator,
        actual: FormatIndicator,
    },
    #[error("failed to encode payload: {0}")]
    Encode(String),
    #[error("failed to decode payload: {0}")]
    Decode(String),
}

/// Encode/decode capability for one payload type.
pub trait PayloadCodec<T>: Send + Sync + 'static {
    /// Content type advertised on the wire. Empty means none.
    fn content_type(&self) -> &str;

    fn format_indicator(&self) -> FormatIndicator;

    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if `value` cannot be represented.
    fn encode(&self, value: &T) -> Result<Bytes, CodecError>;

    /// # Errors
    ///
    /// Returns an error if the declared content type or format does not match
    /// this codec, or the bytes are not a valid encoding of `T`.
    fn decode(
        &self,
        payload: &[u8],
        content_type: Option<&str>,
        format_indicator: FormatIndicator,
    ) -> Result<T, CodecError>;

    /// Checks the declared content type and format against this codec.
    ///
    /// # Errors
    ///
    /// Returns the mismatch that was found.
    fn check_declared(
        &self,
        content_type: Option<&str>,
        format_indicator: FormatIndicator,
    ) -> Result<(), CodecError> {
        if let Some(actual) = content_type {
            if !self.content_type().is_empty() && actual != self.content_type() {
                return Err(CodecError::UnsupportedContentType {
                    expected: self.content_type().to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        // Utf8 declared on a binary codec's payload is tolerated; the reverse is not.
        if self.format_indicator() == FormatIndicator::Utf8
            && format_indicator != FormatIndicator::Utf8
            && content_type.is_some()
        {
            return Err(CodecError::UnsupportedFormat {
                expected: self.format_indicator(),
                actual: format_indicator,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// `application/json` via `serde_json`.
#[derive(Debug)]
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> PayloadCodec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn format_indicator(&self) -> FormatIndicator {
        FormatIndicator::Utf8
    }

    fn encode(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(
        &self,
        payload: &[u8],
        content_type: Option<&str>,
        format_indicator: FormatIndicator,
    ) -> Result<T, CodecError> {
        self.check_declared(content_type, format_indicator)?;
        serde_json::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// MsgPack
// ---------------------------------------------------------------------------

/// `application/msgpack` via `rmp-serde`, with named struct fields.
#[derive(Debug)]
pub struct MsgPackCodec<T>(PhantomData<fn() -> T>);

impl<T> Default for MsgPackCodec<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> PayloadCodec<T> for MsgPackCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn content_type(&self) -> &str {
        "application/msgpack"
    }

    fn format_indicator(&self) -> FormatIndicator {
        FormatIndicator::Unspecified
    }

    fn encode(&self, value: &T) -> Result<Bytes, CodecError> {
        rmp_serde::to_vec_named(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(
        &self,
        payload: &[u8],
        content_type: Option<&str>,
        format_indicator: FormatIndicator,
    ) -> Result<T, CodecError> {
        self.check_declared(content_type, format_indicator)?;
        rmp_serde::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Raw bytes
// ---------------------------------------------------------------------------

/// `application/octet-stream`, payload passed through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl PayloadCodec<Bytes> for RawCodec {
    fn content_type(&self) -> &str {
        "application/octet-stream"
    }

    fn format_indicator(&self) -> FormatIndicator {
        FormatIndicator::Unspecified
    }

    fn encode(&self, value: &Bytes) -> Result<Bytes, CodecError> {
        Ok(value.clone())
    }

    fn decode(
        &self,
        payload: &[u8],
        _content_type: Option<&str>,
        _format_indicator: FormatIndicator,
    ) -> Result<Bytes, CodecError> {
        // Raw payloads accept any declared content type.
        Ok(Bytes::copy_from_slice(payload))
    }
}

// ---------------------------------------------------------------------------
// Empty
// ---------------------------------------------------------------------------

/// Unit payloads for commands without request or response data.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyCodec;

impl PayloadCodec<()> for EmptyCodec {
    fn content_type(&self) -> &str {
        ""
    }

    fn format_indicator(&self) -> FormatIndicator {
        FormatIndicator::Unspecified
    }

    fn encode(&self, _value: &()) -> Result<Bytes, CodecError> {
        Ok(Bytes::new())
    }

    fn decode(
        &self,
        payload: &[u8],
        _content_type: Option<&str>,
        _format_indicator: FormatIndicator,
    ) -> Result<(), CodecError> {
        if payload.is_empty() {
            Ok(())
        } else {
            Err(CodecError::Decode(format!(
                "expected empty payload, got {} bytes",
                payload.len()
            )))
        }
    }
}
