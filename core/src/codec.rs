//! Payload codec.
//!
//! Request bodies are JSON-encoded [`RequestEnvelope`]s. Reply and event
//! bodies are UTF-8 JSON, optionally zlib-compressed; a compressed body is
//! marked with the [`OCTET_STREAM`] content type and inflated before use.
//!
//! Inflation is bounded by [`MAX_INFLATED_SIZE`] so a hostile or corrupt
//! payload cannot exhaust memory.

use crate::event::EventEnvelope;
use crate::request::{CacheRequest, RequestEnvelope};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};
use thiserror::Error;

/// Content type marking a compressed body.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Upper bound on the size of an inflated body (64 MiB).
pub const MAX_INFLATED_SIZE: usize = 64 * 1024 * 1024;

/// Errors produced while decoding a payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The compressed stream is corrupt
    #[error("Failed to inflate payload: {0}")]
    Inflate(String),

    /// The inflated payload exceeds [`MAX_INFLATED_SIZE`]
    #[error("Inflated payload exceeds {limit} bytes")]
    TooLarge {
        /// The configured limit
        limit: usize,
    },

    /// The body is not valid UTF-8
    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    /// The body is not the expected JSON document
    #[error("Malformed JSON payload: {0}")]
    Json(String),
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Whether a body with this content type must be inflated first.
#[must_use]
pub fn is_compressed(content_type: Option<&str>) -> bool {
    content_type == Some(OCTET_STREAM)
}

/// Decode a reply body to text, inflating it if `content_type` says so.
///
/// # Errors
///
/// Returns a [`DecodeError`] if inflation fails or the result is not UTF-8.
pub fn decode_body(content_type: Option<&str>, body: &[u8]) -> Result<String, DecodeError> {
    if is_compressed(content_type) {
        inflate_to_string(body)
    } else {
        String::from_utf8(body.to_vec()).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
    }
}

/// Inflate a zlib stream into a UTF-8 string.
///
/// # Errors
///
/// Returns a [`DecodeError`] if the stream is corrupt, too large, or not UTF-8.
pub fn inflate_to_string(body: &[u8]) -> Result<String, DecodeError> {
    let bytes = inflate(body)?;
    String::from_utf8(bytes).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
}

/// Inflate a zlib stream.
///
/// # Errors
///
/// Returns [`DecodeError::Inflate`] for a corrupt stream and
/// [`DecodeError::TooLarge`] when the output would exceed [`MAX_INFLATED_SIZE`].
pub fn inflate(body: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = ZlibDecoder::new(body);
    let mut inflated = Vec::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = decoder
            .read(&mut buffer)
            .map_err(|e| DecodeError::Inflate(e.to_string()))?;
        if read == 0 {
            break;
        }
        if inflated.len() + read > MAX_INFLATED_SIZE {
            return Err(DecodeError::TooLarge {
                limit: MAX_INFLATED_SIZE,
            });
        }
        inflated.extend_from_slice(&buffer[..read]);
    }

    Ok(inflated)
}

/// Compress `data` into a zlib stream.
///
/// Workers use this to produce [`OCTET_STREAM`] bodies.
#[must_use]
pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    // Writing into a Vec cannot fail.
    encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .unwrap_or_default()
}

/// Serialize a request into its wire body.
///
/// # Errors
///
/// Returns [`DecodeError::Json`] if the payload cannot be represented as JSON.
pub fn encode_request(request: &CacheRequest) -> Result<Vec<u8>, DecodeError> {
    let envelope = request.to_envelope()?;
    Ok(serde_json::to_vec(&envelope)?)
}

/// Parse a request body back into its envelope.
///
/// # Errors
///
/// Returns [`DecodeError::Json`] if the body is not a request envelope.
pub fn decode_request(body: &[u8]) -> Result<RequestEnvelope, DecodeError> {
    Ok(serde_json::from_slice(body)?)
}

/// Decode a broadcast event body.
///
/// Events are compressed unless the delivery explicitly declares another
/// content type.
///
/// # Errors
///
/// Returns a [`DecodeError`] if the body cannot be inflated or parsed.
pub fn decode_event(content_type: Option<&str>, body: &[u8]) -> Result<EventEnvelope, DecodeError> {
    let json = decode_body(content_type.or(Some(OCTET_STREAM)), body)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::request::ById;
    use crate::snowflake::Snowflake;
    use proptest::prelude::*;

    #[test]
    fn plain_bodies_are_returned_as_is() {
        assert_eq!(decode_body(Some("text/plain"), b"hello").unwrap(), "hello");
        assert_eq!(decode_body(None, b"hello").unwrap(), "hello");
    }

    #[test]
    fn compressed_bodies_are_inflated() {
        let body = deflate(br#"{"id":"1"}"#);
        assert_eq!(decode_body(Some(OCTET_STREAM), &body).unwrap(), r#"{"id":"1"}"#);
    }

    #[test]
    fn empty_input_deflates_to_a_valid_stream() {
        let body = deflate(b"");
        assert!(!body.is_empty());
        assert_eq!(inflate(&body).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn corrupt_stream_is_a_decode_error() {
        let err = decode_body(Some(OCTET_STREAM), b"definitely not zlib").unwrap_err();
        assert!(matches!(err, DecodeError::Inflate(_)));
    }

    #[test]
    fn invalid_utf8_is_a_decode_error() {
        let err = decode_body(None, &[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidUtf8(_)));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let huge = vec![b'a'; MAX_INFLATED_SIZE + 1];
        let err = inflate(&deflate(&huge)).unwrap_err();
        assert_eq!(err, DecodeError::TooLarge { limit: MAX_INFLATED_SIZE });
    }

    #[test]
    fn request_body_is_json_envelope() {
        let body = encode_request(&CacheRequest::GetUser(ById::new(Snowflake::new(5)))).unwrap();
        assert_eq!(body, br#"{"t":1,"d":{"id":"5"}}"#);
        assert_eq!(decode_request(&body).unwrap().type_tag, 1);
    }

    #[test]
    fn events_default_to_compressed() {
        let json = br#"{"shard_id":3,"event":{"op":0,"t":"TYPING_START","s":1,"d":{"guild_id":"9"}}}"#;

        let compressed = decode_event(None, &deflate(json)).unwrap();
        assert_eq!(compressed.shard_id, 3);

        let plain = decode_event(Some("application/json"), json).unwrap();
        assert_eq!(plain, compressed);
    }

    proptest! {
        #[test]
        fn inflate_reverses_deflate(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            prop_assert_eq!(inflate(&deflate(&data)).unwrap(), data);
        }
    }
}
