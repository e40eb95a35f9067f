//! JSON codec for [`Envelope`]s.
//!
//! JSON keeps the wire format readable and interoperable with any peer that
//! speaks the same envelope shape; the cipher and wrap stages treat the
//! output as opaque bytes.

use thiserror::Error;

use crate::protocol::envelope::Envelope;

/// Errors that can occur while serializing or parsing an envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    /// The bytes are not a valid JSON envelope.
    #[error("failed to decode envelope: {0}")]
    Decode(String),
}

/// Serializes `envelope` to UTF-8 JSON bytes.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails (e.g. a map with
/// non-string keys inside `data`).
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(envelope).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Parses an envelope from UTF-8 JSON bytes.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for invalid UTF-8, invalid JSON, or JSON
/// that lacks the required envelope fields.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}
