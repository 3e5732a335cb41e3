//! Codec for encoding and decoding Chorus envelopes.
//!
//! Text frames carry JSON; binary frames carry MessagePack. The WebSocket
//! layer already frames messages, so no length prefix is added.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum encoded envelope size (1 MB).
pub const MAX_ENVELOPE_SIZE: usize = 1_000_000;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {1}")]
    TooLarge(usize, usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Structurally valid but semantically invalid envelope.
    #[error("Invalid envelope: {0}")]
    Invalid(&'static str),
}

/// Wire encoding negotiated per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// JSON in text frames.
    #[default]
    Json,
    /// MessagePack in binary frames.
    MessagePack,
}

impl Encoding {
    /// Parse the `format` query value a client connects with.
    #[must_use]
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("msgpack") | Some("messagepack") => Encoding::MessagePack,
            _ => Encoding::Json,
        }
    }
}

/// Encode an envelope as a JSON string.
///
/// # Errors
///
/// Returns an error if serialization fails or the result is too large.
pub fn encode_json(envelope: &Envelope) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(envelope)?;
    if text.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(text.len(), MAX_ENVELOPE_SIZE));
    }
    Ok(text)
}

/// Encode an envelope as MessagePack.
///
/// # Errors
///
/// Returns an error if serialization fails or the result is too large.
pub fn encode_msgpack(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let data = rmp_serde::to_vec_named(envelope)?;
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(data.len(), MAX_ENVELOPE_SIZE));
    }
    Ok(Bytes::from(data))
}

/// Decode an envelope from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large, malformed or fails validation.
pub fn decode_json(text: &str, max_size: usize) -> Result<Envelope, ProtocolError> {
    if text.len() > max_size {
        return Err(ProtocolError::TooLarge(text.len(), max_size));
    }
    let envelope: Envelope = serde_json::from_str(text)?;
    envelope.validate().map_err(ProtocolError::Invalid)?;
    Ok(envelope)
}

/// Decode an envelope from MessagePack bytes.
///
/// # Errors
///
/// Returns an error if the data is too large, malformed or fails validation.
pub fn decode_msgpack(data: &[u8], max_size: usize) -> Result<Envelope, ProtocolError> {
    if data.len() > max_size {
        return Err(ProtocolError::TooLarge(data.len(), max_size));
    }
    let envelope: Envelope = rmp_serde::from_slice(data)?;
    envelope.validate().map_err(ProtocolError::Invalid)?;
    Ok(envelope)
}

/// Codec bound to a connection's encoding and size limit.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    encoding: Encoding,
    max_size: usize,
}

impl EnvelopeCodec {
    /// Create a codec.
    #[must_use]
    pub fn new(encoding: Encoding, max_size: usize) -> Self {
        Self {
            encoding,
            max_size: max_size.min(MAX_ENVELOPE_SIZE),
        }
    }

    /// The negotiated encoding.
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Decode a text frame. Text is always JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails.
    pub fn decode_text(&self, text: &str) -> Result<Envelope, ProtocolError> {
        decode_json(text, self.max_size)
    }

    /// Decode a binary frame. Binary is always MessagePack.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails.
    pub fn decode_binary(&self, data: &[u8]) -> Result<Envelope, ProtocolError> {
        decode_msgpack(data, self.max_size)
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(Encoding::Json, MAX_ENVELOPE_SIZE)
    }
}
