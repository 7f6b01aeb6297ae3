//! CAS payload encoding for the wire.

use std::fmt;
use thiserror::Error;

use crate::cas::Cas;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode CAS: {0}")]
    Encode(String),

    #[error("Failed to decode CAS: {0}")]
    Decode(String),
}

/// Converts a CAS to and from bytes.
///
/// Both ends of a connection must use the same codec.
pub trait CasCodec: Send + Sync + fmt::Debug {
    fn encode(&self, cas: &Cas) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Cas, CodecError>;
}

/// JSON encoding via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCasCodec;

impl CasCodec for JsonCasCodec {
    fn encode(&self, cas: &Cas) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(cas).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Cas, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
