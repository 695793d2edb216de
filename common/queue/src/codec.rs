use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to serialize: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error("received empty payload")]
    Empty,
}

/// Turns events into record payloads and back.
///
/// Implementations must round-trip: decoding an encoded event yields an equal
/// event.
pub trait Codec<E>: Send + Sync {
    fn encode(&self, event: &E) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, payload: &[u8]) -> Result<E, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<E> Codec<E> for JsonCodec
where
    E: Serialize + DeserializeOwned,
{
    fn encode(&self, event: &E) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(event).map_err(CodecError::Serialize)
    }

    fn decode(&self, payload: &[u8]) -> Result<E, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::Empty);
        }
        serde_json::from_slice(payload).map_err(CodecError::Deserialize)
    }
}
