//! Payload serialization.
//!
//! The bus never shares a serializer instance between concurrent calls: a
//! fresh `S::default()` is built for every serialization and every
//! deserialization, so stateful serializers need no locking.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

/// Pluggable payload codec.
pub trait Serializer: Default + Send + Sync + 'static {
    /// Content type of the encoded payload, reported in send diagnostics.
    fn content_type(&self) -> &'static str;

    /// Serialize a payload.
    fn serialize<T: Serialize>(&mut self, value: &T) -> Result<Bytes>;

    /// Deserialize a payload into `T`.
    fn deserialize<T: DeserializeOwned>(&mut self, bytes: &[u8]) -> Result<T>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize<T: Serialize>(&mut self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize<T: DeserializeOwned>(&mut self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
