//! Attribute value codecs.
//!
//! The store keeps attribute payloads as opaque bytes. A codec turns typed
//! values into payloads at the facade boundary.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::entry::AttributeValue;
use crate::error::{Error, Result};

/// Converts typed values to and from opaque attribute payloads.
pub trait AttributeCodec: Send + Sync + 'static {
    /// Encode a value.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<AttributeValue>;

    /// Decode a payload.
    fn decode<T: DeserializeOwned>(&self, payload: &AttributeValue) -> Result<T>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl AttributeCodec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<AttributeValue> {
        serde_json::to_vec(value)
            .map(AttributeValue::from)
            .map_err(|e| Error::Codec(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, payload: &AttributeValue) -> Result<T> {
        serde_json::from_slice(payload.as_bytes()).map_err(|e| Error::Codec(e.to_string()))
    }
}
