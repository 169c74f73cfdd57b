//! Serializer capability.
//!
//! Backends never pick an encoding themselves: they receive a `Serializer`
//! at construction and use it for event bodies, headers and snapshot
//! payloads. `JsonSerializer` is configured explicitly through
//! `SerializerOptions`; there is no process-wide default instance.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Errors raised while encoding or decoding stored values.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

pub type Result<T> = std::result::Result<T, SerializationError>;

/// Turns JSON values into bytes and back.
///
/// Object safe so it can be shared as `Arc<dyn Serializer>`.
pub trait Serializer: Send + Sync {
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// Serialize any `Serialize` type through a `Serializer`.
pub fn serialize_typed<T: Serialize + ?Sized>(
    serializer: &dyn Serializer,
    value: &T,
) -> Result<Vec<u8>> {
    serializer.serialize(&serde_json::to_value(value)?)
}

/// Deserialize bytes produced by `serialize_typed`.
pub fn deserialize_typed<T: DeserializeOwned>(
    serializer: &dyn Serializer,
    bytes: &[u8],
) -> Result<T> {
    Ok(serde_json::from_value(serializer.deserialize(bytes)?)?)
}

/// Options for `JsonSerializer`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SerializerOptions {
    /// Emit indented JSON. Useful when inspecting rows by hand.
    pub pretty: bool,
}

/// UTF-8 JSON encoding.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer {
    options: SerializerOptions,
}

impl JsonSerializer {
    pub fn new(options: SerializerOptions) -> Self {
        Self { options }
    }
}

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        if self.options.pretty {
            Ok(serde_json::to_vec_pretty(value)?)
        } else {
            Ok(serde_json::to_vec(value)?)
        }
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        let text = std::str::from_utf8(bytes)?;
        Ok(serde_json::from_str(text)?)
    }
}
