//! Argument and result serialization strategies
//!
//! A task and every invocation of it use the same strategy. Queue messages do
//! not say which one was used; the worker learns it from the task registry.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Error type for serialization failures
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    /// JSON encoding or decoding failed
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding failed
    #[error("msgpack encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding failed
    #[error("msgpack decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Payload was not valid base64
    #[error("invalid payload encoding: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Serialization strategy for call arguments and outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Serializer {
    /// Plain JSON text.
    ///
    /// Restricted to JSON-representable data, which makes it usable by
    /// producers written in other languages.
    Json,

    /// Base64-wrapped MessagePack.
    ///
    /// Handles any serde data model value, including maps with non-string
    /// keys and raw byte buffers.
    #[default]
    MessagePack,
}

impl Serializer {
    /// Encode `value` into a transportable string
    pub fn serialize<T>(&self, value: &T) -> Result<String, SerializationError>
    where
        T: Serialize + ?Sized,
    {
        match self {
            Self::Json => Ok(serde_json::to_string(value)?),
            Self::MessagePack => {
                let bytes = rmp_serde::to_vec_named(value)?;
                Ok(STANDARD.encode(bytes))
            }
        }
    }

    /// Decode a string produced by [`Serializer::serialize`]
    pub fn deserialize<T>(&self, blob: &str) -> Result<T, SerializationError>
    where
        T: DeserializeOwned,
    {
        match self {
            Self::Json => Ok(serde_json::from_str(blob)?),
            Self::MessagePack => {
                let bytes = STANDARD.decode(blob)?;
                Ok(rmp_serde::from_slice(&bytes)?)
            }
        }
    }

    /// Short identifier used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MessagePack => "msgpack",
        }
    }
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
