//! ---
//! courier_section: "02-messaging-envelope"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Pluggable body codecs."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use serde_json::Value as JsonValue;

use crate::Result;

/// Turns envelope bodies into transport bytes and back.
pub trait Codec: Send + Sync {
    /// Tag attached to outgoing message properties.
    fn content_type(&self) -> &'static str;
    /// Encode a body.
    fn encode(&self, value: &JsonValue) -> Result<Vec<u8>>;
    /// Decode a body previously produced by [`Codec::encode`].
    fn decode(&self, bytes: &[u8]) -> Result<JsonValue>;
}

/// JSON codec, the default for every component.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, value: &JsonValue) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<JsonValue> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact binary codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn content_type(&self) -> &'static str {
        "application/cbor"
    }

    fn encode(&self, value: &JsonValue) -> Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<JsonValue> {
        Ok(serde_cbor::from_slice(bytes)?)
    }
}
