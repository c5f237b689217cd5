//! ---
//! courier_section: "02-messaging-envelope"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Envelope model exchanged between components."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::codec::Codec;
use crate::{MessagingError, Result};

/// Protocol version stamped on every envelope.
pub const PROTOCOL_VERSION: &str = "2";

fn default_version() -> String {
    PROTOCOL_VERSION.to_owned()
}

/// Top-level envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Fire-and-forget message.
    Message,
    /// Request expecting exactly one reply.
    Rpc,
}

impl Category {
    /// Wire representation of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Message => "message",
            Category::Rpc => "rpc",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit exchanged on the wire.
///
/// `content` always holds a mapping, possibly empty, and `_reserved` is
/// always present. Producers build an envelope right before sending it;
/// consumers only ever mutate their own decoded copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Free-form classification such as `command`, `status` or `result`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Identifier within `kind`.
    pub name: String,
    /// Message or RPC.
    pub category: Category,
    /// Protocol version string.
    #[serde(default = "default_version")]
    pub version: String,
    /// Identity of the producing component.
    #[serde(default)]
    pub fingerprint: Map<String, JsonValue>,
    /// Payload.
    #[serde(default)]
    pub content: Map<String, JsonValue>,
    /// Reserved for future use.
    #[serde(rename = "_reserved", default)]
    pub reserved: Map<String, JsonValue>,
}

impl Envelope {
    /// Construct an empty envelope of the given category, type and name.
    pub fn new(category: Category, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            category,
            version: default_version(),
            fingerprint: Map::new(),
            content: Map::new(),
            reserved: Map::new(),
        }
    }

    /// Plain fire-and-forget message with an empty payload.
    pub fn message(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(Category::Message, kind, name)
    }

    /// Fire-and-forget command carrying `parameters` at `content.parameters`.
    pub fn command(name: impl Into<String>, parameters: JsonValue) -> Self {
        Self::message("command", name).with_content_entry("parameters", parameters)
    }

    /// RPC command; same shape as [`Envelope::command`] with `category = rpc`.
    pub fn rpc_command(name: impl Into<String>, parameters: JsonValue) -> Self {
        Self::new(Category::Rpc, "command", name).with_content_entry("parameters", parameters)
    }

    /// Status broadcast of a component; the status itself is the name.
    pub fn status(status: impl Into<String>) -> Self {
        Self::message("status", status)
    }

    /// Replace the payload.
    pub fn with_content(mut self, content: Map<String, JsonValue>) -> Self {
        self.content = content;
        self
    }

    /// Insert a single payload entry.
    pub fn with_content_entry(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.content.insert(key.into(), value);
        self
    }

    /// Merge fingerprint fields, overwriting keys already present.
    pub fn stamp_fingerprint(&mut self, fields: &Map<String, JsonValue>) {
        for (key, value) in fields {
            self.fingerprint.insert(key.clone(), value.clone());
        }
    }

    /// Command parameters, when the envelope carries any.
    pub fn parameters(&self) -> Option<&JsonValue> {
        self.content.get("parameters")
    }

    /// Dispatch key of this envelope.
    pub fn key(&self) -> (Category, &str, &str) {
        (self.category, self.kind.as_str(), self.name.as_str())
    }

    /// Generic JSON view of the envelope, as handed to full-body handlers.
    pub fn to_value(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }

    /// Interpret a decoded body as an envelope.
    pub fn from_value(value: JsonValue) -> Result<Self> {
        serde_json::from_value(value).map_err(|err| MessagingError::Decode(err.to_string()))
    }

    /// Encode with the given codec.
    pub fn encode(&self, codec: &dyn Codec) -> Result<Vec<u8>> {
        codec.encode(&self.to_value()?)
    }

    /// Decode raw transport bytes with the given codec.
    pub fn decode(codec: &dyn Codec, bytes: &[u8]) -> Result<Self> {
        let value = codec.decode(bytes)?;
        Self::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde_json::json;

    #[test]
    fn command_carries_parameters_under_content() {
        let envelope = Envelope::command("echo", json!({"text": "hi"}));
        let value = envelope.to_value().expect("serialize");
        assert_eq!(
            value,
            json!({
                "type": "command",
                "name": "echo",
                "category": "message",
                "version": "2",
                "fingerprint": {},
                "content": {"parameters": {"text": "hi"}},
                "_reserved": {}
            })
        );
    }

    #[test]
    fn rpc_command_only_differs_by_category() {
        let plain = Envelope::command("ping", json!({}));
        let rpc = Envelope::rpc_command("ping", json!({}));
        assert_eq!(rpc.category, Category::Rpc);
        assert_eq!(plain.kind, rpc.kind);
        assert_eq!(plain.content, rpc.content);
    }

    #[test]
    fn decoding_fills_optional_fields() {
        let bytes = br#"{"category":"message","type":"command","name":"quit"}"#;
        let envelope = Envelope::decode(&JsonCodec, bytes).expect("decode");
        assert_eq!(envelope.key(), (Category::Message, "command", "quit"));
        assert_eq!(envelope.version, PROTOCOL_VERSION);
        assert!(envelope.content.is_empty());
        assert!(envelope.reserved.is_empty());
    }

    #[test]
    fn decoding_rejects_missing_category() {
        let bytes = br#"{"type":"command","name":"quit"}"#;
        let err = Envelope::decode(&JsonCodec, bytes).expect_err("missing category");
        assert!(matches!(err, MessagingError::Decode(_)));
    }

    #[test]
    fn fingerprint_stamp_overwrites_existing_keys() {
        let mut envelope = Envelope::status("online");
        envelope.fingerprint.insert("name".into(), json!("old"));
        let mut fields = Map::new();
        fields.insert("name".into(), json!("new"));
        fields.insert("pid".into(), json!("42"));
        envelope.stamp_fingerprint(&fields);
        assert_eq!(envelope.fingerprint.get("name"), Some(&json!("new")));
        assert_eq!(envelope.fingerprint.get("pid"), Some(&json!("42")));
        assert_eq!(envelope.kind, "status");
    }
}
