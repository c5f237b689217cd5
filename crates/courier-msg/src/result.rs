//! ---
//! courier_section: "02-messaging-envelope"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Typed outcome of RPC calls."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::envelope::Envelope;

/// Classification of an RPC outcome.
///
/// `Error` is something the remote side anticipated and documents, while
/// `Exception` reports an unexpected failure in the remote executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    /// The call succeeded.
    Success,
    /// An anticipated, documented failure.
    Error,
    /// An unexpected failure while executing the call.
    Exception,
}

impl ResultKind {
    /// Wire representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Success => "success",
            ResultKind::Error => "error",
            ResultKind::Exception => "exception",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(ResultKind::Success),
            "error" => Some(ResultKind::Error),
            "exception" => Some(ResultKind::Exception),
            _ => None,
        }
    }
}

/// Content of a reply envelope: `{"type", "value", "message"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    /// Outcome classification.
    #[serde(rename = "type")]
    pub kind: ResultKind,
    /// Returned value; the failure name for exceptions, null for errors.
    #[serde(default)]
    pub value: JsonValue,
    /// Human readable description.
    #[serde(default)]
    pub message: String,
}

impl RpcResult {
    /// Successful outcome carrying `value`.
    pub fn success(value: JsonValue, message: impl Into<String>) -> Self {
        Self {
            kind: ResultKind::Success,
            value,
            message: message.into(),
        }
    }

    /// Anticipated failure.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ResultKind::Error,
            value: JsonValue::Null,
            message: message.into(),
        }
    }

    /// Unexpected failure identified by `name`.
    pub fn exception(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ResultKind::Exception,
            value: JsonValue::String(name.into()),
            message: message.into(),
        }
    }

    /// Boolean projection: only `success` is truthy.
    pub fn is_success(&self) -> bool {
        matches!(self.kind, ResultKind::Success)
    }

    /// Result as the content mapping of a reply envelope.
    pub fn to_content(&self) -> Map<String, JsonValue> {
        let mut content = Map::new();
        content.insert("type".into(), JsonValue::from(self.kind.as_str()));
        content.insert("value".into(), self.value.clone());
        content.insert("message".into(), JsonValue::from(self.message.clone()));
        content
    }

    /// Wrap the result in a reply envelope.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::message("result", "none").with_content(self.to_content())
    }

    /// Interpret the content of a reply envelope.
    ///
    /// Unknown result types and missing keys never fail: they turn into an
    /// `error` result describing the malformed reply.
    pub fn from_content(content: &Map<String, JsonValue>) -> Self {
        Self::parse_content(content).unwrap_or_else(|| {
            Self::error(format!(
                "Malformed reply {}",
                JsonValue::Object(content.clone())
            ))
        })
    }

    fn parse_content(content: &Map<String, JsonValue>) -> Option<Self> {
        let kind = ResultKind::parse(content.get("type")?.as_str()?)?;
        let message = match content.get("message")? {
            JsonValue::String(message) => message.clone(),
            other => other.to_string(),
        };
        match kind {
            ResultKind::Success => Some(Self::success(content.get("value")?.clone(), message)),
            ResultKind::Error => Some(Self::error(message)),
            ResultKind::Exception => Some(Self {
                kind,
                value: content.get("value")?.clone(),
                message,
            }),
        }
    }
}

impl From<JsonValue> for RpcResult {
    /// Raw values are replied as a plain success.
    fn from(value: JsonValue) -> Self {
        Self::success(value, "")
    }
}

impl From<&RpcResult> for bool {
    fn from(result: &RpcResult) -> Self {
        result.is_success()
    }
}

impl fmt::Display for RpcResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.kind.as_str(), self.value, self.message)
    }
}
