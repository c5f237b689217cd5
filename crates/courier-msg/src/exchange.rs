//! ---
//! courier_section: "02-messaging-envelope"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Exchange and queue declarations."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::MessagingError;

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Route on exact routing key match.
    Direct,
    /// Route to every bound queue.
    Fanout,
    /// Route on dotted pattern match (`*` one word, `#` zero or more).
    Topic,
}

impl ExchangeKind {
    /// Wire representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = MessagingError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            other => Err(MessagingError::UnknownExchangeType(other.to_owned())),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static exchange declaration.
///
/// Declaring the same descriptor any number of times is legal; only the
/// first declaration has an effect on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeDescriptor {
    /// Exchange name.
    pub name: String,
    /// Routing behaviour.
    pub exchange_type: ExchangeKind,
    /// Only check that the exchange exists.
    pub passive: bool,
    /// Survive broker restarts.
    pub durable: bool,
    /// Remove once the last binding goes away.
    pub auto_delete: bool,
}

impl ExchangeDescriptor {
    /// Durable direct exchange.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exchange_type: ExchangeKind::Direct,
            passive: false,
            durable: true,
            auto_delete: false,
        }
    }

    /// Change the routing behaviour.
    pub fn with_type(mut self, exchange_type: ExchangeKind) -> Self {
        self.exchange_type = exchange_type;
        self
    }

    /// Mark the declaration as passive.
    pub fn passive(mut self, passive: bool) -> Self {
        self.passive = passive;
        self
    }

    /// Set durability.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Set auto deletion.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// True when both declarations would create the same exchange.
    pub fn is_compatible_with(&self, other: &ExchangeDescriptor) -> bool {
        self.name == other.name
            && self.exchange_type == other.exchange_type
            && self.durable == other.durable
            && self.auto_delete == other.auto_delete
    }
}

/// Flags applied when declaring a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueFlags {
    /// Survive broker restarts.
    #[serde(default)]
    pub durable: bool,
    /// Only usable by the declaring channel.
    #[serde(default)]
    pub exclusive: bool,
    /// Removed when its consumer goes away.
    #[serde(default)]
    pub auto_delete: bool,
}

impl QueueFlags {
    /// Flags of a private reply destination.
    pub fn private_reply() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// Flags of a queue shared by component instances and removed with them.
    pub fn auto_delete() -> Self {
        Self {
            auto_delete: true,
            ..Self::default()
        }
    }
}

/// Queue name plus its declaration flags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Declaration flags.
    #[serde(default)]
    pub flags: QueueFlags,
}

impl QueueSpec {
    /// Queue with explicit flags.
    pub fn new(name: impl Into<String>, flags: QueueFlags) -> Self {
        Self {
            name: name.into(),
            flags,
        }
    }
}

impl From<&str> for QueueSpec {
    fn from(name: &str) -> Self {
        Self::new(name, QueueFlags::default())
    }
}

impl From<String> for QueueSpec {
    fn from(name: String) -> Self {
        Self::new(name, QueueFlags::default())
    }
}
