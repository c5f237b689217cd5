//! ---
//! courier_section: "03-dispatch-rpc"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Error types raised by filters, handlers and the RPC engine."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::time::Duration;

use courier_msg::MessagingError;
use thiserror::Error;

/// Veto raised by a filter. The message is skipped for one handler only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct FilterError {
    reason: String,
}

impl FilterError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Failure surfaced by a message or RPC handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A filter, or the handler itself, vetoed the body.
    #[error("filter '{filter}' vetoed the message: {source}")]
    Filter {
        filter: String,
        #[source]
        source: FilterError,
    },
    /// Domain failure with an explicit kind name reported to RPC callers.
    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },
    /// Broker or codec failure while the handler was running.
    #[error("messaging failure: {0}")]
    Messaging(#[from] MessagingError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// Domain failure carrying the kind name RPC callers will see.
    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Veto raised from inside a handler body.
    pub fn veto(reason: impl Into<String>) -> Self {
        Self::Filter {
            filter: "handler".to_owned(),
            source: FilterError::new(reason),
        }
    }

    pub fn is_filter(&self) -> bool {
        matches!(self, Self::Filter { .. })
    }

    /// Name reported as the `value` of an `exception` reply.
    pub fn kind(&self) -> &str {
        match self {
            Self::Filter { .. } => "FilterError",
            Self::Failed { kind, .. } => kind,
            Self::Messaging(_) => "MessagingError",
            Self::Other(_) => "Error",
        }
    }

    /// Human readable part of an `exception` reply.
    pub fn detail(&self) -> String {
        match self {
            Self::Failed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<FilterError> for HandlerError {
    fn from(source: FilterError) -> Self {
        Self::Filter {
            filter: "handler".to_owned(),
            source,
        }
    }
}

/// Errors of producers, consumers and processors.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),
    #[error("no reply on '{queue}' within {timeout:?}")]
    Timeout { queue: String, timeout: Duration },
    #[error("no exchange to publish '{0}' to")]
    NoRoute(String),
    #[error("restart failed: {0}")]
    Restart(#[source] std::io::Error),
}

impl CourierError {
    /// Name reported as the `value` of an `exception` result.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Messaging(_) => "TransportError",
            Self::Handler(_) => "HandlerError",
            Self::Timeout { .. } => "TimeoutError",
            Self::NoRoute(_) => "RoutingError",
            Self::Restart(_) => "RestartError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_kinds_name_the_failure() {
        assert_eq!(HandlerError::failed("ValueError", "bad").kind(), "ValueError");
        assert_eq!(HandlerError::failed("ValueError", "bad").detail(), "bad");
        assert_eq!(HandlerError::veto("nope").kind(), "FilterError");
        assert!(HandlerError::from(FilterError::new("nope")).is_filter());
        let other = HandlerError::from(anyhow::anyhow!("boom"));
        assert_eq!(other.kind(), "Error");
        assert_eq!(other.detail(), "boom");
    }

    #[test]
    fn timeout_mentions_queue() {
        let err = CourierError::Timeout {
            queue: "amq.gen-1".into(),
            timeout: Duration::from_millis(10),
        };
        assert_eq!(err.kind(), "TimeoutError");
        assert!(err.to_string().contains("amq.gen-1"));
    }
}
