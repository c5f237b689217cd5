//! ---
//! courier_section: "03-dispatch-rpc"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "RPC reply plumbing shared by callers and handlers."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::time::Duration;

use courier_common::RpcConfig;
use courier_msg::{Channel, Codec, MessagingError, RpcResult};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::error::{CourierError, HandlerError};

/// Destination of the result of one RPC request.
pub trait ReplySink {
    /// Publish `result` to the caller.
    fn send_reply(&mut self, result: &RpcResult) -> Result<(), MessagingError>;

    /// Fingerprint of the replying component.
    fn fingerprint(&self) -> &Map<String, JsonValue>;
}

/// Handle given to RPC handlers to answer the request being dispatched.
///
/// Replying is optional: a handler that never replies leaves the caller to
/// its timeout.
pub struct Reply<'a> {
    sink: &'a mut dyn ReplySink,
    sent: usize,
}

impl<'a> Reply<'a> {
    pub fn new(sink: &'a mut dyn ReplySink) -> Self {
        Self { sink, sent: 0 }
    }

    /// Send a result. Raw JSON values are wrapped as `success`.
    pub fn send(&mut self, result: impl Into<RpcResult>) -> Result<(), HandlerError> {
        let result = result.into();
        self.sink.send_reply(&result)?;
        self.sent += 1;
        Ok(())
    }

    pub fn success(&mut self, value: JsonValue, message: &str) -> Result<(), HandlerError> {
        self.send(RpcResult::success(value, message))
    }

    pub fn error(&mut self, message: &str) -> Result<(), HandlerError> {
        self.send(RpcResult::error(message))
    }

    /// Fingerprint of the component answering.
    pub fn fingerprint(&self) -> &Map<String, JsonValue> {
        self.sink.fingerprint()
    }

    /// Number of replies sent through this handle.
    pub fn sent(&self) -> usize {
        self.sent
    }
}

/// Per call overrides of the configured RPC policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallOptions {
    pub timeout: Duration,
    /// Additional attempts after the first timeout.
    pub max_retry: u32,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Total number of sends the call may make.
    pub fn attempts(&self) -> u32 {
        self.max_retry.saturating_add(1)
    }
}

impl From<&RpcConfig> for CallOptions {
    fn from(config: &RpcConfig) -> Self {
        Self {
            timeout: config.timeout,
            max_retry: config.max_retry,
        }
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::from(&RpcConfig::default())
    }
}

/// Interpret the body of a reply. Anything that is not a result envelope
/// becomes an `error` result instead of failing the call.
pub fn decode_reply(codec: &dyn Codec, body: &[u8]) -> RpcResult {
    match codec.decode(body) {
        Ok(JsonValue::Object(envelope)) => match envelope.get("content") {
            Some(JsonValue::Object(content)) => RpcResult::from_content(content),
            _ => RpcResult::error(format!(
                "Malformed reply {}",
                JsonValue::Object(envelope)
            )),
        },
        Ok(other) => RpcResult::error(format!("Malformed reply {other}")),
        Err(err) => RpcResult::error(format!("Malformed reply: {err}")),
    }
}

/// Wait for one reply on `queue`, acknowledging it.
pub(crate) fn await_reply(
    channel: &mut dyn Channel,
    codec: &dyn Codec,
    queue: &str,
    timeout: Duration,
) -> Result<RpcResult, CourierError> {
    let queues = [queue.to_owned()];
    let delivery = channel
        .consume(&queues, timeout)?
        .ok_or_else(|| CourierError::Timeout {
            queue: queue.to_owned(),
            timeout,
        })?;
    channel.ack(delivery.tag)?;
    let result = decode_reply(codec, &delivery.body);
    debug!(queue, kind = result.kind.as_str(), "rpc reply received");
    if !result.is_success() {
        warn!(queue, result = %result, "rpc call did not succeed");
    }
    Ok(result)
}
