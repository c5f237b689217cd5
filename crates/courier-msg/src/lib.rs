//! ---
//! courier_section: "02-messaging-envelope"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Envelope model, codecs and broker channel primitives."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Wire-level building blocks shared by every courier component: the
//! envelope exchanged between components, RPC results, the component
//! fingerprint, exchange and queue descriptors, pluggable codecs and the
//! broker channel interface together with an in-process broker.

pub mod codec;
pub mod envelope;
pub mod exchange;
pub mod fingerprint;
pub mod logging;
pub mod result;
pub mod transport;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Failures raised by the envelope model, codecs and broker channels.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper for CBOR serialization or deserialization problems.
    #[error("cbor error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    /// The payload decoded but does not describe a valid envelope.
    #[error("malformed envelope: {0}")]
    Decode(String),
    /// An exchange was declared with a type the broker does not support.
    #[error("unsupported exchange type '{0}'")]
    UnknownExchangeType(String),
    /// A redeclaration did not match the existing entity.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// The named exchange does not exist.
    #[error("exchange '{0}' not found")]
    ExchangeNotFound(String),
    /// The named queue does not exist.
    #[error("queue '{0}' not found")]
    QueueNotFound(String),
    /// The delivery tag is not outstanding on this channel.
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
    /// The broker connection or channel is no longer usable.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

pub use codec::{CborCodec, Codec, JsonCodec};
pub use envelope::{Category, Envelope, PROTOCOL_VERSION};
pub use exchange::{ExchangeDescriptor, ExchangeKind, QueueFlags, QueueSpec};
pub use fingerprint::Fingerprint;
pub use logging::{log_envelope, MessageDirection, MessagingMetricsExporter};
pub use result::{ResultKind, RpcResult};
pub use transport::{
    BrokerStats, Channel, Delivery, DeliveryTag, InMemoryBroker, InMemoryChannel, Properties,
};
