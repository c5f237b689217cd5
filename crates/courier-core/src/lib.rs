//! ---
//! courier_section: "03-dispatch-rpc"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Dispatch and RPC engine for courier components."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Components declare handlers keyed by `(category, type, name)`; a
//! [`MessageProcessor`] consumes deliveries for one component, dispatches
//! them through the frozen [`HandlerRegistry`] and settles each delivery
//! according to the [`Flow`] its handlers returned. [`Producer`] is the
//! sending half, including blocking RPC calls with timeout and retries.

pub mod application;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod processor;
pub mod producer;
pub mod registry;
pub mod rpc;

pub use application::{
    application_exchange, group_bindings, standard_bindings, Application, APPLICATION_EXCHANGE,
};
pub use consumer::{Binding, BindingChange, ChannelReplier, Consumer};
pub use dispatch::{Dispatched, Dispatcher, Disposition, Flow};
pub use error::{CourierError, FilterError, HandlerError};
pub use filter::{Filter, FilterArgs, FilterChain};
pub use processor::{DispatchStats, ExecRestarter, MessageProcessor, Restarter, StatsHandle};
pub use producer::{
    serialize_text_file, CommandBook, CommandBuilder, MessageCommand, Producer, Route, RpcCommand,
};
pub use registry::{
    BodySelector, Component, Handler, HandlerEntry, HandlerKey, HandlerRegistry, Registration,
    RegistryBuilder,
};
pub use rpc::{decode_reply, CallOptions, Reply, ReplySink};

/// Result alias for producer, consumer and processor operations.
pub type Result<T> = std::result::Result<T, CourierError>;
