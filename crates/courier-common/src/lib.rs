//! ---
//! courier_section: "01-core-functionality"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Shared primitives and utilities for courier components."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Shared primitives for courier components.
//! Configuration values are loaded here and injected into producers,
//! consumers and processors; nothing below this crate reads the process
//! environment.

pub mod config;
pub mod logging;

pub use config::{BrokerConfig, ConsumerConfig, CourierConfig, LoggingConfig, RpcConfig};
pub use logging::{init_tracing, LogFormat};
