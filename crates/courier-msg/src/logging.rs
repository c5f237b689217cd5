//! ---
//! courier_section: "02-messaging-envelope"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Envelope logging and prometheus metrics."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use tracing::debug;

use crate::envelope::Envelope;

/// Direction of the envelope movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Envelope published to the broker.
    Outbound,
    /// Envelope consumed from the broker.
    Inbound,
    /// RPC request republished after a timeout.
    Retry,
    /// Reply sent back to an RPC caller.
    Reply,
}

/// Emit a structured log entry for envelope activity.
pub fn log_envelope(direction: MessageDirection, envelope: &Envelope) {
    debug!(
        category = %envelope.category,
        kind = %envelope.kind,
        name = %envelope.name,
        version = %envelope.version,
        sender = envelope
            .fingerprint
            .get("name")
            .and_then(|name| name.as_str())
            .unwrap_or(""),
        direction = ?direction,
        "messaging activity"
    );
}

/// Prometheus metric handles for dispatch and RPC activity.
#[derive(Clone)]
pub struct MessagingMetricsExporter {
    acked: IntCounter,
    rejected: IntCounter,
    published: IntCounter,
    rpc_timeouts: IntCounter,
    rpc_retries: IntCounter,
    handler_latency: Histogram,
}

impl MessagingMetricsExporter {
    /// Register messaging metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let acked = IntCounter::with_opts(Opts::new(
            "courier_messages_acked_total",
            "Deliveries acknowledged after dispatch",
        ))?;
        let rejected = IntCounter::with_opts(Opts::new(
            "courier_messages_rejected_total",
            "Deliveries rejected without requeue",
        ))?;
        let published = IntCounter::with_opts(Opts::new(
            "courier_messages_published_total",
            "Envelopes published to the broker",
        ))?;
        let rpc_timeouts = IntCounter::with_opts(Opts::new(
            "courier_rpc_timeouts_total",
            "RPC calls that exhausted their retries",
        ))?;
        let rpc_retries = IntCounter::with_opts(Opts::new(
            "courier_rpc_retries_total",
            "RPC requests republished after a timeout",
        ))?;
        let handler_latency = Histogram::with_opts(HistogramOpts::new(
            "courier_dispatch_latency_seconds",
            "Time spent dispatching one delivery",
        ))?;

        registry.register(Box::new(acked.clone()))?;
        registry.register(Box::new(rejected.clone()))?;
        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(rpc_timeouts.clone()))?;
        registry.register(Box::new(rpc_retries.clone()))?;
        registry.register(Box::new(handler_latency.clone()))?;

        Ok(Self {
            acked,
            rejected,
            published,
            rpc_timeouts,
            rpc_retries,
            handler_latency,
        })
    }

    /// Record an acknowledged delivery.
    pub fn observe_acked(&self) {
        self.acked.inc();
    }

    /// Record a rejected delivery.
    pub fn observe_rejected(&self) {
        self.rejected.inc();
    }

    /// Record a published envelope.
    pub fn observe_published(&self) {
        self.published.inc();
    }

    /// Record an RPC call that gave up waiting.
    pub fn observe_rpc_timeout(&self) {
        self.rpc_timeouts.inc();
    }

    /// Record an RPC retry.
    pub fn observe_rpc_retry(&self) {
        self.rpc_retries.inc();
    }

    /// Record how long one dispatch took.
    pub fn observe_dispatch(&self, duration: Duration) {
        self.handler_latency.observe(duration.as_secs_f64());
    }
}
