//! ---
//! courier_section: "03-dispatch-rpc"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Dispatch engine mapping envelopes to handlers and dispositions."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::sync::Arc;

use courier_msg::{Category, Envelope, RpcResult};
use tracing::{debug, error, warn};

use crate::error::HandlerError;
use crate::registry::{Handler, HandlerEntry, HandlerKey, HandlerRegistry};
use crate::rpc::{Reply, ReplySink};

/// Control flow requested by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    /// Carry on; the delivery is acknowledged once dispatch ends.
    #[default]
    Continue,
    /// Reject the delivery without requeue.
    Reject,
    /// Acknowledge, then restart the process.
    Restart,
    /// Acknowledge, then stop the component.
    Terminate,
}

/// Final treatment of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject,
    AckAndRestart,
    AckAndTerminate,
}

impl From<Flow> for Disposition {
    fn from(flow: Flow) -> Self {
        match flow {
            Flow::Continue => Self::Ack,
            Flow::Reject => Self::Reject,
            Flow::Restart => Self::AckAndRestart,
            Flow::Terminate => Self::AckAndTerminate,
        }
    }
}

/// What happened while dispatching one envelope.
#[derive(Debug)]
pub struct Dispatched {
    pub outcome: Result<Flow, HandlerError>,
    /// Handlers actually invoked, vetoed ones excluded.
    pub invoked: usize,
    /// Handlers skipped because a filter vetoed the body.
    pub vetoed: usize,
}

impl Dispatched {
    fn idle() -> Self {
        Self {
            outcome: Ok(Flow::Continue),
            invoked: 0,
            vetoed: 0,
        }
    }

    /// Unhandled handler failures reject the delivery.
    pub fn disposition(&self) -> Disposition {
        match &self.outcome {
            Ok(flow) => Disposition::from(*flow),
            Err(_) => Disposition::Reject,
        }
    }
}

/// Routes envelopes to the handlers of a frozen registry.
pub struct Dispatcher<C> {
    registry: Arc<HandlerRegistry<C>>,
}

impl<C> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<C> Dispatcher<C> {
    pub fn new(registry: Arc<HandlerRegistry<C>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry<C> {
        &self.registry
    }

    /// Dispatch one decoded envelope.
    ///
    /// * `message`: every handler under the key runs in registration order,
    ///   each on its own copy of the body. A filter veto skips only that
    ///   handler. The first flow other than [`Flow::Continue`], or the first
    ///   failure, stops the remaining handlers.
    /// * `rpc`: only the last handler registered under the key runs. A veto
    ///   is answered with an `error` result; a failure is answered with an
    ///   `exception` result, unless the handler already replied, and then
    ///   returned.
    pub fn dispatch(&self, component: &mut C, envelope: &Envelope, sink: &mut dyn ReplySink) -> Dispatched {
        let key = HandlerKey::from(envelope);
        let entries = self.registry.lookup(&key);
        if entries.is_empty() {
            debug!(key = %key, "no handler registered");
            return Dispatched::idle();
        }
        match envelope.category {
            Category::Message => dispatch_message(component, envelope, entries),
            Category::Rpc => match entries.last() {
                Some(entry) => dispatch_rpc(component, envelope, entry, sink),
                None => Dispatched::idle(),
            },
        }
    }
}

fn dispatch_message<C>(component: &mut C, envelope: &Envelope, entries: &[HandlerEntry<C>]) -> Dispatched {
    let mut report = Dispatched::idle();
    for entry in entries {
        let Handler::Message(handler) = &entry.handler else {
            warn!(handler = %entry.label, "rpc handler registered under a message key");
            continue;
        };
        let outcome = entry
            .selector
            .extract(envelope)
            .map_err(HandlerError::from)
            .and_then(|body| entry.filters.apply(body))
            .and_then(|body| {
                report.invoked += 1;
                handler(component, body)
            });
        match outcome {
            Ok(Flow::Continue) => {}
            Ok(flow) => {
                debug!(handler = %entry.label, ?flow, "handler changed control flow");
                report.outcome = Ok(flow);
                return report;
            }
            Err(err) if err.is_filter() => {
                debug!(handler = %entry.label, reason = %err, "message filtered out");
                report.vetoed += 1;
            }
            Err(err) => {
                error!(handler = %entry.label, error = %err, "message handler failed");
                report.outcome = Err(err);
                return report;
            }
        }
    }
    report
}

fn dispatch_rpc<C>(
    component: &mut C,
    envelope: &Envelope,
    entry: &HandlerEntry<C>,
    sink: &mut dyn ReplySink,
) -> Dispatched {
    let mut report = Dispatched::idle();
    let Handler::Rpc(handler) = &entry.handler else {
        warn!(handler = %entry.label, "message handler registered under an rpc key");
        return report;
    };
    let mut reply = Reply::new(sink);
    let outcome = entry
        .selector
        .extract(envelope)
        .map_err(HandlerError::from)
        .and_then(|body| entry.filters.apply(body))
        .and_then(|body| {
            report.invoked += 1;
            handler(component, body, &mut reply)
        });
    report.outcome = match outcome {
        Ok(flow) => {
            if reply.sent() == 0 {
                warn!(handler = %entry.label, "rpc handler finished without replying");
            }
            Ok(flow)
        }
        Err(err) if err.is_filter() => {
            debug!(handler = %entry.label, reason = %err, "rpc request filtered out");
            report.vetoed += 1;
            send_failure(&mut reply, RpcResult::error(err.to_string()));
            Ok(Flow::Continue)
        }
        Err(err) => {
            error!(handler = %entry.label, error = %err, "rpc handler failed");
            // The caller consumes a single reply; one already sent stands.
            if reply.sent() == 0 {
                send_failure(&mut reply, RpcResult::exception(err.kind(), err.detail()));
            }
            Err(err)
        }
    };
    report
}

fn send_failure(reply: &mut Reply<'_>, result: RpcResult) {
    if let Err(err) = reply.send(result) {
        error!(error = %err, "unable to report rpc failure to the caller");
    }
}
