//! ---
//! courier_section: "03-dispatch-rpc"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Message processors driving components from the scheduler."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::ffi::OsString;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_common::ConsumerConfig;
use courier_msg::{log_envelope, Delivery, DeliveryTag, MessageDirection, MessagingMetricsExporter};
use courier_rt::{MicroThread, StepOutcome};
use tracing::{debug, error, info, warn};

use crate::consumer::{Binding, Consumer};
use crate::dispatch::{Dispatcher, Disposition};
use crate::error::CourierError;
use crate::registry::{Component, HandlerRegistry};

/// Replaces the running process when a component asks for a restart.
pub trait Restarter: Send {
    /// Returns only when the restart did not take over the process; `Ok`
    /// means the restart was handed to someone else.
    fn restart(&mut self) -> Result<(), CourierError>;
}

/// Re-executes the current binary with the original arguments.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecRestarter;

impl Restarter for ExecRestarter {
    fn restart(&mut self) -> Result<(), CourierError> {
        let program = std::env::current_exe().map_err(CourierError::Restart)?;
        let args: Vec<OsString> = std::env::args_os().skip(1).collect();
        info!(program = %program.display(), "restarting process");
        exec(Command::new(program).args(args))
    }
}

#[cfg(unix)]
fn exec(command: &mut Command) -> Result<(), CourierError> {
    use std::os::unix::process::CommandExt;
    Err(CourierError::Restart(command.exec()))
}

#[cfg(not(unix))]
fn exec(command: &mut Command) -> Result<(), CourierError> {
    command.spawn().map_err(CourierError::Restart)?;
    std::process::exit(0)
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    decode_failures: AtomicU64,
    handlers_invoked: AtomicU64,
    filtered: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handlers_invoked: self.handlers_invoked.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
        }
    }
}

/// Counters of one processor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub acked: u64,
    pub rejected: u64,
    pub decode_failures: u64,
    pub handlers_invoked: u64,
    pub filtered: u64,
}

/// Read access to the counters of a processor owned by a scheduler.
#[derive(Debug, Clone)]
pub struct StatsHandle(Arc<Counters>);

impl StatsHandle {
    pub fn snapshot(&self) -> DispatchStats {
        self.0.snapshot()
    }
}

/// Drives one component: every step consumes at most one delivery,
/// dispatches it and settles it with the broker.
pub struct MessageProcessor<C> {
    name: String,
    component: C,
    consumer: Consumer,
    dispatcher: Dispatcher<C>,
    poll_timeout: Duration,
    restarter: Box<dyn Restarter>,
    counters: Arc<Counters>,
    metrics: Option<MessagingMetricsExporter>,
}

impl<C: Component> MessageProcessor<C> {
    /// Processor using the registry of `C`, collected once per component
    /// type and shared by every processor of that type.
    pub fn new(name: impl Into<String>, component: C, consumer: Consumer, config: &ConsumerConfig) -> Self {
        Self::with_registry(name, component, consumer, config, HandlerRegistry::shared())
    }

    /// Processor dispatching through an explicitly built registry.
    pub fn with_registry(
        name: impl Into<String>,
        component: C,
        consumer: Consumer,
        config: &ConsumerConfig,
        registry: Arc<HandlerRegistry<C>>,
    ) -> Self {
        Self {
            name: name.into(),
            component,
            consumer,
            dispatcher: Dispatcher::new(registry),
            poll_timeout: config.poll_timeout,
            restarter: Box::new(ExecRestarter),
            counters: Arc::new(Counters::default()),
            metrics: None,
        }
    }

    pub fn with_restarter(mut self, restarter: impl Restarter + 'static) -> Self {
        self.restarter = Box::new(restarter);
        self
    }

    pub fn with_metrics(mut self, metrics: MessagingMetricsExporter) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn add_bindings(&mut self, bindings: &[Binding]) -> Result<(), CourierError> {
        self.consumer.add_bindings(bindings)
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    pub fn consumer_mut(&mut self) -> &mut Consumer {
        &mut self.consumer
    }

    pub fn component(&self) -> &C {
        &self.component
    }

    pub fn component_mut(&mut self) -> &mut C {
        &mut self.component
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle(Arc::clone(&self.counters))
    }

    /// Dispatch and settle one delivery.
    ///
    /// Undecodable deliveries are rejected without requeue and do not stop
    /// the processor. Broker failures while settling are returned.
    pub fn handle(&mut self, delivery: Delivery) -> Result<StepOutcome, CourierError> {
        let started = Instant::now();
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let tag = delivery.tag;

        let envelope = match self.consumer.decode(&delivery) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(
                    processor = %self.name,
                    queue = %delivery.queue,
                    %tag,
                    error = %err,
                    "undecodable delivery rejected"
                );
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                return self.settle(tag, Disposition::Reject);
            }
        };
        log_envelope(MessageDirection::Inbound, &envelope);

        let report = {
            let mut replier = self.consumer.replier(&delivery.properties);
            self.dispatcher
                .dispatch(&mut self.component, &envelope, &mut replier)
        };
        self.counters
            .handlers_invoked
            .fetch_add(report.invoked as u64, Ordering::Relaxed);
        self.counters
            .filtered
            .fetch_add(report.vetoed as u64, Ordering::Relaxed);
        if let Err(err) = &report.outcome {
            error!(
                processor = %self.name,
                category = %envelope.category,
                kind = %envelope.kind,
                name = %envelope.name,
                error = %err,
                "dispatch failed; rejecting delivery"
            );
        }

        let mut disposition = report.disposition();
        let changes = self.component.take_binding_changes();
        if !changes.is_empty() {
            debug!(processor = %self.name, changes = changes.len(), "applying binding changes");
            if let Err(err) = self.consumer.apply(&changes) {
                error!(
                    processor = %self.name,
                    name = %envelope.name,
                    error = %err,
                    "binding change failed; rejecting delivery"
                );
                disposition = Disposition::Reject;
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.observe_dispatch(started.elapsed());
        }
        self.settle(tag, disposition)
    }

    fn settle(&mut self, tag: DeliveryTag, disposition: Disposition) -> Result<StepOutcome, CourierError> {
        if disposition == Disposition::Reject {
            self.consumer.reject(tag, false)?;
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.observe_rejected();
            }
            return Ok(StepOutcome::Yield);
        }

        self.consumer.ack(tag)?;
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_acked();
        }
        match disposition {
            Disposition::AckAndTerminate => {
                info!(processor = %self.name, "quit requested");
                Ok(StepOutcome::Terminate)
            }
            Disposition::AckAndRestart => {
                warn!(processor = %self.name, "restart requested");
                self.restarter.restart()?;
                Ok(StepOutcome::Shutdown)
            }
            Disposition::Ack | Disposition::Reject => Ok(StepOutcome::Yield),
        }
    }
}

impl<C: Component> MicroThread for MessageProcessor<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&mut self) -> anyhow::Result<()> {
        info!(
            processor = %self.name,
            queues = ?self.consumer.queues(),
            handlers = self.dispatcher.registry().len(),
            "message processor ready"
        );
        Ok(())
    }

    fn step(&mut self) -> anyhow::Result<StepOutcome> {
        match self.consumer.next_delivery(self.poll_timeout)? {
            Some(delivery) => Ok(self.handle(delivery)?),
            None => Ok(StepOutcome::Yield),
        }
    }
}
