//! ---
//! courier_section: "03-dispatch-rpc"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Consumer side of a component: bindings, acknowledgements and replies."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use courier_msg::{
    log_envelope, Channel, Codec, Delivery, DeliveryTag, Envelope, ExchangeDescriptor,
    Fingerprint, MessageDirection, MessagingError, Properties, QueueSpec, RpcResult,
};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::error::CourierError;
use crate::rpc::ReplySink;

/// A queue bound to an exchange under one routing key.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub exchange: ExchangeDescriptor,
    pub queue: QueueSpec,
    pub routing_key: String,
}

impl Binding {
    pub fn new(
        exchange: ExchangeDescriptor,
        queue: impl Into<QueueSpec>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Binding update requested while the component is running.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingChange {
    Bind(Binding),
    Unbind {
        exchange: String,
        queue: String,
        routing_key: String,
    },
}

/// Owns the consuming channel of one component.
///
/// Every bound queue is consumed; deliveries are acknowledged or rejected
/// explicitly by the processor once dispatch is over.
pub struct Consumer {
    channel: Box<dyn Channel>,
    codec: Arc<dyn Codec>,
    fingerprint: Map<String, JsonValue>,
    queues: Vec<String>,
    bindings: Vec<(String, String, String)>,
}

impl Consumer {
    pub fn new(channel: Box<dyn Channel>, codec: Arc<dyn Codec>, fingerprint: &Fingerprint) -> Self {
        Self {
            channel,
            codec,
            fingerprint: fingerprint.as_map(),
            queues: Vec::new(),
            bindings: Vec::new(),
        }
    }

    /// Declare and bind every binding, adding the queues to the consumed set.
    pub fn add_bindings(&mut self, bindings: &[Binding]) -> Result<(), CourierError> {
        for binding in bindings {
            self.queue_bind(&binding.exchange, &binding.queue, &binding.routing_key)?;
        }
        Ok(())
    }

    /// Declare the exchange and the queue, then bind them. Returns the
    /// queue name, generated by the broker when `queue.name` is empty.
    pub fn queue_bind(
        &mut self,
        exchange: &ExchangeDescriptor,
        queue: &QueueSpec,
        routing_key: &str,
    ) -> Result<String, CourierError> {
        self.channel.declare_exchange(exchange)?;
        let name = self.channel.declare_queue(queue)?;
        self.channel.bind(&exchange.name, &name, routing_key)?;
        info!(
            exchange = %exchange.name,
            queue = %name,
            routing_key,
            "queue bound"
        );
        if !self.queues.contains(&name) {
            self.queues.push(name.clone());
        }
        let binding = (exchange.name.clone(), name.clone(), routing_key.to_owned());
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        Ok(name)
    }

    /// Remove one binding. The queue keeps being consumed.
    pub fn queue_unbind(
        &mut self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<(), CourierError> {
        self.channel.unbind(exchange, queue, routing_key)?;
        self.bindings
            .retain(|(e, q, k)| !(e == exchange && q == queue && k == routing_key));
        info!(exchange, queue, routing_key, "queue unbound");
        Ok(())
    }

    /// Apply changes in order, stopping at the first failure.
    pub fn apply(&mut self, changes: &[BindingChange]) -> Result<(), CourierError> {
        for change in changes {
            match change {
                BindingChange::Bind(binding) => {
                    self.queue_bind(&binding.exchange, &binding.queue, &binding.routing_key)?;
                }
                BindingChange::Unbind {
                    exchange,
                    queue,
                    routing_key,
                } => self.queue_unbind(exchange, queue, routing_key)?,
            }
        }
        Ok(())
    }

    /// Queues consumed, in binding order.
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Active bindings as `(exchange, queue, routing_key)`.
    pub fn bindings(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.bindings
            .iter()
            .map(|(e, q, k)| (e.as_str(), q.as_str(), k.as_str()))
    }

    pub fn fingerprint(&self) -> &Map<String, JsonValue> {
        &self.fingerprint
    }

    /// Wait up to `timeout` for the next delivery on any consumed queue.
    pub fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, CourierError> {
        Ok(self.channel.consume(&self.queues, timeout)?)
    }

    pub fn decode(&self, delivery: &Delivery) -> Result<Envelope, MessagingError> {
        Envelope::decode(self.codec.as_ref(), &delivery.body)
    }

    pub fn ack(&mut self, tag: DeliveryTag) -> Result<(), CourierError> {
        debug!(%tag, "ack");
        Ok(self.channel.ack(tag)?)
    }

    pub fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), CourierError> {
        debug!(%tag, requeue, "reject");
        Ok(self.channel.reject(tag, requeue)?)
    }

    /// Publish `result` to the reply queue named by `properties`.
    ///
    /// Requests without a reply destination are answered by nobody.
    pub fn rpc_reply(&mut self, properties: &Properties, result: &RpcResult) -> Result<(), MessagingError> {
        let Some(reply_to) = properties.reply_to.as_deref() else {
            warn!(result = %result, "rpc request carries no reply_to; dropping reply");
            return Ok(());
        };
        let mut envelope = result.to_envelope();
        envelope.stamp_fingerprint(&self.fingerprint);
        log_envelope(MessageDirection::Reply, &envelope);
        let body = envelope.encode(self.codec.as_ref())?;
        self.channel.publish(
            "",
            reply_to,
            body,
            Properties::with_content_type(self.codec.content_type()),
        )
    }

    /// Reply sink for the request carried by `properties`.
    pub fn replier(&mut self, properties: &Properties) -> ChannelReplier<'_> {
        ChannelReplier {
            properties: properties.clone(),
            consumer: self,
        }
    }
}

/// [`ReplySink`] publishing through the consumer's channel.
pub struct ChannelReplier<'a> {
    consumer: &'a mut Consumer,
    properties: Properties,
}

impl ReplySink for ChannelReplier<'_> {
    fn send_reply(&mut self, result: &RpcResult) -> Result<(), MessagingError> {
        self.consumer.rpc_reply(&self.properties, result)
    }

    fn fingerprint(&self) -> &Map<String, JsonValue> {
        self.consumer.fingerprint()
    }
}
