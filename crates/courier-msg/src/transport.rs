//! ---
//! courier_section: "02-messaging-envelope"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Broker channel interface and in-process broker."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::exchange::{ExchangeDescriptor, ExchangeKind, QueueFlags, QueueSpec};
use crate::{MessagingError, Result};

/// Broker assigned identifier of an outstanding delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Properties travelling next to a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    /// Codec tag of the body.
    pub content_type: Option<String>,
    /// Queue expecting the reply of an RPC request.
    pub reply_to: Option<String>,
}

impl Properties {
    /// Properties of a plain message.
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            reply_to: None,
        }
    }

    /// Attach a reply destination.
    pub fn reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Tag used to acknowledge or reject the delivery.
    pub tag: DeliveryTag,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key used when publishing.
    pub routing_key: String,
    /// Queue the delivery was taken from.
    pub queue: String,
    /// Message properties.
    pub properties: Properties,
    /// Encoded body.
    pub body: Vec<u8>,
    /// Set when the message was requeued at least once.
    pub redelivered: bool,
}

/// Connected, authenticated channel to a broker.
///
/// Every component owns its channel exclusively; channels are never shared
/// between components or threads.
pub trait Channel: Send {
    /// Declare an exchange. Redeclaring an identical descriptor is a no-op.
    fn declare_exchange(&mut self, exchange: &ExchangeDescriptor) -> Result<()>;
    /// Declare a queue and return its name; an empty name asks the broker
    /// to generate one.
    fn declare_queue(&mut self, queue: &QueueSpec) -> Result<String>;
    /// Bind a queue to an exchange with a routing key.
    fn bind(&mut self, exchange: &str, queue: &str, routing_key: &str) -> Result<()>;
    /// Remove a binding.
    fn unbind(&mut self, exchange: &str, queue: &str, routing_key: &str) -> Result<()>;
    /// Delete a queue together with its bindings and pending messages.
    fn delete_queue(&mut self, queue: &str) -> Result<()>;
    /// Publish a body. The empty exchange name routes straight to the queue
    /// named by `routing_key`.
    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: Properties,
    ) -> Result<()>;
    /// Block until one delivery is available on any of `queues` or
    /// `timeout` elapses. Queues are polled in the given order.
    fn consume(&mut self, queues: &[String], timeout: Duration) -> Result<Option<Delivery>>;
    /// Acknowledge a delivery.
    fn ack(&mut self, tag: DeliveryTag) -> Result<()>;
    /// Reject a delivery, optionally putting it back at the head of its queue.
    fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()>;
    /// Declare a private, exclusive, auto-deleting queue for one reply.
    fn declare_private_reply_queue(&mut self) -> Result<String> {
        self.declare_queue(&QueueSpec::new("", QueueFlags::private_reply()))
    }
    /// Human-readable channel name for logging.
    fn name(&self) -> &'static str;
}

/// Counters exposed by the in-memory broker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStats {
    /// Publish calls accepted by the broker.
    pub published: u64,
    /// Deliveries acknowledged.
    pub acked: u64,
    /// Deliveries rejected, requeued or not.
    pub rejected: u64,
    /// Rejected deliveries put back on their queue.
    pub requeued: u64,
    /// Published messages that matched no queue.
    pub dropped: u64,
}

type ChannelId = u64;

struct ExchangeEntry {
    descriptor: ExchangeDescriptor,
    declarations: u64,
    bindings: Vec<(String, String)>,
}

struct QueueEntry {
    flags: QueueFlags,
    owner: Option<ChannelId>,
    declarations: u64,
    messages: VecDeque<Delivery>,
}

struct Unacked {
    channel: ChannelId,
    delivery: Delivery,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    unacked: HashMap<DeliveryTag, Unacked>,
    next_tag: u64,
    next_channel: ChannelId,
    stats: BrokerStats,
    closed: bool,
}

impl BrokerState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(MessagingError::ChannelClosed("broker shut down".into()));
        }
        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }
        let entry = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| MessagingError::ExchangeNotFound(exchange.to_owned()))?;
        let mut targets: Vec<String> = Vec::new();
        for (queue, key) in &entry.bindings {
            let matched = match entry.descriptor.exchange_type {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(key, routing_key),
            };
            if matched && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }

    fn owns(&self, tag: DeliveryTag, channel: ChannelId) -> bool {
        self.unacked
            .get(&tag)
            .is_some_and(|pending| pending.channel == channel)
    }

    fn remove_queue(&mut self, queue: &str) {
        self.queues.remove(queue);
        for entry in self.exchanges.values_mut() {
            entry.bindings.retain(|(bound, _)| bound != queue);
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    available: Condvar,
}

/// In-process broker with AMQP-like routing, used by tests and by
/// single-process deployments.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                available: Condvar::new(),
            }),
        }
    }

    /// Open a new channel on this broker.
    pub fn channel(&self) -> InMemoryChannel {
        let mut state = self.shared.state.lock();
        state.next_channel += 1;
        InMemoryChannel {
            id: state.next_channel,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> BrokerStats {
        self.shared.state.lock().stats
    }

    /// Messages waiting on a queue, `None` when the queue does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|entry| entry.messages.len())
    }

    /// Number of times a queue has been declared.
    pub fn queue_declarations(&self, queue: &str) -> Option<u64> {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|entry| entry.declarations)
    }

    /// Current declaration of an exchange.
    pub fn exchange(&self, name: &str) -> Option<ExchangeDescriptor> {
        self.shared
            .state
            .lock()
            .exchanges
            .get(name)
            .map(|entry| entry.descriptor.clone())
    }

    /// Number of times an exchange has been declared.
    pub fn exchange_declarations(&self, name: &str) -> Option<u64> {
        self.shared
            .state
            .lock()
            .exchanges
            .get(name)
            .map(|entry| entry.declarations)
    }

    /// Routing keys binding `queue` to `exchange`.
    pub fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.shared
            .state
            .lock()
            .exchanges
            .get(exchange)
            .map(|entry| {
                entry
                    .bindings
                    .iter()
                    .filter(|(bound, _)| bound == queue)
                    .map(|(_, key)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deliveries handed out and not yet settled.
    pub fn unacked(&self) -> usize {
        self.shared.state.lock().unacked.len()
    }

    /// Take the next message of a queue without going through a channel.
    pub fn pop(&self, queue: &str) -> Option<Delivery> {
        self.shared
            .state
            .lock()
            .queues
            .get_mut(queue)
            .and_then(|entry| entry.messages.pop_front())
    }

    /// Close the broker; every later channel operation fails.
    pub fn shutdown(&self) {
        self.shared.state.lock().closed = true;
        self.shared.available.notify_all();
    }
}

/// Channel opened on an [`InMemoryBroker`].
pub struct InMemoryChannel {
    id: ChannelId,
    shared: Arc<Shared>,
}

impl Channel for InMemoryChannel {
    fn declare_exchange(&mut self, exchange: &ExchangeDescriptor) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        match state.exchanges.get_mut(&exchange.name) {
            Some(entry) => {
                if !entry.descriptor.is_compatible_with(exchange) {
                    return Err(MessagingError::PreconditionFailed(format!(
                        "exchange '{}' already declared with different parameters",
                        exchange.name
                    )));
                }
                entry.declarations += 1;
            }
            None if exchange.passive => {
                return Err(MessagingError::ExchangeNotFound(exchange.name.clone()));
            }
            None => {
                debug!(exchange = %exchange.name, kind = %exchange.exchange_type, "exchange declared");
                state.exchanges.insert(
                    exchange.name.clone(),
                    ExchangeEntry {
                        descriptor: exchange.clone(),
                        declarations: 1,
                        bindings: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    fn declare_queue(&mut self, queue: &QueueSpec) -> Result<String> {
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        let name = if queue.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            queue.name.clone()
        };
        match state.queues.get_mut(&name) {
            Some(entry) => {
                if entry.flags != queue.flags {
                    return Err(MessagingError::PreconditionFailed(format!(
                        "queue '{name}' already declared with different flags"
                    )));
                }
                if entry.owner.is_some_and(|owner| owner != self.id) {
                    return Err(MessagingError::PreconditionFailed(format!(
                        "queue '{name}' is exclusive to another channel"
                    )));
                }
                entry.declarations += 1;
            }
            None => {
                debug!(queue = %name, flags = ?queue.flags, "queue declared");
                state.queues.insert(
                    name.clone(),
                    QueueEntry {
                        flags: queue.flags,
                        owner: queue.flags.exclusive.then_some(self.id),
                        declarations: 1,
                        messages: VecDeque::new(),
                    },
                );
            }
        }
        Ok(name)
    }

    fn bind(&mut self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::QueueNotFound(queue.to_owned()));
        }
        let entry = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| MessagingError::ExchangeNotFound(exchange.to_owned()))?;
        let binding = (queue.to_owned(), routing_key.to_owned());
        if !entry.bindings.contains(&binding) {
            entry.bindings.push(binding);
        }
        Ok(())
    }

    fn unbind(&mut self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        let entry = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| MessagingError::ExchangeNotFound(exchange.to_owned()))?;
        entry
            .bindings
            .retain(|(bound, key)| !(bound == queue && key == routing_key));
        Ok(())
    }

    fn delete_queue(&mut self, queue: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        state.remove_queue(queue);
        Ok(())
    }

    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: Properties,
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        let targets = state.route(exchange, routing_key)?;
        state.stats.published += 1;
        if targets.is_empty() {
            state.stats.dropped += 1;
            warn!(exchange, routing_key, "unroutable message dropped");
            return Ok(());
        }
        for queue in targets {
            if let Some(entry) = state.queues.get_mut(&queue) {
                entry.messages.push_back(Delivery {
                    tag: DeliveryTag(0),
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    queue: queue.clone(),
                    properties: properties.clone(),
                    body: body.clone(),
                    redelivered: false,
                });
            }
        }
        self.shared.available.notify_all();
        Ok(())
    }

    fn consume(&mut self, queues: &[String], timeout: Duration) -> Result<Option<Delivery>> {
        // Too large to represent as an instant: wait without a deadline.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.state.lock();
        loop {
            state.ensure_open()?;
            for queue in queues {
                let entry = state
                    .queues
                    .get_mut(queue)
                    .ok_or_else(|| MessagingError::QueueNotFound(queue.clone()))?;
                if entry.owner.is_some_and(|owner| owner != self.id) {
                    return Err(MessagingError::PreconditionFailed(format!(
                        "queue '{queue}' is exclusive to another channel"
                    )));
                }
                if let Some(mut delivery) = entry.messages.pop_front() {
                    state.next_tag += 1;
                    delivery.tag = DeliveryTag(state.next_tag);
                    state.unacked.insert(
                        delivery.tag,
                        Unacked {
                            channel: self.id,
                            delivery: delivery.clone(),
                        },
                    );
                    return Ok(Some(delivery));
                }
            }
            let Some(deadline) = deadline else {
                self.shared.available.wait(&mut state);
                continue;
            };
            if self
                .shared
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                // one last look before giving up
                if queues
                    .iter()
                    .any(|queue| state.queues.get(queue).is_some_and(|q| !q.messages.is_empty()))
                {
                    continue;
                }
                return Ok(None);
            }
        }
    }

    fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        if !state.owns(tag, self.id) {
            return Err(MessagingError::UnknownDeliveryTag(tag.0));
        }
        state.unacked.remove(&tag);
        state.stats.acked += 1;
        Ok(())
    }

    fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        if !state.owns(tag, self.id) {
            return Err(MessagingError::UnknownDeliveryTag(tag.0));
        }
        let pending = state
            .unacked
            .remove(&tag)
            .ok_or(MessagingError::UnknownDeliveryTag(tag.0))?;
        state.stats.rejected += 1;
        if requeue {
            let mut delivery = pending.delivery;
            delivery.redelivered = true;
            if let Some(entry) = state.queues.get_mut(&delivery.queue) {
                entry.messages.push_front(delivery);
                state.stats.requeued += 1;
                self.shared.available.notify_all();
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        let orphaned: Vec<DeliveryTag> = state
            .unacked
            .iter()
            .filter(|(_, pending)| pending.channel == self.id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in orphaned {
            if let Some(pending) = state.unacked.remove(&tag) {
                let mut delivery = pending.delivery;
                delivery.redelivered = true;
                if let Some(entry) = state.queues.get_mut(&delivery.queue) {
                    entry.messages.push_front(delivery);
                }
            }
        }
        let exclusive: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, entry)| entry.owner == Some(self.id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            state.remove_queue(&queue);
        }
        self.shared.available.notify_all();
    }
}

fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&word, rest)) => match key.split_first() {
                Some((&head, tail)) => (word == "*" || word == head) && matches(rest, tail),
                None => false,
            },
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_with_queue(
        exchange: ExchangeDescriptor,
        queue: &str,
        key: &str,
    ) -> (InMemoryBroker, InMemoryChannel) {
        let broker = InMemoryBroker::new();
        let mut channel = broker.channel();
        channel.declare_exchange(&exchange).expect("declare exchange");
        channel.declare_queue(&queue.into()).expect("declare queue");
        channel.bind(&exchange.name, queue, key).expect("bind");
        (broker, channel)
    }

    #[test]
    fn direct_exchange_routes_on_exact_key() {
        let (broker, mut channel) =
            broker_with_queue(ExchangeDescriptor::new("ex"), "q", "echo-rk");
        channel
            .publish("ex", "echo-rk", b"one".to_vec(), Properties::default())
            .expect("publish");
        channel
            .publish("ex", "other", b"two".to_vec(), Properties::default())
            .expect("publish");
        assert_eq!(broker.queue_depth("q"), Some(1));
        assert_eq!(broker.stats().dropped, 1);
    }

    #[test]
    fn redeclaring_identical_exchange_is_idempotent() {
        let broker = InMemoryBroker::new();
        let mut channel = broker.channel();
        let exchange = ExchangeDescriptor::new("ex").auto_delete(true);
        channel.declare_exchange(&exchange).expect("first");
        channel.declare_exchange(&exchange).expect("second");
        assert_eq!(broker.exchange(&exchange.name), Some(exchange.clone()));
        assert_eq!(broker.exchange_declarations("ex"), Some(2));

        let conflicting = exchange.with_type(ExchangeKind::Fanout);
        assert!(matches!(
            channel.declare_exchange(&conflicting),
            Err(MessagingError::PreconditionFailed(_))
        ));
    }

    #[test]
    fn consume_times_out_on_empty_queue() {
        let (_broker, mut channel) = broker_with_queue(ExchangeDescriptor::new("ex"), "q", "k");
        let started = Instant::now();
        let delivery = channel
            .consume(&["q".to_owned()], Duration::from_millis(10))
            .expect("consume");
        assert!(delivery.is_none());
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn unbounded_timeout_waits_for_a_late_publish() {
        let (broker, mut channel) = broker_with_queue(ExchangeDescriptor::new("ex"), "q", "k");
        let publisher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            broker
                .channel()
                .publish("ex", "k", b"late".to_vec(), Properties::default())
                .expect("publish");
        });
        let delivery = channel
            .consume(&["q".to_owned()], Duration::MAX)
            .expect("consume")
            .expect("delivery");
        assert_eq!(delivery.body, b"late");
        publisher.join().expect("publisher thread");
    }

    #[test]
    fn reject_with_requeue_redelivers_first() {
        let (broker, mut channel) = broker_with_queue(ExchangeDescriptor::new("ex"), "q", "k");
        for body in [b"a", b"b"] {
            channel
                .publish("ex", "k", body.to_vec(), Properties::default())
                .expect("publish");
        }
        let queues = ["q".to_owned()];
        let first = channel
            .consume(&queues, Duration::ZERO)
            .expect("consume")
            .expect("delivery");
        channel.reject(first.tag, true).expect("reject");
        let again = channel
            .consume(&queues, Duration::ZERO)
            .expect("consume")
            .expect("delivery");
        assert_eq!(again.body, b"a");
        assert!(again.redelivered);
        channel.ack(again.tag).expect("ack");
        assert!(matches!(
            channel.ack(again.tag),
            Err(MessagingError::UnknownDeliveryTag(_))
        ));
        let stats = broker.stats();
        assert_eq!((stats.acked, stats.rejected, stats.requeued), (1, 1, 1));
    }

    #[test]
    fn default_exchange_routes_to_named_queue() {
        let broker = InMemoryBroker::new();
        let mut channel = broker.channel();
        let reply = channel.declare_private_reply_queue().expect("reply queue");
        assert!(reply.starts_with("amq.gen-"));
        channel
            .publish("", &reply, b"pong".to_vec(), Properties::default())
            .expect("publish");
        assert_eq!(broker.queue_depth(&reply), Some(1));
    }

    #[test]
    fn dropping_a_channel_requeues_and_removes_exclusive_queues() {
        let (broker, mut channel) = broker_with_queue(ExchangeDescriptor::new("ex"), "q", "k");
        let reply = channel.declare_private_reply_queue().expect("reply");
        channel
            .publish("ex", "k", b"x".to_vec(), Properties::default())
            .expect("publish");
        let _delivery = channel
            .consume(&["q".to_owned()], Duration::ZERO)
            .expect("consume");
        assert_eq!(broker.unacked(), 1);
        drop(channel);
        assert_eq!(broker.unacked(), 0);
        assert_eq!(broker.queue_depth("q"), Some(1));
        assert_eq!(broker.queue_depth(&reply), None);
    }

    #[test]
    fn topic_patterns_match_words() {
        assert!(topic_matches("logs.*", "logs.error"));
        assert!(!topic_matches("logs.*", "logs.error.disk"));
        assert!(topic_matches("logs.#", "logs.error.disk"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("metrics.*", "logs.error"));
    }

    #[test]
    fn shut_down_broker_refuses_operations() {
        let broker = InMemoryBroker::new();
        let mut channel = broker.channel();
        broker.shutdown();
        assert!(matches!(
            channel.declare_queue(&"q".into()),
            Err(MessagingError::ChannelClosed(_))
        ));
    }
}
