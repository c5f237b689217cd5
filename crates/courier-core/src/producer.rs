//! ---
//! courier_section: "03-dispatch-rpc"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Producer side of a component: message publishing and RPC calls."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! A [`Producer`] owns its own channel. RPC calls block the calling thread
//! until a reply arrives or every retry timed out, so a component must
//! never issue a call through the channel its processor consumes from:
//! handlers that need to call other components hold a dedicated producer.
//!
//! A retry republishes the same request. Handlers that are not idempotent
//! may therefore run more than once for a single call.
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use courier_common::RpcConfig;
use courier_msg::{
    log_envelope, Channel, Codec, Envelope, ExchangeDescriptor, Fingerprint, JsonCodec,
    MessageDirection, MessagingMetricsExporter, Properties, RpcResult,
};
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::error::CourierError;
use crate::rpc::{self, CallOptions};

/// Destination selection of one send.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Route {
    /// Every configured (exchange, routing key) pair.
    #[default]
    Default,
    /// The first configured exchange with another routing key.
    Key(String),
    /// An explicit list, declared on use.
    Explicit(Vec<(ExchangeDescriptor, String)>),
}

impl Route {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }
}

/// Builds the envelope of a named command from its parameters.
pub type CommandBuilder = Arc<dyn Fn(JsonValue) -> Envelope + Send + Sync>;

/// Named envelope builders of a producer, one table per category.
///
/// Names without a registered builder fall back to a plain `command`
/// envelope carrying the parameters.
#[derive(Clone, Default)]
pub struct CommandBook {
    messages: BTreeMap<String, CommandBuilder>,
    rpcs: BTreeMap<String, CommandBuilder>,
}

impl CommandBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_message<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(JsonValue) -> Envelope + Send + Sync + 'static,
    {
        self.messages.insert(name.into(), Arc::new(builder));
    }

    pub fn register_rpc<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(JsonValue) -> Envelope + Send + Sync + 'static,
    {
        self.rpcs.insert(name.into(), Arc::new(builder));
    }

    pub fn build_message(&self, name: &str, parameters: JsonValue) -> Envelope {
        match self.messages.get(name) {
            Some(builder) => builder(parameters),
            None => Envelope::command(name, parameters),
        }
    }

    pub fn build_rpc(&self, name: &str, parameters: JsonValue) -> Envelope {
        match self.rpcs.get(name) {
            Some(builder) => builder(parameters),
            None => Envelope::rpc_command(name, parameters),
        }
    }

    pub fn message_names(&self) -> impl Iterator<Item = &str> {
        self.messages.keys().map(String::as_str)
    }

    pub fn rpc_names(&self) -> impl Iterator<Item = &str> {
        self.rpcs.keys().map(String::as_str)
    }
}

/// Publishing half of a component.
pub struct Producer {
    channel: Box<dyn Channel>,
    codec: Arc<dyn Codec>,
    fingerprint: Map<String, JsonValue>,
    routes: Vec<(ExchangeDescriptor, String)>,
    options: CallOptions,
    commands: CommandBook,
    metrics: Option<MessagingMetricsExporter>,
}

impl Producer {
    /// Declare every routing exchange and stamp outgoing envelopes with
    /// `fingerprint`.
    pub fn new(
        mut channel: Box<dyn Channel>,
        routes: Vec<(ExchangeDescriptor, String)>,
        fingerprint: &Fingerprint,
        config: &RpcConfig,
    ) -> Result<Self, CourierError> {
        for (exchange, key) in &routes {
            channel.declare_exchange(exchange)?;
            debug!(exchange = %exchange.name, routing_key = %key, "producer route declared");
        }
        Ok(Self {
            channel,
            codec: Arc::new(JsonCodec),
            fingerprint: fingerprint.as_map(),
            routes,
            options: CallOptions::from(config),
            commands: CommandBook::new(),
            metrics: None,
        })
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Override or extend the stamped fingerprint fields.
    pub fn with_fingerprint_overrides(mut self, overrides: &Map<String, JsonValue>) -> Self {
        for (key, value) in overrides {
            self.fingerprint.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn with_commands(mut self, commands: CommandBook) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_metrics(mut self, metrics: MessagingMetricsExporter) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn commands_mut(&mut self) -> &mut CommandBook {
        &mut self.commands
    }

    pub fn fingerprint(&self) -> &Map<String, JsonValue> {
        &self.fingerprint
    }

    pub fn options(&self) -> CallOptions {
        self.options
    }

    fn targets(&mut self, route: &Route, what: &str) -> Result<Vec<(String, String)>, CourierError> {
        let targets: Vec<(String, String)> = match route {
            Route::Default => self
                .routes
                .iter()
                .map(|(exchange, key)| (exchange.name.clone(), key.clone()))
                .collect(),
            Route::Key(key) => self
                .routes
                .first()
                .map(|(exchange, _)| (exchange.name.clone(), key.clone()))
                .into_iter()
                .collect(),
            Route::Explicit(pairs) => {
                for (exchange, _) in pairs {
                    self.channel.declare_exchange(exchange)?;
                }
                pairs
                    .iter()
                    .map(|(exchange, key)| (exchange.name.clone(), key.clone()))
                    .collect()
            }
        };
        if targets.is_empty() {
            return Err(CourierError::NoRoute(what.to_owned()));
        }
        Ok(targets)
    }

    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: Properties,
    ) -> Result<(), CourierError> {
        debug!(exchange, routing_key, "publish");
        self.channel.publish(exchange, routing_key, body, properties)?;
        if let Some(metrics) = &self.metrics {
            metrics.observe_published();
        }
        Ok(())
    }

    fn properties(&self) -> Properties {
        Properties::with_content_type(self.codec.content_type())
    }

    /// Stamp and publish a prepared envelope to every target of `route`.
    pub fn message(&mut self, mut envelope: Envelope, route: &Route) -> Result<(), CourierError> {
        envelope.stamp_fingerprint(&self.fingerprint);
        self.forward(&envelope, route)
    }

    /// Publish an envelope as is, keeping the original sender fingerprint.
    pub fn forward(&mut self, envelope: &Envelope, route: &Route) -> Result<(), CourierError> {
        let targets = self.targets(route, &envelope.name)?;
        log_envelope(MessageDirection::Outbound, envelope);
        let body = envelope.encode(self.codec.as_ref())?;
        for (exchange, key) in targets {
            self.publish(&exchange, &key, body.clone(), self.properties())?;
        }
        Ok(())
    }

    /// Fire-and-forget command built by the command book.
    pub fn send_command(
        &mut self,
        name: &str,
        parameters: JsonValue,
        route: &Route,
    ) -> Result<(), CourierError> {
        let envelope = self.commands.build_message(name, parameters);
        self.message(envelope, route)
    }

    /// Sender bound to a message command name.
    pub fn message_command(&mut self, name: &str) -> MessageCommand<'_> {
        MessageCommand {
            producer: self,
            name: name.to_owned(),
            route: Route::Default,
        }
    }

    /// Caller bound to an RPC command name.
    pub fn rpc_command(&mut self, name: &str) -> RpcCommand<'_> {
        let options = self.options;
        RpcCommand {
            producer: self,
            name: name.to_owned(),
            route: Route::Default,
            options,
        }
    }

    /// Blocking RPC with the configured timeout and retries.
    pub fn call(&mut self, name: &str, parameters: JsonValue) -> RpcResult {
        let options = self.options;
        let envelope = self.commands.build_rpc(name, parameters);
        self.call_envelope(envelope, &Route::Default, options)
    }

    /// Blocking RPC of a prepared envelope.
    ///
    /// The request goes to the first target of `route`. Each attempt uses
    /// a fresh private reply queue; a timed out attempt is retried until
    /// `options.max_retry` retries are spent. Failures never escape as
    /// errors: they come back as an `exception` result.
    pub fn call_envelope(&mut self, mut envelope: Envelope, route: &Route, options: CallOptions) -> RpcResult {
        envelope.stamp_fingerprint(&self.fingerprint);
        match self.request(&envelope, route, options) {
            Ok(result) => result,
            Err(err) => {
                if matches!(err, CourierError::Timeout { .. }) {
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_rpc_timeout();
                    }
                }
                warn!(name = %envelope.name, error = %err, "rpc call failed");
                RpcResult::exception(err.kind(), err.to_string())
            }
        }
    }

    fn request(&mut self, envelope: &Envelope, route: &Route, options: CallOptions) -> Result<RpcResult, CourierError> {
        let (exchange, key) = self
            .targets(route, &envelope.name)?
            .into_iter()
            .next()
            .ok_or_else(|| CourierError::NoRoute(envelope.name.clone()))?;
        let body = envelope.encode(self.codec.as_ref())?;
        let mut attempt = 0;
        loop {
            let direction = if attempt == 0 {
                MessageDirection::Outbound
            } else {
                MessageDirection::Retry
            };
            log_envelope(direction, envelope);
            match self.attempt(&exchange, &key, body.clone(), options.timeout) {
                Err(CourierError::Timeout { queue, timeout }) if attempt < options.max_retry => {
                    attempt += 1;
                    warn!(
                        name = %envelope.name,
                        %queue,
                        ?timeout,
                        attempt,
                        max_retry = options.max_retry,
                        "rpc reply timed out; retrying"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_rpc_retry();
                    }
                }
                outcome => return outcome,
            }
        }
    }

    fn attempt(
        &mut self,
        exchange: &str,
        key: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<RpcResult, CourierError> {
        let reply_to = self.channel.declare_private_reply_queue()?;
        self.publish(exchange, key, body, self.properties().reply_to(reply_to.clone()))?;
        let outcome = rpc::await_reply(self.channel.as_mut(), self.codec.as_ref(), &reply_to, timeout);
        if let Err(err) = self.channel.delete_queue(&reply_to) {
            warn!(queue = %reply_to, error = %err, "unable to delete reply queue");
        }
        outcome
    }

    /// Publish an RPC request once and return its reply queue without
    /// waiting. Collect the reply later with [`Producer::consume_rpc`].
    pub fn call_queue_only(
        &mut self,
        mut envelope: Envelope,
        route: &Route,
    ) -> Result<String, CourierError> {
        envelope.stamp_fingerprint(&self.fingerprint);
        let (exchange, key) = self
            .targets(route, &envelope.name)?
            .into_iter()
            .next()
            .ok_or_else(|| CourierError::NoRoute(envelope.name.clone()))?;
        log_envelope(MessageDirection::Outbound, &envelope);
        let body = envelope.encode(self.codec.as_ref())?;
        let reply_to = self.channel.declare_private_reply_queue()?;
        self.publish(&exchange, &key, body, self.properties().reply_to(reply_to.clone()))?;
        Ok(reply_to)
    }

    /// Collect up to `count` replies from `queue`, waiting at most
    /// `timeout` for each, then delete the queue. An empty collection
    /// yields a single `error` result.
    pub fn consume_rpc(&mut self, queue: &str, count: usize, timeout: Duration) -> Vec<RpcResult> {
        let mut results = Vec::new();
        while results.len() < count {
            match rpc::await_reply(self.channel.as_mut(), self.codec.as_ref(), queue, timeout) {
                Ok(result) => results.push(result),
                Err(err) => {
                    warn!(queue, error = %err, collected = results.len(), "stopped collecting rpc replies");
                    break;
                }
            }
        }
        if let Err(err) = self.channel.delete_queue(queue) {
            warn!(queue, error = %err, "unable to delete reply queue");
        }
        if results.is_empty() {
            results.push(RpcResult::error(format!("no reply collected from {queue}")));
        }
        results
    }
}

/// Sender returned by [`Producer::message_command`].
pub struct MessageCommand<'a> {
    producer: &'a mut Producer,
    name: String,
    route: Route,
}

impl MessageCommand<'_> {
    pub fn route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    pub fn send(self, parameters: JsonValue) -> Result<(), CourierError> {
        self.producer.send_command(&self.name, parameters, &self.route)
    }
}

/// Caller returned by [`Producer::rpc_command`].
pub struct RpcCommand<'a> {
    producer: &'a mut Producer,
    name: String,
    route: Route,
    options: CallOptions,
}

impl RpcCommand<'_> {
    pub fn route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.options.max_retry = max_retry;
        self
    }

    pub fn call(self, parameters: JsonValue) -> RpcResult {
        let envelope = self.producer.commands.build_rpc(&self.name, parameters);
        self.producer.call_envelope(envelope, &self.route, self.options)
    }

    /// Publish without waiting; see [`Producer::call_queue_only`].
    pub fn queue_only(self, parameters: JsonValue) -> Result<String, CourierError> {
        let envelope = self.producer.commands.build_rpc(&self.name, parameters);
        self.producer.call_queue_only(envelope, &self.route)
    }
}

/// Text file as a `{name, content}` mapping, one entry per line.
pub fn serialize_text_file(path: &Path) -> std::io::Result<JsonValue> {
    let content = std::fs::read_to_string(path)?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    info!(file = %path.display(), "serialized text file");
    Ok(json!({
        "name": name,
        "content": content.split_inclusive('\n').collect::<Vec<_>>(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_msg::{Category, InMemoryBroker};

    fn producer(broker: &InMemoryBroker, routes: Vec<(ExchangeDescriptor, String)>) -> Producer {
        Producer::new(
            Box::new(broker.channel()),
            routes,
            &Fingerprint::new("producer", "/"),
            &RpcConfig::default(),
        )
        .expect("producer")
    }

    fn bound_queue(broker: &InMemoryBroker, exchange: &str, queue: &str, key: &str) {
        let mut channel = broker.channel();
        channel
            .declare_exchange(&ExchangeDescriptor::new(exchange))
            .expect("exchange");
        channel.declare_queue(&queue.into()).expect("queue");
        channel.bind(exchange, queue, key).expect("bind");
    }

    fn pop_envelope(broker: &InMemoryBroker, queue: &str) -> Envelope {
        let delivery = broker.pop(queue).expect("queued delivery");
        Envelope::decode(&JsonCodec, &delivery.body).expect("decode")
    }

    #[test]
    fn default_route_publishes_to_every_pair() {
        let broker = InMemoryBroker::new();
        bound_queue(&broker, "a", "qa", "ka");
        bound_queue(&broker, "b", "qb", "kb");
        let mut producer = producer(
            &broker,
            vec![
                (ExchangeDescriptor::new("a"), "ka".into()),
                (ExchangeDescriptor::new("b"), "kb".into()),
            ],
        );
        producer
            .send_command("echo", json!("hi"), &Route::Default)
            .expect("send");
        let envelope = pop_envelope(&broker, "qa");
        assert_eq!(envelope.parameters(), Some(&json!("hi")));
        assert_eq!(envelope.fingerprint["name"], json!("producer"));
        assert_eq!(broker.queue_depth("qb"), Some(1));
    }

    #[test]
    fn key_route_uses_first_exchange() {
        let broker = InMemoryBroker::new();
        bound_queue(&broker, "a", "other", "other-key");
        let mut producer = producer(&broker, vec![(ExchangeDescriptor::new("a"), "ka".into())]);
        producer
            .message_command("ping")
            .route(Route::key("other-key"))
            .send(JsonValue::Null)
            .expect("send");
        assert_eq!(pop_envelope(&broker, "other").name, "ping");
    }

    #[test]
    fn explicit_route_declares_its_exchanges() {
        let broker = InMemoryBroker::new();
        let mut producer = producer(&broker, Vec::new());
        let route = Route::Explicit(vec![(ExchangeDescriptor::new("late"), "k".into())]);
        producer
            .message(Envelope::status("online"), &route)
            .expect("send");
        assert!(broker.exchange("late").is_some());
    }

    #[test]
    fn sending_without_routes_fails() {
        let broker = InMemoryBroker::new();
        let mut producer = producer(&broker, Vec::new());
        let err = producer
            .send_command("echo", JsonValue::Null, &Route::Default)
            .expect_err("no route");
        assert!(matches!(err, CourierError::NoRoute(name) if name == "echo"));
    }

    #[test]
    fn forward_keeps_the_original_sender() {
        let broker = InMemoryBroker::new();
        bound_queue(&broker, "a", "qa", "ka");
        let mut producer = producer(&broker, vec![(ExchangeDescriptor::new("a"), "ka".into())]);
        let mut original = Envelope::command("echo", json!(1));
        original.stamp_fingerprint(&Fingerprint::new("origin", "/").as_map());
        producer.forward(&original, &Route::Default).expect("forward");
        assert_eq!(pop_envelope(&broker, "qa").fingerprint["name"], json!("origin"));
    }

    #[test]
    fn fingerprint_overrides_reach_envelopes() {
        let broker = InMemoryBroker::new();
        bound_queue(&broker, "a", "qa", "ka");
        let mut overrides = Map::new();
        overrides.insert("name".into(), json!("renamed"));
        overrides.insert("role".into(), json!("probe"));
        let mut producer = producer(&broker, vec![(ExchangeDescriptor::new("a"), "ka".into())])
            .with_fingerprint_overrides(&overrides);
        producer
            .send_command("echo", JsonValue::Null, &Route::Default)
            .expect("send");
        let envelope = pop_envelope(&broker, "qa");
        assert_eq!(envelope.fingerprint["name"], json!("renamed"));
        assert_eq!(envelope.fingerprint["role"], json!("probe"));
    }

    #[test]
    fn command_book_builders_override_defaults() {
        let mut book = CommandBook::new();
        book.register_message("online", |_| Envelope::status("online"));
        book.register_rpc("sum", |values| {
            Envelope::rpc_command("sum", json!({"values": values}))
        });
        assert_eq!(book.build_message("online", JsonValue::Null).kind, "status");
        assert_eq!(book.build_message("echo", json!(1)).kind, "command");
        let sum = book.build_rpc("sum", json!([1]));
        assert_eq!(sum.category, Category::Rpc);
        assert_eq!(sum.parameters(), Some(&json!({"values": [1]})));
        assert_eq!(book.rpc_names().collect::<Vec<_>>(), vec!["sum"]);
    }

    #[test]
    fn timed_out_call_retries_then_reports_exception() {
        let broker = InMemoryBroker::new();
        bound_queue(&broker, "a", "silent", "silent");
        let mut producer = producer(&broker, vec![(ExchangeDescriptor::new("a"), "silent".into())]);
        let result = producer
            .rpc_command("nobody_home")
            .timeout(Duration::from_millis(10))
            .max_retry(2)
            .call(JsonValue::Null);
        assert_eq!(result.value, json!("TimeoutError"));
        assert!(!result.is_success());
        assert_eq!(broker.stats().published, 3);
        assert_eq!(broker.queue_depth("silent"), Some(3));
    }

    #[test]
    fn queue_only_call_returns_reply_queue() {
        let broker = InMemoryBroker::new();
        bound_queue(&broker, "a", "qa", "ka");
        let mut producer = producer(&broker, vec![(ExchangeDescriptor::new("a"), "ka".into())]);
        let reply_to = producer
            .rpc_command("work")
            .queue_only(json!({"n": 1}))
            .expect("published");
        let request = broker.pop("qa").expect("request queued");
        assert_eq!(request.properties.reply_to.as_deref(), Some(reply_to.as_str()));

        let collected = producer.consume_rpc(&reply_to, 1, Duration::from_millis(10));
        assert_eq!(collected.len(), 1);
        assert!(!collected[0].is_success());
    }

    #[test]
    fn consume_rpc_stops_at_the_last_available_reply() {
        let broker = InMemoryBroker::new();
        bound_queue(&broker, "a", "qa", "ka");
        let mut producer = producer(&broker, vec![(ExchangeDescriptor::new("a"), "ka".into())]);
        let reply_to = producer
            .rpc_command("work")
            .queue_only(json!({"n": 1}))
            .expect("published");
        let reply = RpcResult::success(json!(1), "done")
            .to_envelope()
            .encode(&JsonCodec)
            .expect("encode");
        broker
            .channel()
            .publish("", &reply_to, reply, Properties::default())
            .expect("reply");

        let collected = producer.consume_rpc(&reply_to, usize::MAX, Duration::from_millis(10));
        assert_eq!(collected, vec![RpcResult::success(json!(1), "done")]);
    }

    #[test]
    fn text_files_serialize_line_by_line() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "one\ntwo\n").expect("write");
        let value = serialize_text_file(&path).expect("serialize");
        assert_eq!(value, json!({"name": "notes.txt", "content": ["one\n", "two\n"]}));
    }
}
