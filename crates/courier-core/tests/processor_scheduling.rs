//! ---
//! courier_section: "03-dispatch-rpc"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Processors stepped by the cooperative scheduler."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use courier_common::ConsumerConfig;
use courier_core::{
    Binding, Component, Consumer, Filter, FilterArgs, FilterError, Flow, MessageProcessor,
    RegistryBuilder,
};
use courier_msg::{
    Channel, Envelope, ExchangeDescriptor, Fingerprint, InMemoryBroker, JsonCodec, Properties,
};
use courier_rt::{MicroScheduler, ThreadState};
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};

type Journal = Arc<Mutex<Vec<String>>>;

struct Logger {
    label: &'static str,
    journal: Journal,
}

impl Component for Logger {
    fn register_handlers(registry: &mut RegistryBuilder<Self>) {
        registry.message("command", "echo", |logger: &mut Logger, body| {
            logger
                .journal
                .lock()
                .push(format!("{} {}", logger.label, body["parameters"]));
            Ok(Flow::Continue)
        });
        registry
            .message("command", "echo", |logger: &mut Logger, _| {
                logger.journal.lock().push(format!("{} picky", logger.label));
                Ok(Flow::Continue)
            })
            .filter(Filter::new("only_strings", |body: JsonValue, _: &FilterArgs| {
                if body["parameters"].is_string() {
                    Ok(body)
                } else {
                    Err(FilterError::new("parameters must be a string"))
                }
            }));
    }
}

fn config() -> ConsumerConfig {
    ConsumerConfig {
        poll_timeout: Duration::from_millis(10),
    }
}

fn processor(broker: &InMemoryBroker, label: &'static str, journal: &Journal) -> MessageProcessor<Logger> {
    let mut consumer = Consumer::new(
        Box::new(broker.channel()),
        Arc::new(JsonCodec),
        &Fingerprint::new(label, "/"),
    );
    consumer
        .add_bindings(&[Binding::new(ExchangeDescriptor::new("echo-exchange"), label, label)])
        .expect("bind");
    MessageProcessor::new(
        label,
        Logger {
            label,
            journal: Arc::clone(journal),
        },
        consumer,
        &config(),
    )
}

fn send(broker: &InMemoryBroker, key: &str, envelope: Envelope) {
    broker
        .channel()
        .publish(
            "echo-exchange",
            key,
            envelope.encode(&JsonCodec).expect("encode"),
            Properties::with_content_type("application/json"),
        )
        .expect("publish");
}

#[test]
fn quit_removes_only_the_quitting_component() {
    let broker = InMemoryBroker::new();
    let journal = Journal::default();
    let mut scheduler = MicroScheduler::new();
    scheduler.add(processor(&broker, "a", &journal)).expect("add a");
    scheduler.add(processor(&broker, "b", &journal)).expect("add b");

    send(&broker, "a", Envelope::command("quit", JsonValue::Null));
    send(&broker, "a", Envelope::command("echo", json!("never")));
    send(&broker, "b", Envelope::command("echo", json!("hello")));

    let ticks: Vec<_> = scheduler.run().take(2).collect();
    assert_eq!(ticks[0].thread, "a");
    assert_eq!(ticks[0].state, ThreadState::Terminated);
    assert_eq!(scheduler.names(), vec!["b".to_owned()]);
    assert_eq!(*journal.lock(), vec!["b \"hello\"", "b picky"]);
    assert_eq!(broker.queue_depth("a"), Some(1));
    assert_eq!(broker.stats().acked, 2);

    send(&broker, "b", Envelope::command("quit", JsonValue::Null));
    scheduler.run_to_completion();
    assert!(scheduler.is_empty());
}

#[test]
fn veto_leaves_sibling_handlers_running() {
    let broker = InMemoryBroker::new();
    let journal = Journal::default();
    let mut processor = processor(&broker, "a", &journal);
    let stats = processor.stats_handle();
    send(&broker, "a", Envelope::command("echo", json!(7)));

    let mut scheduler = MicroScheduler::new();
    scheduler.add(processor).expect("add");
    scheduler.run().next().expect("one tick");

    assert_eq!(*journal.lock(), vec!["a 7"]);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.handlers_invoked, 1);
    assert_eq!(snapshot.filtered, 1);
    assert_eq!(snapshot.acked, 1);
}

#[test]
fn envelopes_are_processed_in_queue_order() {
    let broker = InMemoryBroker::new();
    let journal = Journal::default();
    let mut scheduler = MicroScheduler::new();
    scheduler.add(processor(&broker, "a", &journal)).expect("add");
    for word in ["one", "two", "three"] {
        send(&broker, "a", Envelope::command("echo", json!(word)));
    }
    send(&broker, "a", Envelope::command("quit", JsonValue::Null));

    assert_eq!(scheduler.run_to_completion(), 4);
    let journal = journal.lock();
    let plain: Vec<&String> = journal.iter().filter(|line| !line.ends_with("picky")).collect();
    assert_eq!(plain, vec!["a \"one\"", "a \"two\"", "a \"three\""]);
}

#[test]
fn redeclaring_the_same_exchange_is_harmless() {
    let broker = InMemoryBroker::new();
    let journal = Journal::default();
    let _first = processor(&broker, "a", &journal);
    let _second = processor(&broker, "b", &journal);
    assert_eq!(broker.exchange_declarations("echo-exchange"), Some(2));
    assert!(broker.exchange("echo-exchange").is_some());
}
