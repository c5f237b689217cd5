//! ---
//! courier_section: "05-demo-cli"
//! courier_subsection: "binary"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Echo sender and receiver sharing one in-process broker."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use courier_common::{init_tracing, CourierConfig};
use courier_core::{
    Binding, Component, Consumer, Flow, MessageProcessor, Producer, RegistryBuilder, Route,
};
use courier_msg::{
    CborCodec, Codec, ExchangeDescriptor, Fingerprint, InMemoryBroker, JsonCodec,
};
use courier_rt::{MicroScheduler, ThreadState};
use serde_json::{json, Value as JsonValue};
use tracing::info;

const EXCHANGE: &str = "echo-exchange";
const QUEUE: &str = "echo-queue";
const ROUTING_KEY: &str = "echo-rk";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CodecChoice {
    Json,
    Cbor,
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Send echo commands to an echo receiver", long_about = None)]
struct Cli {
    /// TOML configuration file; `COURIER_*` variables apply otherwise.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Body codec used on the wire.
    #[arg(long, value_enum, default_value = "json")]
    codec: CodecChoice,
    /// Messages to echo, in order.
    #[arg(default_value = "A test message")]
    messages: Vec<String>,
}

struct EchoReceiver;

impl Component for EchoReceiver {
    fn register_handlers(registry: &mut RegistryBuilder<Self>) {
        registry.message("command", "echo", |_: &mut EchoReceiver, content| {
            match &content["parameters"] {
                JsonValue::String(text) => println!("{text}"),
                other => println!("{other}"),
            }
            Ok(Flow::Continue)
        });
    }
}

fn echo_exchange() -> ExchangeDescriptor {
    ExchangeDescriptor::new(EXCHANGE).auto_delete(true)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => CourierConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CourierConfig::from_env(),
    };
    init_tracing("courier-echo", &config.logging)?;

    let codec: Arc<dyn Codec> = match cli.codec {
        CodecChoice::Json => Arc::new(JsonCodec),
        CodecChoice::Cbor => Arc::new(CborCodec),
    };
    let broker = InMemoryBroker::new();

    let mut consumer = Consumer::new(
        Box::new(broker.channel()),
        Arc::clone(&codec),
        &Fingerprint::new("echo_receive", &config.broker.vhost),
    );
    consumer.add_bindings(&[Binding::new(echo_exchange(), QUEUE, ROUTING_KEY)])?;
    let receiver = MessageProcessor::new("echo_receive", EchoReceiver, consumer, &config.consumer);

    let mut sender = Producer::new(
        Box::new(broker.channel()),
        vec![(echo_exchange(), ROUTING_KEY.to_owned())],
        &Fingerprint::new("echo_send", &config.broker.vhost),
        &config.rpc,
    )?
    .with_codec(codec);
    for message in &cli.messages {
        sender.message_command("echo").send(json!(message))?;
    }
    sender.send_command("quit", JsonValue::Null, &Route::Default)?;

    let mut scheduler = MicroScheduler::new();
    scheduler.add(receiver)?;
    for tick in scheduler.run() {
        if tick.state == ThreadState::Failed {
            anyhow::bail!("{} failed in round {}", tick.thread, tick.round);
        }
    }

    let stats = broker.stats();
    info!(
        published = stats.published,
        acked = stats.acked,
        rejected = stats.rejected,
        "echo run finished"
    );
    Ok(())
}
