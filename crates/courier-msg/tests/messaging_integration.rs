//! ---
//! courier_section: "02-messaging-envelope"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Envelopes travelling through the in-memory broker."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::time::Duration;

use courier_msg::{
    CborCodec, Channel, Codec, Envelope, ExchangeDescriptor, ExchangeKind, Fingerprint,
    InMemoryBroker, JsonCodec, MessagingError, Properties, QueueFlags, QueueSpec, RpcResult,
};
use serde_json::json;

fn fanout_with_queues(broker: &InMemoryBroker, queues: &[&str]) -> anyhow::Result<()> {
    let mut channel = broker.channel();
    channel.declare_exchange(&ExchangeDescriptor::new("status").with_type(ExchangeKind::Fanout))?;
    for queue in queues {
        channel.declare_queue(&QueueSpec::from(*queue))?;
        channel.bind("status", queue, "ignored")?;
    }
    Ok(())
}

#[test]
fn status_envelope_fans_out_to_every_queue() -> anyhow::Result<()> {
    let broker = InMemoryBroker::new();
    fanout_with_queues(&broker, &["monitor", "audit"])?;

    let mut envelope = Envelope::status("online");
    envelope.stamp_fingerprint(&Fingerprint::new("probe", "/").as_map());
    let codec = JsonCodec;
    broker.channel().publish(
        "status",
        "whatever",
        envelope.encode(&codec)?,
        Properties::with_content_type(codec.content_type()),
    )?;

    for queue in ["monitor", "audit"] {
        let delivery = broker.pop(queue).expect("fanout delivery");
        let received = Envelope::decode(&codec, &delivery.body)?;
        assert_eq!(received, envelope);
        assert_eq!(delivery.properties.content_type.as_deref(), Some("application/json"));
    }
    Ok(())
}

#[test]
fn cbor_and_json_carry_the_same_envelope() -> anyhow::Result<()> {
    let envelope = Envelope::rpc_command("resize", json!({"width": 3, "tags": ["a", "b"]}));
    let codecs: [&dyn Codec; 2] = [&JsonCodec, &CborCodec];
    for codec in codecs {
        let decoded = Envelope::decode(codec, &envelope.encode(codec)?)?;
        assert_eq!(decoded, envelope);
    }
    Ok(())
}

#[test]
fn reply_queue_round_trip_through_the_default_exchange() -> anyhow::Result<()> {
    let broker = InMemoryBroker::new();
    let mut caller = broker.channel();
    let reply_to = caller.declare_private_reply_queue()?;
    assert!(reply_to.starts_with("amq.gen-"));

    let mut replier = broker.channel();
    let body = RpcResult::exception("ValueError", "bad").to_envelope().encode(&JsonCodec)?;
    replier.publish("", &reply_to, body, Properties::default())?;

    let delivery = caller
        .consume(&[reply_to.clone()], Duration::from_millis(50))?
        .expect("reply");
    caller.ack(delivery.tag)?;
    let envelope = Envelope::decode(&JsonCodec, &delivery.body)?;
    assert_eq!(
        RpcResult::from_content(&envelope.content),
        RpcResult::exception("ValueError", "bad")
    );

    drop(caller);
    assert_eq!(broker.queue_depth(&reply_to), None);
    Ok(())
}

#[test]
fn exclusive_queue_refuses_foreign_consumers() -> anyhow::Result<()> {
    let broker = InMemoryBroker::new();
    let mut owner = broker.channel();
    let queue = owner.declare_queue(&QueueSpec::new("", QueueFlags::private_reply()))?;
    let mut intruder = broker.channel();
    let err = intruder
        .consume(&[queue], Duration::from_millis(1))
        .expect_err("exclusive");
    assert!(matches!(err, MessagingError::PreconditionFailed(_)));
    Ok(())
}

#[test]
fn incompatible_redeclaration_is_a_precondition_failure() {
    let broker = InMemoryBroker::new();
    let mut channel = broker.channel();
    channel
        .declare_exchange(&ExchangeDescriptor::new("apps"))
        .expect("first declaration");
    let err = channel
        .declare_exchange(&ExchangeDescriptor::new("apps").with_type(ExchangeKind::Fanout))
        .expect_err("type mismatch");
    assert!(matches!(err, MessagingError::PreconditionFailed(_)));
    assert_eq!(broker.exchange_declarations("apps"), Some(1));
}
