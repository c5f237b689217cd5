//! ---
//! courier_section: "03-dispatch-rpc"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Application conventions: standard bindings, groups and ping."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! An [`Application`] wraps a component with the addressing conventions
//! shared by every courier application on the application exchange:
//!
//! | routing key          | queue          | delivery                      |
//! |----------------------|----------------|-------------------------------|
//! | `name/rr`            | `name`         | round robin by name           |
//! | `name`               | `pid@host`     | every instance of `name`      |
//! | `@host`              | `pid@host`     | every application on `host`   |
//! | `name@host/rr`       | `name@host`    | round robin by name and host  |
//! | `name@host`          | `pid@host`     | every `name` on `host`        |
//! | `pid@host`           | `pid@host`     | this instance only            |
//! | `name#group`         | `pid@host`     | every member of the group     |
//! | `name#group/rr`      | `name#group`   | round robin within the group  |
use std::sync::Arc;

use courier_common::ConsumerConfig;
use courier_msg::{
    Channel, Codec, ExchangeDescriptor, Fingerprint, QueueFlags, QueueSpec, RpcResult,
};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::consumer::{Binding, BindingChange, Consumer};
use crate::dispatch::Flow;
use crate::error::{CourierError, HandlerError};
use crate::processor::MessageProcessor;
use crate::registry::{Component, HandlerRegistry, RegistryBuilder};
use crate::rpc::Reply;

/// Name of the exchange applications listen on.
pub const APPLICATION_EXCHANGE: &str = "generic-application-exchange";

/// Durable direct exchange shared by applications.
pub fn application_exchange() -> ExchangeDescriptor {
    ExchangeDescriptor::new(APPLICATION_EXCHANGE)
}

fn shared_queue(name: String) -> QueueSpec {
    QueueSpec::new(name, QueueFlags::auto_delete())
}

fn unique_queue(fingerprint: &Fingerprint) -> QueueSpec {
    shared_queue(format!("{}@{}", fingerprint.pid, fingerprint.host))
}

/// The six bindings every application instance holds.
pub fn standard_bindings(exchange: &ExchangeDescriptor, fingerprint: &Fingerprint) -> Vec<Binding> {
    let Fingerprint {
        name, pid, host, ..
    } = fingerprint;
    let system = shared_queue(name.clone());
    let host_wide = shared_queue(format!("{name}@{host}"));
    let unique = unique_queue(fingerprint);
    vec![
        Binding::new(exchange.clone(), system, format!("{name}/rr")),
        Binding::new(exchange.clone(), unique.clone(), name.clone()),
        Binding::new(exchange.clone(), unique.clone(), format!("@{host}")),
        Binding::new(exchange.clone(), host_wide, format!("{name}@{host}/rr")),
        Binding::new(exchange.clone(), unique.clone(), format!("{name}@{host}")),
        Binding::new(exchange.clone(), unique, format!("{pid}@{host}")),
    ]
}

/// Fanout and round robin bindings of one group.
pub fn group_bindings(
    exchange: &ExchangeDescriptor,
    fingerprint: &Fingerprint,
    group: &str,
) -> Vec<Binding> {
    let key = format!("{}#{group}", fingerprint.name);
    vec![
        Binding::new(exchange.clone(), unique_queue(fingerprint), key.clone()),
        Binding::new(exchange.clone(), shared_queue(key.clone()), format!("{key}/rr")),
    ]
}

/// A component addressed through the application conventions.
///
/// Besides the wrapped component's handlers it answers the `ping` RPC
/// with its fingerprint and the `join_group` / `leave_group` commands.
/// Handlers of the wrapped component registered under the same keys
/// take precedence for RPCs.
pub struct Application<C> {
    pub inner: C,
    fingerprint: Fingerprint,
    exchange: ExchangeDescriptor,
    groups: Vec<String>,
    pending: Vec<BindingChange>,
}

impl<C: Component> Application<C> {
    pub fn new(inner: C, fingerprint: Fingerprint) -> Self {
        Self {
            inner,
            fingerprint,
            exchange: application_exchange(),
            groups: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn with_exchange(mut self, exchange: ExchangeDescriptor) -> Self {
        self.exchange = exchange;
        self
    }

    /// Groups joined at startup.
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for group in groups {
            let group = group.into();
            if !self.groups.contains(&group) {
                self.groups.push(group);
            }
        }
        self
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Standard bindings plus those of the startup groups.
    pub fn bindings(&self) -> Vec<Binding> {
        let mut bindings = standard_bindings(&self.exchange, &self.fingerprint);
        for group in &self.groups {
            bindings.extend(group_bindings(&self.exchange, &self.fingerprint, group));
        }
        bindings
    }

    /// Join a group at runtime. Only the fanout binding is added: the
    /// round robin queue of a group is shared and stays as declared at
    /// startup. Returns false when already a member.
    pub fn join_group(&mut self, group: &str) -> bool {
        if self.groups.iter().any(|g| g == group) {
            return false;
        }
        info!(name = %self.fingerprint.name, group, "joining group");
        self.groups.push(group.to_owned());
        let key = format!("{}#{group}", self.fingerprint.name);
        self.pending.push(BindingChange::Bind(Binding::new(
            self.exchange.clone(),
            unique_queue(&self.fingerprint),
            key,
        )));
        true
    }

    /// Leave a group, removing its fanout binding. Returns false when not
    /// a member.
    pub fn leave_group(&mut self, group: &str) -> bool {
        let Some(position) = self.groups.iter().position(|g| g == group) else {
            return false;
        };
        info!(name = %self.fingerprint.name, group, "leaving group");
        self.groups.remove(position);
        self.pending.push(BindingChange::Unbind {
            exchange: self.exchange.name.clone(),
            queue: unique_queue(&self.fingerprint).name,
            routing_key: format!("{}#{group}", self.fingerprint.name),
        });
        true
    }

    /// Bind a consumer on `channel` and wrap everything in a processor
    /// named after the application.
    pub fn into_processor(
        self,
        channel: Box<dyn Channel>,
        codec: Arc<dyn Codec>,
        config: &ConsumerConfig,
    ) -> Result<MessageProcessor<Self>, CourierError> {
        let mut consumer = Consumer::new(channel, codec, &self.fingerprint);
        consumer.add_bindings(&self.bindings())?;
        let name = self.fingerprint.name.clone();
        Ok(MessageProcessor::new(name, self, consumer, config))
    }
}

fn group_name(content: &JsonValue) -> Result<String, HandlerError> {
    content["parameters"]["group_name"]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| HandlerError::failed("KeyError", "parameters.group_name is required"))
}

impl<C: Component> Component for Application<C> {
    fn register_handlers(registry: &mut RegistryBuilder<Self>) {
        let mut own = RegistryBuilder::<Self>::new();
        own.rpc("command", "ping", |app: &mut Self, _, reply: &mut Reply<'_>| {
            let fingerprint = JsonValue::Object(app.fingerprint.as_map());
            reply.send(RpcResult::success(fingerprint, ""))?;
            Ok(Flow::Continue)
        });
        own.message("command", "join_group", |app: &mut Self, content| {
            app.join_group(&group_name(&content)?);
            Ok(Flow::Continue)
        });
        own.message("command", "leave_group", |app: &mut Self, content| {
            app.leave_group(&group_name(&content)?);
            Ok(Flow::Continue)
        });
        registry.inherit(&own.build());
        registry.inherit_from(&HandlerRegistry::<C>::collect(), |app| &mut app.inner);
    }

    fn take_binding_changes(&mut self) -> Vec<BindingChange> {
        let mut changes = std::mem::take(&mut self.pending);
        changes.extend(self.inner.take_binding_changes());
        changes
    }
}
