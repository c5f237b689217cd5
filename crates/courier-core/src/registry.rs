//! ---
//! courier_section: "03-dispatch-rpc"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Handler registry keyed by category, type and name."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Handlers are registered on a [`RegistryBuilder`] when a component type
//! is first wired up and frozen into a [`HandlerRegistry`] before any
//! message is dispatched. A component that extends another one inherits
//! the parent's handlers through [`RegistryBuilder::inherit_from`]: the
//! parent's entries come first under each key, then the child's own.
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use courier_msg::{Category, Envelope, MessagingError};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::consumer::BindingChange;
use crate::dispatch::Flow;
use crate::error::HandlerError;
use crate::filter::{Filter, FilterChain};
use crate::rpc::Reply;

type SharedRegistry = Arc<dyn Any + Send + Sync>;

static SHARED_REGISTRIES: Lazy<Mutex<HashMap<TypeId, SharedRegistry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Signature of a message handler.
pub type MessageFn<C> = dyn Fn(&mut C, JsonValue) -> Result<Flow, HandlerError> + Send + Sync;
/// Signature of an RPC handler.
pub type RpcFn<C> =
    dyn Fn(&mut C, JsonValue, &mut Reply<'_>) -> Result<Flow, HandlerError> + Send + Sync;

/// Dispatch key: category, envelope type and envelope name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerKey {
    pub category: Category,
    pub kind: String,
    pub name: String,
}

impl HandlerKey {
    pub fn new(category: Category, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category,
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn message(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(Category::Message, kind, name)
    }

    pub fn rpc(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(Category::Rpc, kind, name)
    }
}

impl From<&Envelope> for HandlerKey {
    fn from(envelope: &Envelope) -> Self {
        let (category, kind, name) = envelope.key();
        Self::new(category, kind, name)
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.category, self.kind, self.name)
    }
}

/// Part of the envelope handed to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySelector {
    /// The `content` mapping.
    Content,
    /// The whole envelope.
    Whole,
}

impl BodySelector {
    /// Fresh copy of the selected part; handlers never share it.
    pub fn extract(&self, envelope: &Envelope) -> Result<JsonValue, MessagingError> {
        match self {
            Self::Content => Ok(JsonValue::Object(envelope.content.clone())),
            Self::Whole => envelope.to_value(),
        }
    }
}

/// Callable half of an entry.
pub enum Handler<C> {
    Message(Arc<MessageFn<C>>),
    Rpc(Arc<RpcFn<C>>),
}

impl<C> Clone for Handler<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Message(f) => Self::Message(Arc::clone(f)),
            Self::Rpc(f) => Self::Rpc(Arc::clone(f)),
        }
    }
}

/// One registered handler together with its body selector and filters.
pub struct HandlerEntry<C> {
    pub label: String,
    pub handler: Handler<C>,
    pub selector: BodySelector,
    pub filters: FilterChain,
    builtin: bool,
}

impl<C> Clone for HandlerEntry<C> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            handler: self.handler.clone(),
            selector: self.selector,
            filters: self.filters.clone(),
            builtin: self.builtin,
        }
    }
}

impl<C> fmt::Debug for HandlerEntry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("label", &self.label)
            .field("selector", &self.selector)
            .field("filters", &self.filters)
            .finish()
    }
}

/// Returned by the registration methods to attach filters or a label.
pub struct Registration<'a, C> {
    entry: &'a mut HandlerEntry<C>,
}

impl<C> Registration<'_, C> {
    /// Append a filter; filters run in the order they are attached.
    pub fn filter(self, filter: Filter) -> Self {
        self.entry.filters.push(filter);
        self
    }

    /// Name used in logs instead of the dispatch key.
    pub fn label(self, label: impl Into<String>) -> Self {
        self.entry.label = label.into();
        self
    }
}

/// A component type that declares its handlers.
pub trait Component: Sized + 'static {
    fn register_handlers(registry: &mut RegistryBuilder<Self>);

    /// Binding changes requested by handlers, applied by the processor once
    /// the current dispatch is over.
    fn take_binding_changes(&mut self) -> Vec<BindingChange> {
        Vec::new()
    }
}

/// Mutable registration phase of a [`HandlerRegistry`].
pub struct RegistryBuilder<C> {
    inherited: Vec<(HandlerKey, HandlerEntry<C>)>,
    own: Vec<(HandlerKey, HandlerEntry<C>)>,
}

impl<C: 'static> Default for RegistryBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> RegistryBuilder<C> {
    /// Builder without any handler.
    pub fn new() -> Self {
        Self {
            inherited: Vec::new(),
            own: Vec::new(),
        }
    }

    /// Builder seeded with the `quit` and `restart` commands every
    /// component answers to.
    pub fn with_builtins() -> Self {
        let mut builder = Self::new();
        builder.push_builtin(
            HandlerKey::message("command", "quit"),
            Arc::new(|_: &mut C, _: JsonValue| Ok(Flow::Terminate)),
        );
        builder.push_builtin(
            HandlerKey::message("command", "restart"),
            Arc::new(|_: &mut C, _: JsonValue| Ok(Flow::Restart)),
        );
        builder
    }

    fn push_builtin(&mut self, key: HandlerKey, handler: Arc<MessageFn<C>>) {
        let entry = HandlerEntry {
            label: key.to_string(),
            handler: Handler::Message(handler),
            selector: BodySelector::Content,
            filters: FilterChain::new(),
            builtin: true,
        };
        self.inherited.push((key, entry));
    }

    fn push(&mut self, key: HandlerKey, handler: Handler<C>, selector: BodySelector) -> Registration<'_, C> {
        let entry = HandlerEntry {
            label: key.to_string(),
            handler,
            selector,
            filters: FilterChain::new(),
            builtin: false,
        };
        self.own.push((key, entry));
        let last = self.own.len() - 1;
        Registration {
            entry: &mut self.own[last].1,
        }
    }

    /// Message handler receiving the envelope content.
    pub fn message<F>(&mut self, kind: &str, name: &str, handler: F) -> Registration<'_, C>
    where
        F: Fn(&mut C, JsonValue) -> Result<Flow, HandlerError> + Send + Sync + 'static,
    {
        self.push(
            HandlerKey::message(kind, name),
            Handler::Message(Arc::new(handler)),
            BodySelector::Content,
        )
    }

    /// Message handler receiving the whole envelope.
    pub fn message_full_body<F>(&mut self, kind: &str, name: &str, handler: F) -> Registration<'_, C>
    where
        F: Fn(&mut C, JsonValue) -> Result<Flow, HandlerError> + Send + Sync + 'static,
    {
        self.push(
            HandlerKey::message(kind, name),
            Handler::Message(Arc::new(handler)),
            BodySelector::Whole,
        )
    }

    /// RPC handler receiving the envelope content and a reply handle.
    pub fn rpc<F>(&mut self, kind: &str, name: &str, handler: F) -> Registration<'_, C>
    where
        F: Fn(&mut C, JsonValue, &mut Reply<'_>) -> Result<Flow, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.push(
            HandlerKey::rpc(kind, name),
            Handler::Rpc(Arc::new(handler)),
            BodySelector::Content,
        )
    }

    /// Inherit every non builtin handler of a parent component reachable
    /// through `project`. Inherited entries precede the builder's own
    /// entries under each key, in the order parents are inherited.
    pub fn inherit_from<P: 'static>(
        &mut self,
        parent: &HandlerRegistry<P>,
        project: fn(&mut C) -> &mut P,
    ) -> &mut Self {
        for (key, entry) in parent.ordered() {
            if entry.builtin {
                continue;
            }
            let handler = match &entry.handler {
                Handler::Message(f) => {
                    let f = Arc::clone(f);
                    Handler::Message(Arc::new(move |component: &mut C, body: JsonValue| {
                        f(project(component), body)
                    }) as Arc<MessageFn<C>>)
                }
                Handler::Rpc(f) => {
                    let f = Arc::clone(f);
                    Handler::Rpc(Arc::new(
                        move |component: &mut C, body: JsonValue, reply: &mut Reply<'_>| {
                            f(project(component), body, reply)
                        },
                    ) as Arc<RpcFn<C>>)
                }
            };
            self.inherited.push((
                key.clone(),
                HandlerEntry {
                    label: entry.label.clone(),
                    handler,
                    selector: entry.selector,
                    filters: entry.filters.clone(),
                    builtin: false,
                },
            ));
        }
        self
    }

    /// Inherit the handlers of a registry for the same component type.
    pub fn inherit(&mut self, parent: &HandlerRegistry<C>) -> &mut Self {
        for (key, entry) in parent.ordered() {
            if !entry.builtin {
                self.inherited.push((key.clone(), entry.clone()));
            }
        }
        self
    }

    /// Freeze the registrations.
    pub fn build(self) -> HandlerRegistry<C> {
        let mut entries: HashMap<HandlerKey, Vec<HandlerEntry<C>>> = HashMap::new();
        let mut order = Vec::new();
        for (key, entry) in self.inherited.into_iter().chain(self.own) {
            let slot = entries.entry(key.clone()).or_default();
            if slot.is_empty() {
                order.push(key);
            }
            slot.push(entry);
        }
        HandlerRegistry { entries, order }
    }
}

/// Immutable handler table consulted by the dispatch engine.
pub struct HandlerRegistry<C> {
    entries: HashMap<HandlerKey, Vec<HandlerEntry<C>>>,
    order: Vec<HandlerKey>,
}

impl<C: Component> HandlerRegistry<C> {
    /// Builtins plus everything `C` registers.
    pub fn collect() -> Self {
        let mut builder = RegistryBuilder::with_builtins();
        C::register_handlers(&mut builder);
        builder.build()
    }

    /// Registry of `C`, collected on first use and shared afterwards.
    pub fn shared() -> Arc<Self> {
        let key = TypeId::of::<C>();
        let cached = SHARED_REGISTRIES.lock().get(&key).cloned();
        if let Some(registry) = cached.and_then(|r| r.downcast::<Self>().ok()) {
            return registry;
        }
        // Collected outside the lock: registration may itself collect
        // other component types.
        let collected: SharedRegistry = Arc::new(Self::collect());
        let stored = Arc::clone(SHARED_REGISTRIES.lock().entry(key).or_insert(collected));
        debug!(component = std::any::type_name::<C>(), "handler registry collected");
        stored
            .downcast::<Self>()
            .unwrap_or_else(|_| Arc::new(Self::collect()))
    }
}

impl<C> HandlerRegistry<C> {
    /// Entries registered under `key`, in registration order. Lookup is
    /// exact; there is no wildcard matching.
    pub fn lookup(&self, key: &HandlerKey) -> &[HandlerEntry<C>] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains(&self, key: &HandlerKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys in first registration order.
    pub fn keys(&self) -> impl Iterator<Item = &HandlerKey> {
        self.order.iter()
    }

    /// Number of entries per key, sorted by key.
    pub fn summary(&self) -> BTreeMap<&HandlerKey, usize> {
        self.entries.iter().map(|(key, list)| (key, list.len())).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ordered(&self) -> impl Iterator<Item = (&HandlerKey, &HandlerEntry<C>)> {
        self.order
            .iter()
            .flat_map(move |key| self.lookup(key).iter().map(move |entry| (key, entry)))
    }
}

impl<C> fmt::Debug for HandlerRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.summary()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Base {
        seen: Vec<String>,
    }

    impl Component for Base {
        fn register_handlers(registry: &mut RegistryBuilder<Self>) {
            registry.message("command", "echo", |base: &mut Base, body| {
                base.seen.push(format!("base {body}"));
                Ok(Flow::Continue)
            });
        }
    }

    #[derive(Default)]
    struct Derived {
        base: Base,
    }

    impl Component for Derived {
        fn register_handlers(registry: &mut RegistryBuilder<Self>) {
            registry.inherit_from(&HandlerRegistry::<Base>::collect(), |derived| &mut derived.base);
            registry.message("command", "echo", |derived: &mut Derived, _| {
                derived.base.seen.push("derived".to_owned());
                Ok(Flow::Continue)
            });
        }
    }

    #[test]
    fn builtins_are_always_present() {
        let registry = HandlerRegistry::<Base>::collect();
        assert!(registry.contains(&HandlerKey::message("command", "quit")));
        assert!(registry.contains(&HandlerKey::message("command", "restart")));
        assert_eq!(registry.lookup(&HandlerKey::message("command", "echo")).len(), 1);
    }

    #[test]
    fn inheritance_appends_after_parent_entries() {
        let registry = HandlerRegistry::<Derived>::collect();
        let echo = registry.lookup(&HandlerKey::message("command", "echo"));
        assert_eq!(echo.len(), 2);
        assert_eq!(registry.lookup(&HandlerKey::message("command", "quit")).len(), 1);

        let mut component = Derived::default();
        for entry in echo {
            if let Handler::Message(f) = &entry.handler {
                f(&mut component, json!("hi")).expect("handler");
            }
        }
        assert_eq!(component.base.seen, vec!["base \"hi\"", "derived"]);
    }

    #[test]
    fn shared_registry_is_collected_once_per_type() {
        let first = HandlerRegistry::<Derived>::shared();
        let second = HandlerRegistry::<Derived>::shared();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.lookup(&HandlerKey::message("command", "echo")).len(), 2);
        let base = HandlerRegistry::<Base>::shared();
        assert_eq!(base.lookup(&HandlerKey::message("command", "echo")).len(), 1);
    }

    #[test]
    fn lookup_is_exact() {
        let registry = HandlerRegistry::<Base>::collect();
        assert!(registry.lookup(&HandlerKey::rpc("command", "echo")).is_empty());
        assert!(registry.lookup(&HandlerKey::message("command", "ech")).is_empty());
        assert!(registry.lookup(&HandlerKey::message("status", "echo")).is_empty());
    }

    #[test]
    fn registration_attaches_filters_and_labels() {
        let mut builder = RegistryBuilder::<Base>::new();
        builder
            .message_full_body("status", "online", |_: &mut Base, _| Ok(Flow::Continue))
            .filter(crate::filter::require_keys())
            .label("presence");
        let registry = builder.build();
        let entries = registry.lookup(&HandlerKey::message("status", "online"));
        assert_eq!(entries[0].label, "presence");
        assert_eq!(entries[0].selector, BodySelector::Whole);
        assert_eq!(entries[0].filters.len(), 1);
        assert_eq!(registry.keys().count(), 1);
    }

    #[test]
    fn whole_body_selector_includes_routing_fields() {
        let envelope = Envelope::command("echo", json!("hi"));
        let whole = BodySelector::Whole.extract(&envelope).expect("whole");
        assert_eq!(whole["name"], json!("echo"));
        assert_eq!(
            BodySelector::Content.extract(&envelope).expect("content"),
            json!({"parameters": "hi"})
        );
    }
}
