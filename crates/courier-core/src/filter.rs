//! ---
//! courier_section: "03-dispatch-rpc"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Per-handler filter chains applied to message bodies."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::error::{FilterError, HandlerError};

/// Signature of a filter function.
pub type FilterFn = dyn Fn(JsonValue, &FilterArgs) -> Result<JsonValue, FilterError> + Send + Sync;

/// Extra arguments fixed when a filter is attached to a handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterArgs {
    pub positional: Vec<JsonValue>,
    pub keyword: Map<String, JsonValue>,
}

impl FilterArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: JsonValue) -> Self {
        self.positional.push(value);
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.keyword.insert(key.into(), value);
        self
    }

    pub fn get(&self, index: usize) -> Option<&JsonValue> {
        self.positional.get(index)
    }

    pub fn keyword(&self, key: &str) -> Option<&JsonValue> {
        self.keyword.get(key)
    }
}

/// Named body transformation that may veto a message.
#[derive(Clone)]
pub struct Filter {
    name: String,
    func: Arc<FilterFn>,
    args: FilterArgs,
}

impl Filter {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(JsonValue, &FilterArgs) -> Result<JsonValue, FilterError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
            args: FilterArgs::default(),
        }
    }

    pub fn with_args(mut self, args: FilterArgs) -> Self {
        self.args = args;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &FilterArgs {
        &self.args
    }

    pub fn apply(&self, body: JsonValue) -> Result<JsonValue, FilterError> {
        (self.func)(body, &self.args)
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}

/// Filters run in attachment order, each feeding the next.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Filter) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(Filter::name)
    }

    /// Run every filter over `body`. The first veto stops the chain.
    pub fn apply(&self, body: JsonValue) -> Result<JsonValue, HandlerError> {
        self.filters.iter().try_fold(body, |body, filter| {
            debug!(
                filter = filter.name(),
                args = ?filter.args.positional,
                kwargs = ?filter.args.keyword,
                "applying filter"
            );
            filter.apply(body).map_err(|source| HandlerError::Filter {
                filter: filter.name.clone(),
                source,
            })
        })
    }
}

/// Veto bodies that are not mappings holding every key in `args.positional`.
pub fn require_keys() -> Filter {
    Filter::new("require_keys", |body: JsonValue, args: &FilterArgs| {
        let Some(map) = body.as_object() else {
            return Err(FilterError::new("body is not a mapping"));
        };
        for key in &args.positional {
            let key = key.as_str().unwrap_or_default();
            if !map.contains_key(key) {
                return Err(FilterError::new(format!("missing key '{key}'")));
            }
        }
        Ok(body)
    })
}

/// Replace the body with the value stored under the keyword `key`.
pub fn select_key() -> Filter {
    Filter::new("select_key", |body: JsonValue, args: &FilterArgs| {
        let key = args
            .keyword("key")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| FilterError::new("select_key needs a 'key' argument"))?;
        body.get(key)
            .cloned()
            .ok_or_else(|| FilterError::new(format!("missing key '{key}'")))
    })
}
