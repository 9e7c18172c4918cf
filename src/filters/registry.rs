//! Filter registry for creating filters by name.

use crate::core::error::{BoxError, ChunkError, ChunkResult};
use crate::core::types::Element;
use crate::filters::SliceFilter;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Factory creating a filter from its JSON parameters.
pub type FilterFactory<T> =
    Arc<dyn Fn(&Value) -> Result<Box<dyn SliceFilter<T>>, BoxError> + Send + Sync>;

fn empty_params() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A filter as written in a pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Registered filter name.
    pub name: String,
    /// Filter parameters.
    #[serde(default = "empty_params")]
    pub params: Value,
}

impl FilterSpec {
    /// Create a spec with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: empty_params(),
        }
    }

    /// Set the parameters.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Registry of filter factories for one element type, in registration order.
pub struct FilterRegistry<T: Element> {
    filters: IndexMap<String, FilterFactory<T>>,
}

impl<T: Element> FilterRegistry<T> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            filters: IndexMap::new(),
        }
    }

    /// Create a registry pre-populated with built-in filters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::filters::builtin::register_all(&mut registry);
        registry
    }

    /// Register a filter factory under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn SliceFilter<T>>, BoxError> + Send + Sync + 'static,
    {
        self.filters.insert(name.into(), Arc::new(factory));
    }

    /// Create the filter described by `spec`.
    pub fn create(&self, spec: &FilterSpec) -> ChunkResult<Box<dyn SliceFilter<T>>> {
        let factory = self
            .filters
            .get(&spec.name)
            .ok_or_else(|| ChunkError::Config(format!("unknown filter '{}'", spec.name)))?;
        factory(&spec.params)
            .map_err(|e| ChunkError::Config(format!("filter '{}': {}", spec.name, e)))
    }

    /// Create every filter in `specs`, in order.
    pub fn create_all(&self, specs: &[FilterSpec]) -> ChunkResult<Vec<Box<dyn SliceFilter<T>>>> {
        specs.iter().map(|spec| self.create(spec)).collect()
    }

    /// Check if a filter is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    /// Registered names in registration order.
    pub fn filter_names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(|s| s.as_str())
    }

    /// Unregister a filter.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.filters.shift_remove(name).is_some()
    }

    /// Get the total number of registered filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl<T: Element> Default for FilterRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
