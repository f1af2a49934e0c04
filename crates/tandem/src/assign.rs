//! Method-name to handler resolution.
//!
//! An [`Assigner`] maps a method name to a handler. [`MapAssigner`] is the
//! flat table; [`ServiceMap`] composes assigners under dot-separated
//! prefixes, so `"Math.Add"` reaches the `"Math"` sub-assigner with the
//! residual name `"Add"`. Composition nests arbitrarily.

use std::collections::HashMap;
use std::sync::Arc;

use crate::handler::BoxHandler;

/// Resolves method names to handlers and enumerates the names it serves.
pub trait Assigner: Send + Sync {
    /// The handler for `method`, or `None` if this assigner does not serve it.
    fn assign(&self, method: &str) -> Option<BoxHandler>;

    /// Every fully-qualified method name this assigner serves, sorted.
    fn names(&self) -> Vec<String>;
}

impl Assigner for Arc<dyn Assigner> {
    fn assign(&self, method: &str) -> Option<BoxHandler> {
        (**self).assign(method)
    }

    fn names(&self) -> Vec<String> {
        (**self).names()
    }
}

/// A flat mapping from method name to handler.
#[derive(Default)]
pub struct MapAssigner {
    methods: HashMap<String, BoxHandler>,
}

impl MapAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous assignment of the name.
    pub fn assign_method(&mut self, name: impl Into<String>, handler: BoxHandler) {
        self.methods.insert(name.into(), handler);
    }

    /// Builder-style registration.
    pub fn with(mut self, name: impl Into<String>, handler: BoxHandler) -> Self {
        self.assign_method(name, handler);
        self
    }
}

impl Assigner for MapAssigner {
    fn assign(&self, method: &str) -> Option<BoxHandler> {
        self.methods.get(method).cloned()
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

impl FromIterator<(String, BoxHandler)> for MapAssigner {
    fn from_iter<T: IntoIterator<Item = (String, BoxHandler)>>(iter: T) -> Self {
        Self {
            methods: iter.into_iter().collect(),
        }
    }
}

/// Dispatches on the prefix before the first `.` to a sub-assigner.
#[derive(Default)]
pub struct ServiceMap {
    services: HashMap<String, Arc<dyn Assigner>>,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount a sub-assigner under a service prefix.
    pub fn with(mut self, prefix: impl Into<String>, assigner: impl Assigner + 'static) -> Self {
        self.services.insert(prefix.into(), Arc::new(assigner));
        self
    }
}

impl Assigner for ServiceMap {
    fn assign(&self, method: &str) -> Option<BoxHandler> {
        let (prefix, rest) = method.split_once('.')?;
        self.services.get(prefix)?.assign(rest)
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .iter()
            .flat_map(|(prefix, sub)| {
                sub.names()
                    .into_iter()
                    .map(move |name| format!("{prefix}.{name}"))
            })
            .collect();
        names.sort();
        names
    }
}
