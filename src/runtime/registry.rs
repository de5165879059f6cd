//! Handler registry: validated method names mapped to invokable handlers.
//!
//! Built-in methods are a closed sum type dispatched before the string-keyed
//! map, so the dynamic lookup only exists at the serialization boundary.
//! Registration is append-only during service initialization; the registry is
//! frozen before the listener starts and never needs a lock on the read path.

use crate::envelope::is_valid_method_name;
use crate::error::RegistryError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A registered RPC method handler.
///
/// Handlers run on the blocking pool, may perform blocking work, and report
/// failures through `anyhow::Error`; the server converts those into error
/// responses without ever crashing the request loop.
pub trait Handler: Send + Sync + 'static {
    fn invoke(&self, params: &Map<String, Value>) -> anyhow::Result<Value>;
}

impl<F> Handler for F
where
    F: Fn(&Map<String, Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    fn invoke(&self, params: &Map<String, Value>) -> anyhow::Result<Value> {
        self(params)
    }
}

/// Methods every service exposes automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinMethod {
    Health,
    Metrics,
    SecurityStatus,
    Shutdown,
}

impl BuiltinMethod {
    /// Parse a wire method name into a builtin, if it is one.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "health" => Some(Self::Health),
            "metrics" => Some(Self::Metrics),
            "security_status" => Some(Self::SecurityStatus),
            "shutdown" => Some(Self::Shutdown),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Health => "health",
            Self::Metrics => "metrics",
            Self::SecurityStatus => "security_status",
            Self::Shutdown => "shutdown",
        }
    }
}

/// String-keyed dispatch table, mutated only during initialization.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a validated method name.
    ///
    /// Duplicate names and builtin names are rejected; a second registration
    /// silently replacing the first could mask a wiring bug.
    pub fn register(
        &mut self,
        name: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistryError> {
        if !is_valid_method_name(name) {
            return Err(RegistryError::InvalidName(name.to_owned()));
        }
        if BuiltinMethod::parse(name).is_some() {
            return Err(RegistryError::ReservedName(name.to_owned()));
        }
        if self.handlers.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_owned()));
        }
        self.handlers.insert(name.to_owned(), handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered method names, sorted for stable output.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
