//! Base service runtime.
//!
//! Every service embeds a [`ServiceRuntime`]: it registers method handlers,
//! serves them over a local socket with authentication and rate limiting
//! applied uniformly, calls other services through [`ServiceClient`], and
//! publishes/consumes events on the shared bus.
//!
//! Construction is two-phase: a [`RuntimeBuilder`] accumulates handlers and
//! capabilities, then `build()` freezes the registry so the request path
//! reads it without locks.

mod audit;
mod client;
mod health;
mod registry;
mod server;

pub use audit::{AuditEntry, AuditOutcome, AuditTrail};
pub use client::ServiceClient;
pub use health::{HealthRecord, HealthState, ServiceStatus, MONITOR_INTERVAL};
pub use registry::{BuiltinMethod, Handler, HandlerRegistry};
pub use server::ServerHandle;

use crate::auth::{NoopSecurity, SecurityManager};
use crate::envelope::ServiceIdentity;
use crate::events::EventBus;
use anyhow::anyhow;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Request/error counters for one service process.
#[derive(Debug, Default)]
pub struct Counters {
    pub request_count: AtomicU64,
    pub error_count: AtomicU64,
}

impl Counters {
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Fraction of requests that ended in an error response.
    pub fn error_rate(&self) -> f64 {
        let requests = self.request_count();
        if requests == 0 {
            0.0
        } else {
            self.error_count() as f64 / requests as f64
        }
    }
}

pub(crate) struct RuntimeShared {
    pub(crate) identity: ServiceIdentity,
    pub(crate) registry: HandlerRegistry,
    pub(crate) security: Arc<dyn SecurityManager>,
    pub(crate) counters: Counters,
    pub(crate) health: Arc<HealthState>,
    pub(crate) audit: AuditTrail,
    pub(crate) events: EventBus,
    pub(crate) handler_timeout: Duration,
}

/// Builder for [`ServiceRuntime`].
pub struct RuntimeBuilder {
    identity: ServiceIdentity,
    registry: HandlerRegistry,
    security: Arc<dyn SecurityManager>,
    events: Option<EventBus>,
    handler_timeout: Duration,
}

impl RuntimeBuilder {
    /// Register a handler; duplicate or invalid names fail immediately.
    pub fn handler(
        mut self,
        name: &str,
        handler: impl Handler,
    ) -> anyhow::Result<Self> {
        self.registry.register(name, Arc::new(handler))?;
        Ok(self)
    }

    /// Select the security capability (defaults to [`NoopSecurity`]).
    pub fn security(mut self, security: Arc<dyn SecurityManager>) -> Self {
        self.security = security;
        self
    }

    /// Attach an event bus handle.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Cap on a single handler invocation (default 30 s).
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Freeze the registry and produce the runtime.
    pub fn build(self) -> ServiceRuntime {
        let events = self
            .events
            .unwrap_or_else(EventBus::disabled);
        let health = Arc::new(HealthState::new(&self.identity.name));
        ServiceRuntime {
            shared: Arc::new(RuntimeShared {
                identity: self.identity,
                registry: self.registry,
                security: self.security,
                counters: Counters::default(),
                health,
                audit: AuditTrail::default(),
                events,
                handler_timeout: self.handler_timeout,
            }),
        }
    }
}

/// The RPC server/client each service embeds.
#[derive(Clone)]
pub struct ServiceRuntime {
    shared: Arc<RuntimeShared>,
}

impl ServiceRuntime {
    /// Start building a runtime for the named service.
    pub fn builder(name: &str) -> anyhow::Result<RuntimeBuilder> {
        let identity = ServiceIdentity::new(name)
            .ok_or_else(|| anyhow!("invalid service name: {name:?}"))?;
        Ok(RuntimeBuilder {
            identity,
            registry: HandlerRegistry::new(),
            security: Arc::new(NoopSecurity::new()),
            events: None,
            handler_timeout: Duration::from_secs(30),
        })
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.shared.identity
    }

    /// Client for outbound calls, carrying this service's identity and
    /// token-issuing capability.
    pub fn client(&self) -> ServiceClient {
        ServiceClient::new(
            &self.shared.identity.name,
            Arc::clone(&self.shared.security),
        )
    }

    /// Current health snapshot (same payload as the `health` built-in).
    pub fn health_snapshot(&self) -> HealthRecord {
        self.shared.health.snapshot()
    }

    /// Recent audit entries (bounded window).
    pub fn audit_recent(&self) -> Vec<AuditEntry> {
        self.shared.audit.recent()
    }

    /// Publish an event on the shared bus; never blocks, never fails the
    /// caller even when the bus is down.
    pub async fn publish_event(
        &self,
        event_type: &str,
        data: Value,
        priority: crate::events::Priority,
    ) {
        self.shared.events.publish(event_type, data, priority).await;
    }

    /// Subscribe to event patterns; `handler(event_type, payload)` runs once
    /// per verified message.
    pub async fn subscribe_to_events(
        &self,
        patterns: Vec<String>,
        handler: impl Fn(&str, Value) + Send + Sync + 'static,
    ) {
        self.shared.events.subscribe(patterns, handler).await;
    }

    pub(crate) fn shared(&self) -> &Arc<RuntimeShared> {
        &self.shared
    }
}

impl RuntimeShared {
    /// Invoke a registered handler directly, bypassing the transport.
    ///
    /// Used by tests to assert transport transparency.
    pub(crate) fn invoke_direct(
        &self,
        method: &str,
        params: &Map<String, Value>,
    ) -> Option<anyhow::Result<Value>> {
        self.registry.get(method).map(|h| h.invoke(params))
    }
}
