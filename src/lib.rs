//! Local-socket RPC framework for a fleet of cooperating services.
//!
//! The crate provides the pieces a trading-style microservice fleet runs on:
//!
//! - [`runtime`] — the base service runtime: handler registry, authenticated
//!   request loop over a unix socket, outbound client, health monitoring and
//!   an audit trail.
//! - [`auth`] — the pluggable security capability (HMAC tokens, rate
//!   limiting, input validation) applied uniformly to every request.
//! - [`events`] — a broker-based publish/subscribe bus for cross-cutting
//!   notifications.
//! - [`breaker`] — circuit breakers guarding calls to failure-prone
//!   dependencies.
//! - [`supervisor`] — dependency-ordered process lifecycle management for
//!   the whole fleet.
//!
//! Wire envelopes ([`envelope`]) are plain JSON and interoperate with any
//! peer speaking the same shape over a unix stream socket.

pub mod auth;
pub mod breaker;
pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod paths;
pub mod runtime;
pub mod supervisor;
pub mod transport;

pub use envelope::{RequestFrame, ResponseFrame, ServiceIdentity, MAX_FRAME_SIZE};
pub use error::{
    AuthError, BreakerError, RegistryError, ServiceCallError, SupervisorError, WireError,
};
pub use runtime::{ServiceClient, ServiceRuntime};

/// Commonly used items for services built on this crate.
pub mod prelude {
    pub use crate::auth::{HmacSecurity, NoopSecurity, SecurityManager};
    pub use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
    pub use crate::envelope::{RequestFrame, ResponseFrame, ServiceIdentity};
    pub use crate::error::{BreakerError, ServiceCallError};
    pub use crate::events::{EventBus, Priority};
    pub use crate::runtime::{Handler, ServiceClient, ServiceRuntime};
}
