//! Error types for the RPC and supervision layers.

use std::time::Duration;
use thiserror::Error;

/// Errors produced while reading or writing wire frames.
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame exceeded the protocol's size bound and was rejected unparsed.
    #[error("frame too large: {actual} bytes exceeds limit of {limit}")]
    FrameTooLarge { actual: usize, limit: usize },

    /// Payload was not valid JSON for the expected envelope.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Underlying socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the connection before a full frame arrived.
    #[error("connection closed before a complete frame was received")]
    Truncated,
}

/// Errors surfaced to callers of `ServiceClient::call`.
#[derive(Debug, Error)]
pub enum ServiceCallError {
    /// Could not reach the target after exhausting the retry budget.
    #[error("unreachable: {target} after {attempts} attempts: {source}")]
    Unreachable {
        target: String,
        attempts: u32,
        #[source]
        source: WireError,
    },

    /// The call did not complete within the caller's deadline.
    #[error("call to {target}.{method} timed out after {timeout:?}")]
    Timeout {
        target: String,
        method: String,
        timeout: Duration,
    },

    /// The remote service returned an error response.
    #[error("remote error from {target}.{method}: {message}")]
    Remote {
        target: String,
        method: String,
        message: String,
    },

    /// The method name failed validation before any bytes were sent.
    #[error("invalid method name: {0:?}")]
    InvalidMethod(String),
}

/// Errors from handler registration.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Method names must match `^[a-zA-Z_][a-zA-Z0-9_]*$`.
    #[error("invalid method name: {0:?}")]
    InvalidName(String),

    /// A handler is already registered under this name.
    ///
    /// Re-registration is rejected rather than silently overwriting, so a
    /// duplicate cannot mask an earlier registration.
    #[error("handler already registered for method {0:?}")]
    Duplicate(String),

    /// Built-in method names cannot be shadowed by user handlers.
    #[error("method {0:?} is built in and cannot be overridden")]
    ReservedName(String),
}

/// Errors from authentication, rate limiting and input validation.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token was presented but the method requires one.
    #[error("missing auth token for method {0:?}")]
    MissingToken(String),

    /// The token failed signature or expiry checks.
    #[error("token rejected: {0}")]
    InvalidToken(String),

    /// The caller exceeded its per-method rate budget.
    #[error("rate limit exceeded for {service}.{method}")]
    RateLimited { service: String, method: String },

    /// Request parameters failed sanity checks.
    #[error("invalid params: {0}")]
    InvalidParams(String),
}

/// Errors from circuit-breaker guarded calls.
#[derive(Debug, Error)]
pub enum BreakerError {
    /// The breaker is open; the underlying operation was not attempted.
    #[error("circuit {name:?} is open, retry in {retry_in:?}")]
    Open { name: String, retry_in: Duration },

    /// The guarded operation exceeded the breaker's call timeout.
    #[error("circuit {name:?} call timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    /// The guarded operation failed; the original error is preserved.
    #[error(transparent)]
    Inner(#[from] anyhow::Error),
}

/// Fatal configuration and lifecycle errors raised by the supervisor.
///
/// These are the only errors in the crate that abort a whole startup
/// sequence instead of being recovered.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A declared service name failed validation.
    #[error("invalid service name: {0:?}")]
    InvalidServiceName(String),

    /// The same service name is declared twice.
    #[error("duplicate service declaration: {0:?}")]
    DuplicateService(String),

    /// A dependency references a service that is not declared.
    #[error("service {service:?} depends on undeclared service {dependency:?}")]
    UnknownDependency { service: String, dependency: String },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    /// A critical service failed to verify as running.
    #[error("critical service {service:?} failed to start: {reason}")]
    CriticalStartupFailure { service: String, reason: String },

    /// The named service is not declared in the fleet configuration.
    #[error("unknown service: {0:?}")]
    UnknownService(String),

    /// Process spawn failed.
    #[error("spawn failed for {service:?}: {reason}")]
    SpawnFailed { service: String, reason: String },

    /// Configuration could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// IO error while managing processes or log files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
