//! Security capability for the service runtime.
//!
//! Authentication, rate limiting and input validation are modeled as a single
//! capability selected once at service construction: either the permit-all
//! [`NoopSecurity`] or the HMAC-backed [`HmacSecurity`]. The request path
//! always talks to the trait, never to an `Option`.

mod hmac;
mod rate;

pub use self::hmac::{HmacSecurity, TokenSigner};
pub use rate::{RateLimitConfig, RateLimiter};

use crate::error::AuthError;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot returned by the built-in `security_status` method.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityStatus {
    /// Implementation name (`"noop"` or `"hmac"`).
    pub mode: &'static str,
    /// Whether tokens are required on inbound calls.
    pub auth_enabled: bool,
    /// Whether per-caller rate limits are enforced.
    pub rate_limiting_enabled: bool,
    /// Total rejected authentications since process start.
    pub auth_failures: u64,
    /// Total rate-limit violations since process start.
    pub rate_limit_violations: u64,
}

/// Pluggable security manager applied uniformly to every inbound request.
pub trait SecurityManager: Send + Sync + 'static {
    /// Issue a short-lived token for `source` calling `method`.
    ///
    /// Returns `None` when the implementation does not use tokens.
    fn issue_token(&self, source: &str, method: &str) -> Option<String>;

    /// Validate the presented token for the declared method and caller.
    fn authorize(&self, token: Option<&str>, source: &str, method: &str)
        -> Result<(), AuthError>;

    /// Check the per-(service, method) rate budget, consuming one slot.
    fn check_rate(&self, source: &str, method: &str) -> Result<(), AuthError>;

    /// Sanity-check request params before the handler sees them.
    fn validate_params(&self, method: &str, params: &Map<String, Value>) -> Result<(), AuthError>;

    /// Sign an event payload for bus integrity; `None` disables signing.
    fn sign_event(&self, channel: &str, payload: &[u8]) -> Option<String>;

    /// Verify an event integrity signature.
    fn verify_event(&self, channel: &str, payload: &[u8], signature: Option<&str>) -> bool;

    /// Current security counters for `security_status` and health reporting.
    fn status(&self) -> SecurityStatus;
}

/// Shared failure counters, surfaced by both security implementations.
#[derive(Debug, Default)]
pub struct SecurityCounters {
    pub auth_failures: AtomicU64,
    pub rate_limit_violations: AtomicU64,
}

impl SecurityCounters {
    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    pub fn rate_limit_violations(&self) -> u64 {
        self.rate_limit_violations.load(Ordering::Relaxed)
    }
}

/// Permit-all security manager for fleets running without a shared secret.
///
/// Accepts every request, never rate limits, signs nothing. Event signatures
/// are not required for delivery under this mode.
#[derive(Debug, Default)]
pub struct NoopSecurity {
    counters: SecurityCounters,
}

impl NoopSecurity {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecurityManager for NoopSecurity {
    fn issue_token(&self, _source: &str, _method: &str) -> Option<String> {
        None
    }

    fn authorize(
        &self,
        _token: Option<&str>,
        _source: &str,
        _method: &str,
    ) -> Result<(), AuthError> {
        Ok(())
    }

    fn check_rate(&self, _source: &str, _method: &str) -> Result<(), AuthError> {
        Ok(())
    }

    fn validate_params(
        &self,
        _method: &str,
        _params: &Map<String, Value>,
    ) -> Result<(), AuthError> {
        Ok(())
    }

    fn sign_event(&self, _channel: &str, _payload: &[u8]) -> Option<String> {
        None
    }

    fn verify_event(&self, _channel: &str, _payload: &[u8], _signature: Option<&str>) -> bool {
        true
    }

    fn status(&self) -> SecurityStatus {
        SecurityStatus {
            mode: "noop",
            auth_enabled: false,
            rate_limiting_enabled: false,
            auth_failures: self.counters.auth_failures(),
            rate_limit_violations: self.counters.rate_limit_violations(),
        }
    }
}
