//! HMAC-SHA256 backed security manager.
//!
//! Tokens are short-lived MACs over `source|method|expiry`, verified in
//! constant time. The same key signs event-bus payloads so subscribers can
//! drop tampered messages without a key exchange.

use super::{RateLimitConfig, RateLimiter, SecurityCounters, SecurityManager, SecurityStatus};
use crate::error::AuthError;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Maximum nesting depth accepted for request params.
const MAX_PARAM_DEPTH: usize = 8;
/// Maximum number of top-level params per request.
const MAX_PARAM_COUNT: usize = 64;
/// Maximum length of any string value inside params.
const MAX_STRING_LEN: usize = 16 * 1024;

/// Signs and verifies short-lived call tokens.
///
/// Token format: `<expiry_unix_secs>.<hex hmac>`, where the MAC covers
/// `source|method|expiry`.
pub struct TokenSigner {
    key: Vec<u8>,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(key: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
        }
    }

    fn mac_hex(&self, source: &str, method: &str, expiry: u64) -> String {
        // Key length is unconstrained for HMAC; new_from_slice cannot fail.
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(source.as_bytes());
        mac.update(b"|");
        mac.update(method.as_bytes());
        mac.update(b"|");
        mac.update(expiry.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Issue a token valid for this signer's TTL.
    pub fn issue(&self, source: &str, method: &str) -> String {
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            + self.ttl.as_secs();
        format!("{expiry}.{}", self.mac_hex(source, method, expiry))
    }

    /// Verify a token against the declared source and method.
    pub fn verify(&self, token: &str, source: &str, method: &str) -> Result<(), AuthError> {
        let (expiry_str, mac_hex) = token
            .split_once('.')
            .ok_or_else(|| AuthError::InvalidToken("malformed token".into()))?;
        let expiry: u64 = expiry_str
            .parse()
            .map_err(|_| AuthError::InvalidToken("malformed expiry".into()))?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if expiry < now {
            return Err(AuthError::InvalidToken("token expired".into()));
        }

        let expected = self.mac_hex(source, method, expiry);
        if expected.as_bytes().ct_eq(mac_hex.as_bytes()).into() {
            Ok(())
        } else {
            Err(AuthError::InvalidToken("bad signature".into()))
        }
    }

    fn payload_mac_hex(&self, channel: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(channel.as_bytes());
        mac.update(b"|");
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Full security manager: token auth, rate limiting, param validation and
/// event integrity signing.
pub struct HmacSecurity {
    signer: TokenSigner,
    limiter: RateLimiter,
    counters: SecurityCounters,
}

impl HmacSecurity {
    /// Create with a shared secret and default token TTL (60 s) and limits.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self::with_config(secret, Duration::from_secs(60), RateLimitConfig::default())
    }

    pub fn with_config(
        secret: impl Into<Vec<u8>>,
        token_ttl: Duration,
        rate: RateLimitConfig,
    ) -> Self {
        Self {
            signer: TokenSigner::new(secret, token_ttl),
            limiter: RateLimiter::new(rate),
            counters: SecurityCounters::default(),
        }
    }

    fn check_value(value: &Value, depth: usize) -> Result<(), AuthError> {
        if depth > MAX_PARAM_DEPTH {
            return Err(AuthError::InvalidParams(format!(
                "nesting deeper than {MAX_PARAM_DEPTH} levels"
            )));
        }
        match value {
            Value::String(s) if s.len() > MAX_STRING_LEN => Err(AuthError::InvalidParams(
                format!("string value longer than {MAX_STRING_LEN} bytes"),
            )),
            Value::Array(items) => items
                .iter()
                .try_for_each(|v| Self::check_value(v, depth + 1)),
            Value::Object(map) => map
                .values()
                .try_for_each(|v| Self::check_value(v, depth + 1)),
            _ => Ok(()),
        }
    }
}

impl SecurityManager for HmacSecurity {
    fn issue_token(&self, source: &str, method: &str) -> Option<String> {
        Some(self.signer.issue(source, method))
    }

    fn authorize(
        &self,
        token: Option<&str>,
        source: &str,
        method: &str,
    ) -> Result<(), AuthError> {
        let result = match token {
            None => Err(AuthError::MissingToken(method.to_owned())),
            Some(t) => self.signer.verify(t, source, method),
        };
        if result.is_err() {
            self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn check_rate(&self, source: &str, method: &str) -> Result<(), AuthError> {
        if self.limiter.try_acquire(source, method) {
            Ok(())
        } else {
            self.counters
                .rate_limit_violations
                .fetch_add(1, Ordering::Relaxed);
            Err(AuthError::RateLimited {
                service: source.to_owned(),
                method: method.to_owned(),
            })
        }
    }

    fn validate_params(&self, _method: &str, params: &Map<String, Value>) -> Result<(), AuthError> {
        if params.len() > MAX_PARAM_COUNT {
            return Err(AuthError::InvalidParams(format!(
                "more than {MAX_PARAM_COUNT} parameters"
            )));
        }
        params
            .values()
            .try_for_each(|v| Self::check_value(v, 1))
    }

    fn sign_event(&self, channel: &str, payload: &[u8]) -> Option<String> {
        Some(self.signer.payload_mac_hex(channel, payload))
    }

    fn verify_event(&self, channel: &str, payload: &[u8], signature: Option<&str>) -> bool {
        let Some(sig) = signature else {
            return false;
        };
        let expected = self.signer.payload_mac_hex(channel, payload);
        expected.as_bytes().ct_eq(sig.as_bytes()).into()
    }

    fn status(&self) -> SecurityStatus {
        SecurityStatus {
            mode: "hmac",
            auth_enabled: true,
            rate_limiting_enabled: true,
            auth_failures: self.counters.auth_failures(),
            rate_limit_violations: self.counters.rate_limit_violations(),
        }
    }
}
