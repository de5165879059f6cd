//! Wire envelopes for the local RPC protocol.
//!
//! Every request is a single UTF-8 JSON object, at most [`MAX_FRAME_SIZE`]
//! bytes, written to a fresh unix-socket connection; the response is a single
//! JSON object on the same connection. The field names here are the wire
//! contract and must not change: unconverted peers interoperate by speaking
//! exactly this shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Maximum size of a single wire frame in bytes.
///
/// Larger payloads are rejected before JSON parsing is attempted.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Identity of a running service process.
///
/// Created once at process start and immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    /// Validated service name (`[A-Za-z0-9_-]+`).
    pub name: String,
    /// Unique per-process instance id.
    pub instance_id: String,
}

impl ServiceIdentity {
    /// Create an identity for `name`, generating a fresh instance id.
    ///
    /// Returns `None` if the name fails validation.
    pub fn new(name: &str) -> Option<Self> {
        if !is_valid_service_name(name) {
            return None;
        }
        Some(Self {
            name: name.to_owned(),
            instance_id: format!("{}-{}", name, Uuid::new_v4()),
        })
    }
}

impl std::fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Check a service name against `[A-Za-z0-9_-]+`.
pub fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Check a method name against `^[a-zA-Z_][a-zA-Z0-9_]*$`.
pub fn is_valid_method_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Request envelope sent by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Target method name.
    pub method: String,

    /// Named parameters for the handler.
    #[serde(default)]
    pub params: Map<String, Value>,

    /// Caller's wall-clock send time, unix seconds.
    pub timestamp: f64,

    /// Name of the calling service.
    pub source_service: String,

    /// Short-lived signed token, present when the fleet runs with security
    /// enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl RequestFrame {
    /// Build a request from `source` to `method` with the given params.
    pub fn new(source: &str, method: &str, params: Map<String, Value>) -> Self {
        Self {
            method: method.to_owned(),
            params,
            timestamp: unix_now(),
            source_service: source.to_owned(),
            auth_token: None,
        }
    }

    /// Attach an auth token.
    pub fn with_token(mut self, token: String) -> Self {
        self.auth_token = Some(token);
        self
    }
}

/// Response envelope returned by the callee.
///
/// Serializes as `{"status": "success", "result": ...}` or
/// `{"status": "error", "error": "..."}`, each with `request_id` and
/// `execution_time` alongside.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseFrame {
    Success {
        result: Value,
        request_id: String,
        execution_time: f64,
    },
    Error {
        error: String,
        request_id: String,
        execution_time: f64,
    },
}

impl ResponseFrame {
    /// Build a success response.
    pub fn success(result: Value, request_id: String, execution_time: f64) -> Self {
        Self::Success {
            result,
            request_id,
            execution_time,
        }
    }

    /// Build an error response.
    pub fn error(message: impl Into<String>, request_id: String, execution_time: f64) -> Self {
        Self::Error {
            error: message.into(),
            request_id,
            execution_time,
        }
    }

    /// Request id of either variant.
    pub fn request_id(&self) -> &str {
        match self {
            Self::Success { request_id, .. } | Self::Error { request_id, .. } => request_id,
        }
    }

    /// True for the success variant.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Generate a fresh request id.
pub fn next_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
