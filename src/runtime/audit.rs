//! Append-only audit trail for request outcomes.
//!
//! Keeps a bounded in-memory window for the `metrics` built-in; every entry
//! is additionally emitted to the tracing sink with full detail, which is the
//! durable record.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{info, warn};

/// How a request left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Malformed,
    Oversized,
    AuthFailure,
    RateLimited,
    ValidationFailure,
    UnknownMethod,
    HandlerError,
    HandlerTimeout,
}

impl AuditOutcome {
    fn is_failure(self) -> bool {
        self != Self::Success
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub source: String,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub latency_ms: f64,
}

/// Bounded audit window.
pub struct AuditTrail {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl AuditTrail {
    /// Default in-memory window size.
    pub const DEFAULT_CAPACITY: usize = 100;

    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest past capacity, and emit it to
    /// the log sink.
    pub fn record(&self, entry: AuditEntry) {
        if entry.outcome.is_failure() {
            warn!(
                method = %entry.method,
                source = %entry.source,
                outcome = ?entry.outcome,
                detail = entry.detail.as_deref().unwrap_or(""),
                latency_ms = entry.latency_ms,
                "request failed"
            );
        } else {
            info!(
                method = %entry.method,
                source = %entry.source,
                latency_ms = entry.latency_ms,
                "request handled"
            );
        }

        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Snapshot of the retained window, oldest first.
    pub fn recent(&self) -> Vec<AuditEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
