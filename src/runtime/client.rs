//! Outbound RPC client.
//!
//! Each call opens a fresh connection to the target's socket, sends one
//! request frame, and reads one response frame. Transient connect/IO failures
//! are retried with exponential backoff inside the caller's deadline;
//! timeouts and remote error responses are surfaced immediately, never
//! retried.

use crate::auth::SecurityManager;
use crate::envelope::{is_valid_method_name, RequestFrame, ResponseFrame};
use crate::error::{ServiceCallError, WireError};
use crate::{paths, transport};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// Attempts made against transient connect/IO failures.
const MAX_ATTEMPTS: u32 = 3;
/// Initial backoff; doubles per attempt, bounded by the remaining deadline.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default per-call timeout when the caller does not specify one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for calling other services over their local sockets.
///
/// Cheap to clone; carries the calling service's name (stamped into every
/// request) and its token-issuing capability.
#[derive(Clone)]
pub struct ServiceClient {
    source: String,
    security: Arc<dyn SecurityManager>,
}

impl ServiceClient {
    pub fn new(source: &str, security: Arc<dyn SecurityManager>) -> Self {
        Self {
            source: source.to_owned(),
            security,
        }
    }

    /// Call `method` on `target` with the default timeout.
    pub async fn call(
        &self,
        target: &str,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Value, ServiceCallError> {
        self.call_with_timeout(target, method, params, DEFAULT_CALL_TIMEOUT)
            .await
    }

    /// Call `method` on `target`, bounding the whole exchange (including any
    /// retries) by `timeout`.
    pub async fn call_with_timeout(
        &self,
        target: &str,
        method: &str,
        params: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, ServiceCallError> {
        if !is_valid_method_name(method) {
            return Err(ServiceCallError::InvalidMethod(method.to_owned()));
        }

        let mut request = RequestFrame::new(&self.source, method, params);
        if let Some(token) = self.security.issue_token(&self.source, method) {
            request = request.with_token(token);
        }

        let deadline = Instant::now() + timeout;
        let mut attempt = 0;
        let mut backoff = BACKOFF_BASE;
        let mut last_error;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ServiceCallError::Timeout {
                    target: target.to_owned(),
                    method: method.to_owned(),
                    timeout,
                });
            }

            match tokio::time::timeout(remaining, self.exchange(target, &request)).await {
                Ok(Ok(response)) => {
                    return match response {
                        ResponseFrame::Success { result, .. } => Ok(result),
                        ResponseFrame::Error { error, .. } => Err(ServiceCallError::Remote {
                            target: target.to_owned(),
                            method: method.to_owned(),
                            message: error,
                        }),
                    };
                }
                Ok(Err(e)) => {
                    debug!(target, method, attempt, error = %e, "call attempt failed");
                    last_error = e;
                }
                Err(_) => {
                    // Deadline elapsed mid-exchange. The request may have
                    // reached the target; retrying could double-execute it.
                    return Err(ServiceCallError::Timeout {
                        target: target.to_owned(),
                        method: method.to_owned(),
                        timeout,
                    });
                }
            }

            if attempt >= MAX_ATTEMPTS {
                warn!(target, method, attempts = attempt, "target unreachable");
                return Err(ServiceCallError::Unreachable {
                    target: target.to_owned(),
                    attempts: attempt,
                    source: last_error,
                });
            }

            let pause = backoff.min(deadline.saturating_duration_since(Instant::now()));
            if pause.is_zero() {
                return Err(ServiceCallError::Timeout {
                    target: target.to_owned(),
                    method: method.to_owned(),
                    timeout,
                });
            }
            tokio::time::sleep(pause).await;
            backoff *= 2;
        }
    }

    /// One connect/send/receive exchange.
    async fn exchange(
        &self,
        target: &str,
        request: &RequestFrame,
    ) -> Result<ResponseFrame, WireError> {
        let socket = paths::service_socket(target);
        let stream = UnixStream::connect(&socket).await?;
        let (mut reader, mut writer) = stream.into_split();
        transport::write_frame(&mut writer, request).await?;
        transport::read_frame(&mut reader).await
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}
