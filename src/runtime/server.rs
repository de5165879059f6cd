//! Request loop for the service runtime.
//!
//! Binds the service's unix socket with owner-only permissions and serves
//! each inbound connection on its own task, so one slow handler never starves
//! health probes arriving on other connections.
//!
//! Per-request pipeline, strictly in order:
//! 1. size-capped read (oversized frames rejected unparsed)
//! 2. JSON parse
//! 3. authentication
//! 4. rate limiting
//! 5. parameter validation
//! 6. handler dispatch (builtins first, then the registry)
//!
//! Every outcome lands in the audit trail; no failure crashes the loop.

use super::health::spawn_monitor;
use super::registry::BuiltinMethod;
use super::{AuditEntry, AuditOutcome, RuntimeShared, ServiceRuntime};
use crate::envelope::{next_request_id, RequestFrame, ResponseFrame};
use crate::error::WireError;
use crate::{paths, transport};
use anyhow::{Context as _, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Cap on how long the server waits for a request frame to arrive.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle for a running server.
///
/// Dropping the handle does not stop the service; call [`ServerHandle::stop`]
/// or send the `shutdown` RPC.
pub struct ServerHandle {
    task: Option<tokio::task::JoinHandle<()>>,
    monitor: Option<tokio::task::JoinHandle<()>>,
    shutdown: Arc<Notify>,
    socket_path: std::path::PathBuf,
}

impl ServerHandle {
    /// Signal shutdown and wait for the accept loop and monitor to finish.
    ///
    /// Idempotent: subsequent calls are no-ops.
    pub async fn stop(&mut self) {
        self.shutdown.notify_waiters();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.await;
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }

    /// Wait until the server stops on its own (e.g. via the `shutdown` RPC).
    pub async fn wait(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.await;
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl ServiceRuntime {
    /// Bind the service socket and serve until shutdown is requested.
    ///
    /// The socket lives at `paths::service_socket(name)` with permissions
    /// restricted to the owning user. Returns once the listener is bound and
    /// accepting; the accept loop runs on a spawned task.
    pub async fn start_server(&self) -> Result<ServerHandle> {
        let shared = Arc::clone(self.shared());
        let name = shared.identity.name.clone();

        paths::ensure_runtime_dir().context("creating runtime directory")?;
        let socket_path = paths::service_socket(&name);
        // A stale socket from a previous run would make bind fail.
        let _ = std::fs::remove_file(&socket_path);

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("binding {}", socket_path.display()))?;
        #[cfg(unix)]
        paths::restrict_to_owner(&socket_path, false)
            .context("restricting socket permissions")?;

        let shutdown = Arc::new(Notify::new());
        let monitor = spawn_monitor(
            Arc::clone(&shared.health),
            Arc::clone(&shutdown),
            {
                let security = Arc::clone(&shared.security);
                move || {
                    let status = security.status();
                    (status.auth_failures, status.rate_limit_violations)
                }
            },
        );

        info!(service = %name, socket = %socket_path.display(), "service listening");

        let accept_shutdown = Arc::clone(&shutdown);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = accept_shutdown.notified() => {
                        debug!(service = %shared.identity.name, "server received shutdown signal");
                        break;
                    }

                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                let shared = Arc::clone(&shared);
                                let shutdown = Arc::clone(&accept_shutdown);
                                tokio::spawn(async move {
                                    handle_connection(shared, stream, shutdown).await;
                                });
                            }
                            Err(e) => {
                                // Accept errors are transient (EMFILE etc.);
                                // log and keep serving.
                                warn!(error = %e, "accept failed");
                            }
                        }
                    }
                }
            }
            info!(service = %shared.identity.name, "service stopped");
        });

        Ok(ServerHandle {
            task: Some(task),
            monitor: Some(monitor),
            shutdown,
            socket_path,
        })
    }
}

/// Serve one connection: read a frame, run the pipeline, write the response.
async fn handle_connection(shared: Arc<RuntimeShared>, stream: UnixStream, shutdown: Arc<Notify>) {
    let (mut reader, mut writer) = stream.into_split();
    let started = Instant::now();
    let request_id = next_request_id();

    let bytes = match tokio::time::timeout(READ_TIMEOUT, transport::read_frame_bytes(&mut reader))
        .await
    {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(WireError::FrameTooLarge { actual, limit })) => {
            audit(
                &shared,
                "<oversized>",
                "<unknown>",
                AuditOutcome::Oversized,
                Some(format!("{actual} > {limit} bytes")),
                started,
            );
            respond_error(&shared, &mut writer, "payload too large", &request_id, started).await;
            return;
        }
        Ok(Err(e)) => {
            debug!(error = %e, "dropping unreadable connection");
            return;
        }
        Err(_) => {
            debug!("request read timed out");
            return;
        }
    };

    let request: RequestFrame = match serde_json::from_slice(&bytes) {
        Ok(request) => request,
        Err(e) => {
            audit(
                &shared,
                "<malformed>",
                "<unknown>",
                AuditOutcome::Malformed,
                Some(e.to_string()),
                started,
            );
            respond_error(&shared, &mut writer, "malformed request", &request_id, started).await;
            return;
        }
    };

    shared.counters.request_count.fetch_add(1, Ordering::Relaxed);
    let method = request.method.clone();
    let source = request.source_service.clone();

    // Authentication before anything touches the handler.
    if let Err(e) = shared
        .security
        .authorize(request.auth_token.as_deref(), &source, &method)
    {
        audit(
            &shared,
            &method,
            &source,
            AuditOutcome::AuthFailure,
            Some(e.to_string()),
            started,
        );
        respond_error(&shared, &mut writer, format!("unauthorized: {e}"), &request_id, started)
            .await;
        return;
    }

    if let Err(e) = shared.security.check_rate(&source, &method) {
        audit(
            &shared,
            &method,
            &source,
            AuditOutcome::RateLimited,
            None,
            started,
        );
        respond_error(&shared, &mut writer, e.to_string(), &request_id, started).await;
        return;
    }

    if let Err(e) = shared.security.validate_params(&method, &request.params) {
        audit(
            &shared,
            &method,
            &source,
            AuditOutcome::ValidationFailure,
            Some(e.to_string()),
            started,
        );
        respond_error(&shared, &mut writer, e.to_string(), &request_id, started).await;
        return;
    }

    // Builtins first; the string-keyed registry only sees user methods.
    let outcome = if let Some(builtin) = BuiltinMethod::parse(&method) {
        dispatch_builtin(&shared, builtin, &shutdown)
    } else {
        dispatch_handler(&shared, &method, request).await
    };

    match outcome {
        Ok(result) => {
            audit(&shared, &method, &source, AuditOutcome::Success, None, started);
            let response = ResponseFrame::success(
                result,
                request_id,
                started.elapsed().as_secs_f64(),
            );
            write_response(&mut writer, &response).await;
        }
        Err((outcome, message)) => {
            shared.counters.error_count.fetch_add(1, Ordering::Relaxed);
            shared.health.record_error(&message);
            audit(&shared, &method, &source, outcome, Some(message.clone()), started);
            let response =
                ResponseFrame::error(message, request_id, started.elapsed().as_secs_f64());
            write_response(&mut writer, &response).await;
        }
    }
}

/// Dispatch a built-in method.
fn dispatch_builtin(
    shared: &Arc<RuntimeShared>,
    builtin: BuiltinMethod,
    shutdown: &Arc<Notify>,
) -> Result<Value, (AuditOutcome, String)> {
    match builtin {
        BuiltinMethod::Health => {
            let record = shared.health.snapshot();
            Ok(json!({
                "service": shared.identity.name,
                "instance_id": shared.identity.instance_id,
                "status": record.status,
                "uptime": record.uptime,
                "memory_usage": record.memory_usage,
                "cpu_usage": record.cpu_usage,
                "handlers": shared.registry.method_names(),
                "request_count": shared.counters.request_count(),
                "error_count": shared.counters.error_count(),
            }))
        }
        BuiltinMethod::Metrics => Ok(json!({
            "request_count": shared.counters.request_count(),
            "error_count": shared.counters.error_count(),
            "error_rate": shared.counters.error_rate(),
            "audit_window": shared.audit.recent().len(),
        })),
        BuiltinMethod::SecurityStatus => serde_json::to_value(shared.security.status())
            .map_err(|e| (AuditOutcome::HandlerError, e.to_string())),
        BuiltinMethod::Shutdown => {
            info!(service = %shared.identity.name, "shutdown requested via RPC");
            shutdown.notify_waiters();
            Ok(json!({"status": "shutting_down"}))
        }
    }
}

/// Dispatch a user handler on the blocking pool with a timeout.
async fn dispatch_handler(
    shared: &Arc<RuntimeShared>,
    method: &str,
    request: RequestFrame,
) -> Result<Value, (AuditOutcome, String)> {
    let Some(handler) = shared.registry.get(method) else {
        return Err((
            AuditOutcome::UnknownMethod,
            format!("unknown method: {method:?}"),
        ));
    };

    let params = request.params;
    let invocation = tokio::task::spawn_blocking(move || handler.invoke(&params));

    match tokio::time::timeout(shared.handler_timeout, invocation).await {
        Ok(Ok(Ok(result))) => Ok(result),
        Ok(Ok(Err(e))) => Err((AuditOutcome::HandlerError, e.to_string())),
        Ok(Err(join_error)) => {
            // A panicking handler must not take the server down with it.
            error!(method, error = %join_error, "handler panicked");
            Err((
                AuditOutcome::HandlerError,
                format!("handler panicked: {join_error}"),
            ))
        }
        Err(_) => Err((
            AuditOutcome::HandlerTimeout,
            format!(
                "handler exceeded {}s timeout",
                shared.handler_timeout.as_secs()
            ),
        )),
    }
}

fn audit(
    shared: &Arc<RuntimeShared>,
    method: &str,
    source: &str,
    outcome: AuditOutcome,
    detail: Option<String>,
    started: Instant,
) {
    shared.audit.record(AuditEntry {
        timestamp: Utc::now(),
        method: method.to_owned(),
        source: source.to_owned(),
        outcome,
        detail,
        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
    });
}

async fn respond_error(
    shared: &Arc<RuntimeShared>,
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    message: impl Into<String>,
    request_id: &str,
    started: Instant,
) {
    shared.counters.error_count.fetch_add(1, Ordering::Relaxed);
    let response = ResponseFrame::error(
        message,
        request_id.to_owned(),
        started.elapsed().as_secs_f64(),
    );
    write_response(writer, &response).await;
}

async fn write_response(writer: &mut tokio::net::unix::OwnedWriteHalf, response: &ResponseFrame) {
    if let Err(e) = transport::write_frame(writer, response).await {
        // The peer may have gone away; nothing to do but log.
        debug!(error = %e, "failed to write response");
    }
}
