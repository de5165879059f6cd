//! Shared event bus.
//!
//! Services publish fire-and-forget notifications through a central broker
//! reachable on a well-known socket; subscribers register channel patterns
//! and receive matching messages. Channels are namespaced
//! `<namespace>:<priority>:<event_type>` and payloads carry an optional HMAC
//! integrity signature verified on the consuming side.
//!
//! The bus is advisory: when the broker is down, publishes degrade to a
//! logged no-op and never fail the caller.

mod broker;

pub use broker::EventBroker;

use crate::auth::SecurityManager;
use crate::paths;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// Delivery priority, encoded into the channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line on the bus socket, newline-delimited JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum BusFrame {
    /// Register channel patterns for this connection.
    Subscribe { patterns: Vec<String> },
    /// Fan a message out to matching subscribers.
    Publish {
        channel: String,
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        sig: Option<String>,
    },
}

/// Match a channel against a subscription pattern.
///
/// Patterns are colon-separated like channels; `*` matches exactly one
/// segment, and the single pattern `*` matches everything.
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let mut pat = pattern.split(':');
    let mut chan = channel.split(':');
    loop {
        match (pat.next(), chan.next()) {
            (None, None) => return true,
            (Some(p), Some(c)) => {
                if p != "*" && p != c {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

struct BusInner {
    namespace: String,
    security: Arc<dyn SecurityManager>,
    socket: PathBuf,
}

/// Handle to the shared event bus.
///
/// Cheap to clone. A disabled handle (the default for services that never
/// attach one) turns every publish and subscribe into a debug-logged no-op.
#[derive(Clone)]
pub struct EventBus {
    inner: Option<Arc<BusInner>>,
}

impl EventBus {
    /// A bus handle that drops everything.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Connect to the fleet broker on the well-known socket.
    pub fn connect(namespace: &str, security: Arc<dyn SecurityManager>) -> Self {
        Self::connect_at(paths::events_socket(), namespace, security)
    }

    /// Connect to a broker at an explicit socket path.
    pub fn connect_at(
        socket: PathBuf,
        namespace: &str,
        security: Arc<dyn SecurityManager>,
    ) -> Self {
        Self {
            inner: Some(Arc::new(BusInner {
                namespace: namespace.to_owned(),
                security,
                socket,
            })),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Publish an event. Never blocks the caller on broker trouble: a down
    /// broker degrades to a warning.
    pub async fn publish(&self, event_type: &str, data: Value, priority: Priority) {
        let Some(inner) = &self.inner else {
            debug!(event_type, "event bus disabled, dropping publish");
            return;
        };

        let channel = format!("{}:{}:{}", inner.namespace, priority, event_type);
        let payload = match serde_json::to_vec(&data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(event_type, error = %e, "unserializable event payload");
                return;
            }
        };
        let sig = inner.security.sign_event(&channel, &payload);
        let frame = BusFrame::Publish {
            channel,
            data,
            sig,
        };

        if let Err(e) = send_frame(&inner.socket, &frame).await {
            warn!(event_type, error = %e, "event bus unreachable, dropping publish");
        }
    }

    /// Subscribe to channel patterns; `handler(event_type, payload)` runs for
    /// every verified message. The subscription task reconnects with a fixed
    /// pause if the broker goes away.
    pub async fn subscribe(
        &self,
        patterns: Vec<String>,
        handler: impl Fn(&str, Value) + Send + Sync + 'static,
    ) {
        let Some(inner) = self.inner.clone() else {
            debug!("event bus disabled, ignoring subscribe");
            return;
        };

        tokio::spawn(async move {
            loop {
                match run_subscription(&inner, &patterns, &handler).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(error = %e, "event subscription dropped, reconnecting");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
    }
}

/// One-shot frame send over a fresh connection.
async fn send_frame(socket: &PathBuf, frame: &BusFrame) -> std::io::Result<()> {
    let mut stream = UnixStream::connect(socket).await?;
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    stream.write_all(&line).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Run one subscription connection until it fails or the stream ends.
async fn run_subscription(
    inner: &BusInner,
    patterns: &[String],
    handler: &(impl Fn(&str, Value) + Send + Sync + 'static),
) -> std::io::Result<()> {
    let mut stream = UnixStream::connect(&inner.socket).await?;
    let subscribe = BusFrame::Subscribe {
        patterns: patterns.to_vec(),
    };
    let mut line = serde_json::to_vec(&subscribe)?;
    line.push(b'\n');
    stream.write_all(&line).await?;

    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        let frame: BusFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "skipping malformed bus frame");
                continue;
            }
        };
        let BusFrame::Publish { channel, data, sig } = frame else {
            continue;
        };

        let payload = match serde_json::to_vec(&data) {
            Ok(bytes) => bytes,
            Err(_) => continue,
        };
        if !inner
            .security
            .verify_event(&channel, &payload, sig.as_deref())
        {
            warn!(channel, "discarding event with bad integrity signature");
            continue;
        }

        // namespace:priority:event_type, where event_type keeps any
        // further colons.
        let event_type = channel.splitn(3, ':').nth(2).unwrap_or(&channel);
        handler(event_type, data);
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "broker closed the subscription stream",
    ))
}
