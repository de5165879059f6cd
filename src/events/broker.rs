//! Central fan-out broker for the event bus.
//!
//! One broker runs per fleet, bound to the well-known events socket. Each
//! connection either subscribes (and then receives matching publishes for its
//! lifetime) or publishes frames. Delivery is best-effort: a subscriber that
//! cannot keep up has messages dropped rather than stalling the broker.

use super::{channel_matches, BusFrame};
use crate::paths;
use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Outbound queue depth per subscriber before messages are dropped.
const SUBSCRIBER_QUEUE: usize = 256;

struct Subscriber {
    patterns: Vec<String>,
    tx: mpsc::Sender<String>,
}

type Subscribers = Arc<Mutex<HashMap<u64, Subscriber>>>;

/// The fleet's event broker.
pub struct EventBroker {
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown: Arc<Notify>,
    socket_path: PathBuf,
}

impl EventBroker {
    /// Bind the well-known events socket and start fanning out.
    pub async fn start() -> Result<Self> {
        paths::ensure_runtime_dir().context("creating runtime directory")?;
        Self::start_at(paths::events_socket()).await
    }

    /// Bind an explicit socket path.
    pub async fn start_at(socket_path: PathBuf) -> Result<Self> {
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("binding {}", socket_path.display()))?;
        #[cfg(unix)]
        paths::restrict_to_owner(&socket_path, false)
            .context("restricting broker socket permissions")?;

        let shutdown = Arc::new(Notify::new());
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let next_id = Arc::new(AtomicU64::new(0));

        info!(socket = %socket_path.display(), "event broker listening");

        let accept_shutdown = Arc::clone(&shutdown);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = accept_shutdown.notified() => break,

                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                let subscribers = Arc::clone(&subscribers);
                                let id = next_id.fetch_add(1, Ordering::Relaxed);
                                tokio::spawn(async move {
                                    serve_connection(id, stream, subscribers).await;
                                });
                            }
                            Err(e) => warn!(error = %e, "broker accept failed"),
                        }
                    }
                }
            }
            info!("event broker stopped");
        });

        Ok(Self {
            task: Some(task),
            shutdown,
            socket_path,
        })
    }

    /// Stop accepting and tear the broker down. Idempotent.
    pub async fn stop(&mut self) {
        self.shutdown.notify_waiters();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }
}

/// Serve one bus connection until it closes.
async fn serve_connection(id: u64, stream: UnixStream, subscribers: Subscribers) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut registered = false;

    // Outbound writer task, fed by fan-out. Created lazily on subscribe.
    let (tx, mut rx) = mpsc::channel::<String>(SUBSCRIBER_QUEUE);
    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<BusFrame>(&line) {
            Ok(BusFrame::Subscribe { patterns }) => {
                debug!(id, ?patterns, "subscriber registered");
                subscribers.lock().insert(
                    id,
                    Subscriber {
                        patterns,
                        tx: tx.clone(),
                    },
                );
                registered = true;
            }
            Ok(BusFrame::Publish { ref channel, .. }) => {
                fan_out(channel, &line, &subscribers);
            }
            Err(e) => {
                debug!(id, error = %e, "dropping malformed bus frame");
            }
        }
    }

    if registered {
        subscribers.lock().remove(&id);
        debug!(id, "subscriber disconnected");
    }
    drop(tx);
    let _ = writer_task.await;
}

/// Forward a raw publish line to every matching subscriber.
///
/// `try_send` keeps a slow subscriber from backing up the publisher; its
/// overflowing messages are dropped.
fn fan_out(channel: &str, line: &str, subscribers: &Subscribers) {
    let guard = subscribers.lock();
    for (id, sub) in guard.iter() {
        if sub
            .patterns
            .iter()
            .any(|pattern| channel_matches(pattern, channel))
        {
            if sub.tx.try_send(line.to_owned()).is_err() {
                warn!(subscriber = id, channel, "subscriber queue full, dropping event");
            }
        }
    }
}
