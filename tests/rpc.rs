//! End-to-end tests of the service runtime over real unix sockets.

use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tradewire::auth::{HmacSecurity, SecurityManager};
use tradewire::envelope::MAX_FRAME_SIZE;
use tradewire::error::ServiceCallError;
use tradewire::paths;
use tradewire::runtime::{ServiceClient, ServiceRuntime};

/// One runtime directory for the whole test binary, installed before any
/// socket path is computed.
fn setup_runtime_dir() {
    static DIR: OnceLock<TempDir> = OnceLock::new();
    DIR.get_or_init(|| {
        let dir = tempfile::tempdir().expect("tempdir");
        std::env::set_var(paths::RUNTIME_DIR_ENV, dir.path());
        dir
    });
}

fn echo_runtime(name: &str, calls: Arc<AtomicUsize>) -> ServiceRuntime {
    ServiceRuntime::builder(name)
        .unwrap()
        .handler("echo", move |params: &Map<String, Value>| -> anyhow::Result<Value> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Object(params.clone()))
        })
        .unwrap()
        .build()
}

#[tokio::test]
async fn rpc_matches_direct_handler_invocation() {
    setup_runtime_dir();
    let calls = Arc::new(AtomicUsize::new(0));
    let runtime = echo_runtime("echo-svc", Arc::clone(&calls));
    let mut server = runtime.start_server().await.unwrap();

    let mut params = Map::new();
    params.insert("symbol".into(), json!("EURUSD"));
    params.insert("interval".into(), json!("1h"));

    let result = runtime
        .client()
        .call("echo-svc", "echo", params.clone())
        .await
        .unwrap();

    // Transport adds nothing: the response is exactly the handler's output.
    assert_eq!(result, Value::Object(params));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    server.stop().await;
}

#[tokio::test]
async fn malformed_json_never_reaches_the_handler() {
    setup_runtime_dir();
    let calls = Arc::new(AtomicUsize::new(0));
    let runtime = echo_runtime("mal-svc", Arc::clone(&calls));
    let mut server = runtime.start_server().await.unwrap();

    let mut stream = UnixStream::connect(paths::service_socket("mal-svc"))
        .await
        .unwrap();
    stream.write_all(b"{not json at all").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response: Value = serde_json::from_slice(&response).unwrap();
    assert_eq!(response["status"], "error");
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    server.stop().await;
}

#[tokio::test]
async fn oversized_payload_rejected_without_parsing() {
    setup_runtime_dir();
    let calls = Arc::new(AtomicUsize::new(0));
    let runtime = echo_runtime("big-svc", Arc::clone(&calls));
    let mut server = runtime.start_server().await.unwrap();

    let mut stream = UnixStream::connect(paths::service_socket("big-svc"))
        .await
        .unwrap();
    let oversized = vec![b'x'; MAX_FRAME_SIZE + 100];
    stream.write_all(&oversized).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response: Value = serde_json::from_slice(&response).unwrap();
    assert_eq!(response["status"], "error");
    assert!(response["error"].as_str().unwrap().contains("too large"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    server.stop().await;
}

#[tokio::test]
async fn failed_auth_increments_counter_once_and_skips_handler() {
    setup_runtime_dir();
    let secret = b"fleet-secret".to_vec();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_handler = Arc::clone(&calls);

    let runtime = ServiceRuntime::builder("secure-svc")
        .unwrap()
        .security(Arc::new(HmacSecurity::new(secret.clone())))
        .handler("echo", move |params: &Map<String, Value>| -> anyhow::Result<Value> {
            calls_in_handler.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Object(params.clone()))
        })
        .unwrap()
        .build();
    let mut server = runtime.start_server().await.unwrap();

    // Wrong secret: its tokens fail verification on the server.
    let intruder = ServiceClient::new(
        "intruder",
        Arc::new(HmacSecurity::new(b"wrong-secret".to_vec())) as Arc<dyn SecurityManager>,
    );
    let err = intruder
        .call("secure-svc", "echo", Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceCallError::Remote { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // A legitimate caller can read the counters.
    let status = runtime
        .client()
        .call("secure-svc", "security_status", Map::new())
        .await
        .unwrap();
    assert_eq!(status["auth_failures"], 1);
    assert_eq!(status["mode"], "hmac");

    server.stop().await;
}

#[tokio::test]
async fn slow_handler_does_not_starve_health() {
    setup_runtime_dir();
    let runtime = ServiceRuntime::builder("slow-svc")
        .unwrap()
        .handler("slow", |_: &Map<String, Value>| -> anyhow::Result<Value> {
            std::thread::sleep(Duration::from_secs(2));
            Ok(json!("done"))
        })
        .unwrap()
        .build();
    let mut server = runtime.start_server().await.unwrap();

    let client = runtime.client();
    let slow_client = client.clone();
    let slow = tokio::spawn(async move {
        slow_client
            .call_with_timeout("slow-svc", "slow", Map::new(), Duration::from_secs(5))
            .await
    });

    // Give the slow call time to occupy its handler.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Health on a separate connection answers promptly anyway.
    let health = client
        .call_with_timeout("slow-svc", "health", Map::new(), Duration::from_millis(800))
        .await
        .unwrap();
    assert_eq!(health["service"], "slow-svc");

    assert_eq!(slow.await.unwrap().unwrap(), json!("done"));
    server.stop().await;
}

#[tokio::test]
async fn health_is_idempotent() {
    setup_runtime_dir();
    let runtime = echo_runtime("idem-svc", Arc::new(AtomicUsize::new(0)));
    let mut server = runtime.start_server().await.unwrap();
    let client = runtime.client();

    let first = client.call("idem-svc", "health", Map::new()).await.unwrap();
    let second = client.call("idem-svc", "health", Map::new()).await.unwrap();

    assert_eq!(first["service"], "idem-svc");
    assert_eq!(first["handlers"], second["handlers"]);
    assert_eq!(first["instance_id"], second["instance_id"]);

    server.stop().await;
}

#[tokio::test]
async fn unknown_method_is_a_remote_error() {
    setup_runtime_dir();
    let runtime = echo_runtime("unk-svc", Arc::new(AtomicUsize::new(0)));
    let mut server = runtime.start_server().await.unwrap();

    let err = runtime
        .client()
        .call("unk-svc", "does_not_exist", Map::new())
        .await
        .unwrap_err();
    match err {
        ServiceCallError::Remote { message, .. } => {
            assert!(message.contains("unknown method"));
        }
        other => panic!("unexpected error: {other}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn shutdown_builtin_stops_the_server() {
    setup_runtime_dir();
    let runtime = echo_runtime("bye-svc", Arc::new(AtomicUsize::new(0)));
    let mut server = runtime.start_server().await.unwrap();
    let client = runtime.client();

    let ack = client.call("bye-svc", "shutdown", Map::new()).await.unwrap();
    assert_eq!(ack["status"], "shutting_down");

    server.wait().await;
    assert!(!server.is_running());

    // Nothing is listening any more.
    let err = client
        .call_with_timeout("bye-svc", "echo", Map::new(), Duration::from_millis(500))
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn rate_limit_rejects_excess_calls() {
    setup_runtime_dir();
    let security = HmacSecurity::with_config(
        b"limited".to_vec(),
        Duration::from_secs(60),
        tradewire::auth::RateLimitConfig {
            max_calls: 3,
            window: Duration::from_secs(60),
        },
    );
    let runtime = ServiceRuntime::builder("limited-svc")
        .unwrap()
        .security(Arc::new(security))
        .handler("echo", |params: &Map<String, Value>| -> anyhow::Result<Value> {
            Ok(Value::Object(params.clone()))
        })
        .unwrap()
        .build();
    let mut server = runtime.start_server().await.unwrap();
    let client = runtime.client();

    for _ in 0..3 {
        client.call("limited-svc", "echo", Map::new()).await.unwrap();
    }
    let err = client
        .call("limited-svc", "echo", Map::new())
        .await
        .unwrap_err();
    match err {
        ServiceCallError::Remote { message, .. } => {
            assert!(message.contains("rate limit"));
        }
        other => panic!("unexpected error: {other}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn timeout_surfaces_within_the_deadline() {
    setup_runtime_dir();
    let runtime = ServiceRuntime::builder("hang-svc")
        .unwrap()
        .handler("hang", |_: &Map<String, Value>| -> anyhow::Result<Value> {
            std::thread::sleep(Duration::from_secs(3));
            Ok(Value::Null)
        })
        .unwrap()
        .build();
    let mut server = runtime.start_server().await.unwrap();

    let started = std::time::Instant::now();
    let err = runtime
        .client()
        .call_with_timeout("hang-svc", "hang", Map::new(), Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceCallError::Timeout { .. }));
    // Small scheduling tolerance over the requested deadline.
    assert!(started.elapsed() < Duration::from_secs(2));

    server.stop().await;
}
