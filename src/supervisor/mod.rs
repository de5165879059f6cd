//! Fleet supervisor: dependency-ordered startup, verified health, bounded
//! restarts, reverse-ordered teardown.
//!
//! The supervisor runs as its own process and talks to managed services only
//! through the RPC transport, never shared memory. Process handling and
//! health probing sit behind traits so the orchestration rules are tested
//! without real processes.

mod descriptor;
mod spawner;

pub use descriptor::{topological_order, FleetConfig, ServiceDescriptor};
pub use spawner::{ProcessBackend, StandaloneBackend};

use crate::error::{ServiceCallError, SupervisorError};
use crate::paths;
use crate::runtime::ServiceClient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

/// Health probe attempts during startup verification.
const VERIFY_ATTEMPTS: u32 = 5;
/// First verification backoff; doubles per attempt.
const VERIFY_BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Ceiling on a single verification backoff pause.
const VERIFY_BACKOFF_CAP: Duration = Duration::from_secs(8);
/// Timeout on one health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Timeout on the graceful shutdown RPC.
const SHUTDOWN_RPC_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for process exit after shutdown RPC, and again after
/// SIGTERM, before escalating.
const EXIT_GRACE: Duration = Duration::from_secs(10);
/// Restart-budget cooldown window.
const RESTART_WINDOW: Duration = Duration::from_secs(300);

/// Probes managed services over RPC.
#[async_trait]
pub trait HealthProber: Send + Sync {
    /// Call the service's `health` method.
    async fn probe(&self, service: &str, timeout: Duration) -> Result<Value, ServiceCallError>;

    /// Ask the service to shut down gracefully.
    async fn shutdown(&self, service: &str, timeout: Duration) -> Result<(), ServiceCallError>;
}

/// Production prober: plain RPC calls through a [`ServiceClient`].
pub struct RpcProber {
    client: ServiceClient,
}

impl RpcProber {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProber for RpcProber {
    async fn probe(&self, service: &str, timeout: Duration) -> Result<Value, ServiceCallError> {
        self.client
            .call_with_timeout(service, "health", Map::new(), timeout)
            .await
    }

    async fn shutdown(&self, service: &str, timeout: Duration) -> Result<(), ServiceCallError> {
        self.client
            .call_with_timeout(service, "shutdown", Map::new(), timeout)
            .await
            .map(|_| ())
    }
}

/// Result of one start attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    /// Skipped because the restart budget is exhausted.
    SkippedBudget,
    /// Failed to verify; tolerated because the service is not critical.
    Failed(String),
}

/// Per-service line in the status report.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub name: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub responsive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub restart_count: u32,
}

struct RunningService {
    pid: u32,
}

struct RestartWindow {
    count: u32,
    window_start: Instant,
}

/// On-disk form of a restart window, written beside the pid files so the
/// budget spans supervisor invocations.
#[derive(Serialize, Deserialize)]
struct PersistedRestarts {
    count: u32,
    window_start_unix: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The fleet supervisor.
pub struct Supervisor {
    descriptors: HashMap<String, ServiceDescriptor>,
    /// Startup order; shutdown walks it in reverse.
    order: Vec<String>,
    backend: Arc<dyn ProcessBackend>,
    prober: Arc<dyn HealthProber>,
    running: HashMap<String, RunningService>,
    restarts: HashMap<String, RestartWindow>,
    /// Where pid files and restart-window files live.
    state_dir: PathBuf,
}

impl Supervisor {
    /// Validate the fleet and compute the startup order. Fails before any
    /// process is launched.
    pub fn new(
        fleet: &FleetConfig,
        backend: Arc<dyn ProcessBackend>,
        prober: Arc<dyn HealthProber>,
    ) -> Result<Self, SupervisorError> {
        fleet.validate()?;
        let order = topological_order(&fleet.services)?;
        let descriptors = fleet
            .services
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();
        Ok(Self {
            descriptors,
            order,
            backend,
            prober,
            running: HashMap::new(),
            restarts: HashMap::new(),
            state_dir: paths::runtime_dir(),
        })
    }

    /// Use an explicit directory for supervisor state files.
    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = dir;
        self
    }

    /// Startup order (dependencies first).
    pub fn startup_order(&self) -> &[String] {
        &self.order
    }

    /// Adopt services left running by a previous supervisor invocation.
    ///
    /// Reads declared services' pid files; a pid whose process is still
    /// alive joins the running set, stale files are removed.
    pub fn adopt_running(&mut self) {
        for name in self.order.clone() {
            let pid_file = paths::service_pid_file(&name);
            let Ok(contents) = std::fs::read_to_string(&pid_file) else {
                continue;
            };
            match contents.trim().parse::<u32>() {
                Ok(pid) if self.backend.is_running(pid) => {
                    info!(service = %name, pid, "adopted running service");
                    self.running.insert(name, RunningService { pid });
                }
                _ => {
                    let _ = std::fs::remove_file(&pid_file);
                }
            }
        }
    }

    /// Start the whole fleet in dependency order.
    ///
    /// A critical service that fails verification aborts the sequence and
    /// unwinds everything already started, in reverse order.
    pub async fn start_all(&mut self, force: bool) -> Result<(), SupervisorError> {
        let order = self.order.clone();
        let mut started: Vec<String> = Vec::new();

        for name in order {
            let critical = self
                .descriptors
                .get(&name)
                .map(|d| d.critical)
                .unwrap_or(false);
            match self.start_one(&name, force).await {
                Ok(StartOutcome::Started) => started.push(name),
                Ok(StartOutcome::AlreadyRunning) => {}
                Ok(StartOutcome::SkippedBudget) => {
                    warn!(service = %name, "restart budget exhausted, skipping");
                }
                Ok(StartOutcome::Failed(reason)) => {
                    warn!(service = %name, reason, "non-critical service failed to start, continuing");
                }
                Err(e) => {
                    if critical {
                        error!(service = %name, error = %e, "critical startup failure, unwinding fleet");
                        for unwind in started.iter().rev() {
                            self.stop_one(unwind).await;
                        }
                        return Err(e);
                    }
                    warn!(service = %name, error = %e, "non-critical service failed to start, continuing");
                }
            }
        }
        Ok(())
    }

    /// Start one declared service and verify it is actually serving.
    pub async fn start_one(
        &mut self,
        name: &str,
        force: bool,
    ) -> Result<StartOutcome, SupervisorError> {
        let descriptor = self
            .descriptors
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownService(name.to_owned()))?
            .clone();

        if let Some(running) = self.running.get(name) {
            if self.backend.is_running(running.pid) {
                return Ok(StartOutcome::AlreadyRunning);
            }
            // Dead process still in the running set; detected lazily.
            self.running.remove(name);
        }

        if !force && self.over_budget(&descriptor) {
            return Ok(StartOutcome::SkippedBudget);
        }
        self.note_restart_attempt(name);

        let pid = self.backend.spawn(&descriptor).await?;
        tokio::time::sleep(descriptor.delay()).await;

        match self.verify_running(&descriptor).await {
            Ok(()) => {
                info!(service = %name, pid, "service verified running");
                self.running
                    .insert(name.to_owned(), RunningService { pid });
                Ok(StartOutcome::Started)
            }
            Err(reason) => {
                // Never leave a started-but-unverified process behind.
                let _ = self.backend.kill(pid);
                let _ = std::fs::remove_file(paths::service_pid_file(name));
                if descriptor.critical {
                    Err(SupervisorError::CriticalStartupFailure {
                        service: name.to_owned(),
                        reason,
                    })
                } else {
                    Ok(StartOutcome::Failed(reason))
                }
            }
        }
    }

    /// Poll `health` with bounded exponential backoff until the payload
    /// identifies the service.
    async fn verify_running(&self, descriptor: &ServiceDescriptor) -> Result<(), String> {
        let mut backoff = VERIFY_BACKOFF_BASE;
        let mut last_error = String::from("no probe attempted");

        for attempt in 1..=VERIFY_ATTEMPTS {
            match self.prober.probe(&descriptor.name, PROBE_TIMEOUT).await {
                Ok(payload) => {
                    if payload.get("service").and_then(Value::as_str)
                        == Some(descriptor.name.as_str())
                    {
                        return Ok(());
                    }
                    last_error = format!(
                        "health payload does not identify {:?}: {payload}",
                        descriptor.name
                    );
                }
                Err(e) => last_error = e.to_string(),
            }
            if attempt < VERIFY_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(VERIFY_BACKOFF_CAP);
            }
        }
        Err(format!(
            "not verified after {VERIFY_ATTEMPTS} probes: {last_error}"
        ))
    }

    /// Stop the whole fleet in reverse dependency order.
    pub async fn stop_all(&mut self) {
        let order: Vec<String> = self
            .order
            .iter()
            .rev()
            .filter(|name| self.running.contains_key(*name))
            .cloned()
            .collect();
        for name in order {
            self.stop_one(&name).await;
        }
    }

    /// Stop one service: graceful RPC, then SIGTERM, then SIGKILL.
    ///
    /// The service always leaves the running set, whichever path it took.
    pub async fn stop_one(&mut self, name: &str) {
        let Some(running) = self.running.remove(name) else {
            return;
        };
        let pid = running.pid;

        if self
            .prober
            .shutdown(name, SHUTDOWN_RPC_TIMEOUT)
            .await
            .is_ok()
            && self.await_exit(pid).await
        {
            info!(service = %name, "service shut down gracefully");
        } else if self.backend.terminate(pid).is_ok() && self.await_exit(pid).await {
            info!(service = %name, "service terminated");
        } else {
            warn!(service = %name, pid, "escalating to SIGKILL");
            let _ = self.backend.kill(pid);
        }
        let _ = std::fs::remove_file(paths::service_pid_file(name));
    }

    /// Stop then force-start one service.
    pub async fn restart_one(&mut self, name: &str) -> Result<StartOutcome, SupervisorError> {
        self.stop_one(name).await;
        self.start_one(name, true).await
    }

    /// Wait up to the grace period for the process to exit.
    async fn await_exit(&self, pid: u32) -> bool {
        let deadline = tokio::time::Instant::now() + EXIT_GRACE;
        while tokio::time::Instant::now() < deadline {
            if !self.backend.is_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        !self.backend.is_running(pid)
    }

    /// Per-service status: process liveness (lazy check), RPC
    /// responsiveness, and last-known health payload.
    pub async fn status(&mut self) -> Vec<ServiceReport> {
        let mut reports = Vec::with_capacity(self.order.len());
        for name in self.order.clone() {
            let pid = self.running.get(&name).map(|r| r.pid);
            let alive = pid.map(|p| self.backend.is_running(p)).unwrap_or(false);
            if !alive {
                // Exited processes are discovered here, not via push.
                self.running.remove(&name);
            }

            let (responsive, health, failure) = if alive {
                match self.prober.probe(&name, PROBE_TIMEOUT).await {
                    Ok(payload) => (true, Some(payload), None),
                    Err(e) => (false, None, Some(e.to_string())),
                }
            } else {
                let failure = pid
                    .map(|p| format!("process {p} exited"))
                    .or(Some("not running".to_owned()));
                (false, None, failure)
            };

            self.load_restart_window(&name);
            reports.push(ServiceReport {
                name: name.clone(),
                running: alive,
                pid: if alive { pid } else { None },
                responsive,
                health,
                failure,
                restart_count: self.restarts.get(&name).map(|w| w.count).unwrap_or(0),
            });
        }
        reports
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running
            .get(name)
            .map(|r| self.backend.is_running(r.pid))
            .unwrap_or(false)
    }

    fn restart_file(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{name}.restarts"))
    }

    /// Pull a persisted restart window into memory, dropping expired or
    /// unreadable files.
    fn load_restart_window(&mut self, name: &str) {
        if self.restarts.contains_key(name) {
            return;
        }
        let path = self.restart_file(name);
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return;
        };
        let Ok(persisted) = serde_json::from_str::<PersistedRestarts>(&contents) else {
            let _ = std::fs::remove_file(&path);
            return;
        };
        let elapsed = unix_now().saturating_sub(persisted.window_start_unix);
        if Duration::from_secs(elapsed) >= RESTART_WINDOW {
            let _ = std::fs::remove_file(&path);
            return;
        }
        // Rebuild the monotonic start from the wall-clock age of the window.
        let window_start = Instant::now()
            .checked_sub(Duration::from_secs(elapsed))
            .unwrap_or_else(Instant::now);
        self.restarts.insert(
            name.to_owned(),
            RestartWindow {
                count: persisted.count,
                window_start,
            },
        );
    }

    fn over_budget(&mut self, descriptor: &ServiceDescriptor) -> bool {
        self.load_restart_window(&descriptor.name);
        match self.restarts.get(&descriptor.name) {
            Some(window) if window.window_start.elapsed() < RESTART_WINDOW => {
                window.count >= descriptor.max_restarts
            }
            Some(_) => {
                // Window elapsed; the budget resets.
                self.restarts.remove(&descriptor.name);
                let _ = std::fs::remove_file(self.restart_file(&descriptor.name));
                false
            }
            None => false,
        }
    }

    fn note_restart_attempt(&mut self, name: &str) {
        // Forced starts bypass the budget check, so the persisted window
        // may not be in memory yet.
        self.load_restart_window(name);
        let window = self
            .restarts
            .entry(name.to_owned())
            .or_insert_with(|| RestartWindow {
                count: 0,
                window_start: Instant::now(),
            });
        window.count += 1;
        let persisted = PersistedRestarts {
            count: window.count,
            window_start_unix: unix_now()
                .saturating_sub(window.window_start.elapsed().as_secs()),
        };
        let path = self.restart_file(name);
        if let Ok(bytes) = serde_json::to_vec(&persisted) {
            let _ = std::fs::create_dir_all(&self.state_dir);
            if let Err(e) = std::fs::write(&path, bytes) {
                warn!(service = %name, error = %e, "failed to persist restart window");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WireError;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn descriptor(name: &str, deps: &[&str], critical: bool) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_owned(),
            path: PathBuf::from("/usr/bin/true"),
            args: vec![],
            dependencies: deps.iter().map(|d| (*d).to_owned()).collect(),
            critical,
            startup_delay: 0.0,
            max_restarts: 3,
        }
    }

    fn fleet(services: Vec<ServiceDescriptor>) -> FleetConfig {
        FleetConfig {
            namespace: "trading".into(),
            shared_secret: None,
            services,
        }
    }

    #[derive(Default)]
    struct MockBackend {
        spawned: Mutex<Vec<String>>,
        alive: Mutex<HashSet<u32>>,
        next_pid: AtomicU32,
        killed: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl ProcessBackend for MockBackend {
        async fn spawn(&self, descriptor: &ServiceDescriptor) -> Result<u32, SupervisorError> {
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) + 1000;
            self.spawned.lock().push(descriptor.name.clone());
            self.alive.lock().insert(pid);
            Ok(pid)
        }

        fn is_running(&self, pid: u32) -> bool {
            self.alive.lock().contains(&pid)
        }

        fn terminate(&self, pid: u32) -> Result<(), SupervisorError> {
            self.alive.lock().remove(&pid);
            Ok(())
        }

        fn kill(&self, pid: u32) -> Result<(), SupervisorError> {
            self.alive.lock().remove(&pid);
            self.killed.lock().push(pid);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockProber {
        healthy: Mutex<HashSet<String>>,
        shutdowns: Mutex<Vec<String>>,
    }

    impl MockProber {
        fn mark_healthy(&self, names: &[&str]) {
            let mut healthy = self.healthy.lock();
            for name in names {
                healthy.insert((*name).to_owned());
            }
        }
    }

    #[async_trait]
    impl HealthProber for MockProber {
        async fn probe(&self, service: &str, _timeout: Duration) -> Result<Value, ServiceCallError> {
            if self.healthy.lock().contains(service) {
                Ok(json!({"service": service, "status": "healthy"}))
            } else {
                Err(ServiceCallError::Unreachable {
                    target: service.to_owned(),
                    attempts: 1,
                    source: WireError::Truncated,
                })
            }
        }

        async fn shutdown(&self, service: &str, _timeout: Duration) -> Result<(), ServiceCallError> {
            self.shutdowns.lock().push(service.to_owned());
            // Pretend the service exits; the backend mock is updated by the
            // test where needed.
            Ok(())
        }
    }

    fn supervisor(
        services: Vec<ServiceDescriptor>,
    ) -> (Supervisor, Arc<MockBackend>, Arc<MockProber>, tempfile::TempDir) {
        let state = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::default());
        let prober = Arc::new(MockProber::default());
        let supervisor = Supervisor::new(
            &fleet(services),
            Arc::clone(&backend) as Arc<dyn ProcessBackend>,
            Arc::clone(&prober) as Arc<dyn HealthProber>,
        )
        .unwrap()
        .with_state_dir(state.path().to_path_buf());
        (supervisor, backend, prober, state)
    }

    #[tokio::test(start_paused = true)]
    async fn starts_in_dependency_order() {
        let (mut sup, backend, prober, _state) = supervisor(vec![
            descriptor("scheduler", &["prediction"], false),
            descriptor("prediction", &["market-data"], false),
            descriptor("market-data", &[], false),
        ]);
        prober.mark_healthy(&["market-data", "prediction", "scheduler"]);

        sup.start_all(false).await.unwrap();
        assert_eq!(
            *backend.spawned.lock(),
            vec!["market-data", "prediction", "scheduler"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_fails_before_any_spawn() {
        let backend = Arc::new(MockBackend::default());
        let prober = Arc::new(MockProber::default());
        let result = Supervisor::new(
            &fleet(vec![
                descriptor("a", &["b"], false),
                descriptor("b", &["a"], false),
            ]),
            Arc::clone(&backend) as Arc<dyn ProcessBackend>,
            prober as Arc<dyn HealthProber>,
        );
        assert!(matches!(
            result.err(),
            Some(SupervisorError::DependencyCycle { .. })
        ));
        assert!(backend.spawned.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn critical_failure_aborts_and_unwinds() {
        let (mut sup, backend, prober, _state) = supervisor(vec![
            descriptor("market-data", &[], false),
            descriptor("prediction", &["market-data"], true),
            descriptor("scheduler", &["prediction"], false),
        ]);
        // prediction never answers health.
        prober.mark_healthy(&["market-data", "scheduler"]);

        let err = sup.start_all(false).await.unwrap_err();
        assert!(matches!(err, SupervisorError::CriticalStartupFailure { .. }));

        // scheduler was never spawned, market-data was unwound.
        assert_eq!(*backend.spawned.lock(), vec!["market-data", "prediction"]);
        assert!(!sup.is_running("market-data"));
        assert!(!sup.is_running("prediction"));
        // The unverified prediction process was killed, not left behind.
        assert!(!backend.killed.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn non_critical_failure_continues() {
        let (mut sup, backend, prober, _state) = supervisor(vec![
            descriptor("sentiment", &[], false),
            descriptor("market-data", &[], false),
        ]);
        prober.mark_healthy(&["market-data"]);

        sup.start_all(false).await.unwrap();
        assert_eq!(backend.spawned.lock().len(), 2);
        assert!(sup.is_running("market-data"));
        assert!(!sup.is_running("sentiment"));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_budget_skips_then_force_bypasses() {
        let mut services = vec![descriptor("flappy", &[], false)];
        services[0].max_restarts = 3;
        let (mut sup, backend, _prober, _state) = supervisor(services);
        // Never healthy: every attempt fails verification.

        for _ in 0..3 {
            let outcome = sup.start_one("flappy", false).await.unwrap();
            assert!(matches!(outcome, StartOutcome::Failed(_)));
        }
        // Budget exhausted within the window.
        let outcome = sup.start_one("flappy", false).await.unwrap();
        assert_eq!(outcome, StartOutcome::SkippedBudget);
        assert_eq!(backend.spawned.lock().len(), 3);

        // Forced start bypasses the skip.
        let outcome = sup.start_one("flappy", true).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Failed(_)));
        assert_eq!(backend.spawned.lock().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_budget_survives_a_new_supervisor() {
        let state = tempfile::tempdir().unwrap();
        let mut services = vec![descriptor("flappy", &[], false)];
        services[0].max_restarts = 3;

        let backend = Arc::new(MockBackend::default());
        let mut first = Supervisor::new(
            &fleet(services.clone()),
            Arc::clone(&backend) as Arc<dyn ProcessBackend>,
            Arc::new(MockProber::default()) as Arc<dyn HealthProber>,
        )
        .unwrap()
        .with_state_dir(state.path().to_path_buf());

        // Never healthy: burn the whole budget.
        for _ in 0..3 {
            let outcome = first.start_one("flappy", false).await.unwrap();
            assert!(matches!(outcome, StartOutcome::Failed(_)));
        }
        drop(first);

        // A fresh supervisor over the same state directory still honors the
        // exhausted budget and spawns nothing.
        let backend = Arc::new(MockBackend::default());
        let mut second = Supervisor::new(
            &fleet(services),
            Arc::clone(&backend) as Arc<dyn ProcessBackend>,
            Arc::new(MockProber::default()) as Arc<dyn HealthProber>,
        )
        .unwrap()
        .with_state_dir(state.path().to_path_buf());

        let outcome = second.start_one("flappy", false).await.unwrap();
        assert_eq!(outcome, StartOutcome::SkippedBudget);
        assert!(backend.spawned.lock().is_empty());

        // Forcing still works and bumps the persisted count.
        let outcome = second.start_one("flappy", true).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Failed(_)));
        let reports = second.status().await;
        assert_eq!(reports[0].restart_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_walks_reverse_order() {
        let (mut sup, _backend, prober, _state) = supervisor(vec![
            descriptor("market-data", &[], false),
            descriptor("prediction", &["market-data"], false),
        ]);
        prober.mark_healthy(&["market-data", "prediction"]);
        sup.start_all(false).await.unwrap();

        // Graceful shutdown RPC "works" but the mock process stays alive, so
        // the supervisor escalates to terminate. Drop liveness on terminate.
        sup.stop_all().await;
        assert_eq!(*prober.shutdowns.lock(), vec!["prediction", "market-data"]);
        assert!(!sup.is_running("prediction"));
        assert!(!sup.is_running("market-data"));
    }

    #[tokio::test(start_paused = true)]
    async fn status_detects_dead_process_lazily() {
        let (mut sup, backend, prober, _state) = supervisor(vec![descriptor("market-data", &[], false)]);
        prober.mark_healthy(&["market-data"]);
        sup.start_all(false).await.unwrap();

        // The process dies behind the supervisor's back.
        backend.alive.lock().clear();

        let reports = sup.status().await;
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].running);
        assert!(!reports[0].responsive);
        assert!(reports[0].failure.as_deref().unwrap().contains("exited"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_service_is_an_error() {
        let (mut sup, _backend, _prober, _state) = supervisor(vec![descriptor("a", &[], false)]);
        assert!(matches!(
            sup.start_one("ghost", false).await,
            Err(SupervisorError::UnknownService(_))
        ));
    }
}
