//! Per-service health record and its background refresher.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::sync::Notify;
use tracing::debug;

/// Liveness classification exposed via the `health` built-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Starting,
    Healthy,
    Unhealthy,
}

/// Periodically refreshed snapshot of a service's liveness and resource use.
///
/// Created at service start, discarded at process exit; never persisted
/// across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub service_name: String,
    pub status: ServiceStatus,
    /// Seconds since the service started.
    pub uptime: f64,
    /// Resident memory in bytes.
    pub memory_usage: u64,
    /// Process CPU usage percentage.
    pub cpu_usage: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub auth_failures: u64,
    pub rate_limit_violations: u64,
}

/// Shared mutable health state for one service process.
pub struct HealthState {
    record: RwLock<HealthRecord>,
    started: Instant,
}

impl HealthState {
    pub fn new(service_name: &str) -> Self {
        Self {
            record: RwLock::new(HealthRecord {
                service_name: service_name.to_owned(),
                status: ServiceStatus::Starting,
                uptime: 0.0,
                memory_usage: 0,
                cpu_usage: 0.0,
                last_error: None,
                auth_failures: 0,
                rate_limit_violations: 0,
            }),
            started: Instant::now(),
        }
    }

    /// Current snapshot with uptime recomputed at read time.
    pub fn snapshot(&self) -> HealthRecord {
        let mut record = self.record.read().clone();
        record.uptime = self.started.elapsed().as_secs_f64();
        record
    }

    /// Record the most recent handler error.
    pub fn record_error(&self, message: &str) {
        self.record.write().last_error = Some(message.to_owned());
    }

    /// Refresh resource usage and security counters.
    pub fn refresh(&self, memory_usage: u64, cpu_usage: f32, auth_failures: u64, violations: u64) {
        let mut record = self.record.write();
        record.status = ServiceStatus::Healthy;
        record.memory_usage = memory_usage;
        record.cpu_usage = cpu_usage;
        record.auth_failures = auth_failures;
        record.rate_limit_violations = violations;
    }

    /// Mark the service unhealthy (used when the monitor loses its process
    /// view or the runtime observes repeated failures).
    pub fn mark_unhealthy(&self) {
        self.record.write().status = ServiceStatus::Unhealthy;
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Interval between monitor refreshes.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the background monitor task for this process.
///
/// Samples cpu/memory via sysinfo on every tick and folds in the security
/// counters supplied by the closure. Stops when `shutdown` is notified.
pub fn spawn_monitor(
    health: Arc<HealthState>,
    shutdown: Arc<Notify>,
    security_counters: impl Fn() -> (u64, u64) + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let pid = Pid::from_u32(std::process::id());
        let mut system = System::new();
        let mut interval = tokio::time::interval(MONITOR_INTERVAL);
        // First tick fires immediately so the record leaves `starting` as
        // soon as the service is up.
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    debug!(service = %health.snapshot().service_name, "health monitor stopping");
                    break;
                }
                _ = interval.tick() => {
                    system.refresh_processes_specifics(ProcessRefreshKind::new().with_cpu().with_memory());
                    let (memory, cpu) = system
                        .process(pid)
                        .map(|p| (p.memory(), p.cpu_usage()))
                        .unwrap_or((0, 0.0));
                    let (auth_failures, violations) = security_counters();
                    health.refresh(memory, cpu, auth_failures, violations);
                }
            }
        }
    })
}
