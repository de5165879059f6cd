//! Process backend: how supervised services are actually launched and
//! signalled.
//!
//! Behind a trait so orchestration logic is testable against a fake without
//! spawning real processes.

use super::descriptor::ServiceDescriptor;
use crate::error::SupervisorError;
use crate::paths;
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use tracing::{debug, info};

/// Launches, probes and signals service processes.
#[async_trait]
pub trait ProcessBackend: Send + Sync {
    /// Spawn the described service, returning its pid.
    async fn spawn(&self, descriptor: &ServiceDescriptor) -> Result<u32, SupervisorError>;

    /// Whether the process is still alive.
    fn is_running(&self, pid: u32) -> bool;

    /// Ask the process group to terminate (SIGTERM).
    fn terminate(&self, pid: u32) -> Result<(), SupervisorError>;

    /// Force-kill the process group (SIGKILL).
    fn kill(&self, pid: u32) -> Result<(), SupervisorError>;
}

/// Real backend: `tokio::process` children in their own process groups, with
/// stdout/stderr captured to per-service log files.
#[derive(Debug, Default)]
pub struct StandaloneBackend;

impl StandaloneBackend {
    pub fn new() -> Self {
        Self
    }

    /// Signal the whole process group; fall back to the single pid for
    /// processes that did not become group leaders.
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), SupervisorError> {
        let group = Pid::from_raw(-(pid as i32));
        if kill(group, signal).is_ok() {
            return Ok(());
        }
        kill(Pid::from_raw(pid as i32), signal).map_err(|e| SupervisorError::SpawnFailed {
            service: format!("pid {pid}"),
            reason: format!("signal {signal} failed: {e}"),
        })
    }
}

#[async_trait]
impl ProcessBackend for StandaloneBackend {
    async fn spawn(&self, descriptor: &ServiceDescriptor) -> Result<u32, SupervisorError> {
        paths::ensure_logs_dir()?;
        let log_path = paths::service_log_file(&descriptor.name);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let log_err = log.try_clone()?;

        let mut command = tokio::process::Command::new(&descriptor.path);
        command
            .args(&descriptor.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        // Own process group: the supervisor's signals never cascade into
        // children by accident, and teardown can signal the whole group.
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|e| SupervisorError::SpawnFailed {
                service: descriptor.name.clone(),
                reason: e.to_string(),
            })?;
        let pid = child.id().ok_or_else(|| SupervisorError::SpawnFailed {
            service: descriptor.name.clone(),
            reason: "child exited before pid could be read".to_owned(),
        })?;

        std::fs::write(paths::service_pid_file(&descriptor.name), pid.to_string())?;
        info!(
            service = %descriptor.name,
            pid,
            command = %descriptor.path.display(),
            "service process spawned"
        );
        Ok(pid)
    }

    fn is_running(&self, pid: u32) -> bool {
        // Signal 0 probes existence without delivering anything.
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    fn terminate(&self, pid: u32) -> Result<(), SupervisorError> {
        debug!(pid, "sending SIGTERM");
        self.signal(pid, Signal::SIGTERM)
    }

    fn kill(&self, pid: u32) -> Result<(), SupervisorError> {
        debug!(pid, "sending SIGKILL");
        self.signal(pid, Signal::SIGKILL)
    }
}
