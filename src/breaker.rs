//! Circuit breaker guarding calls to failure-prone dependencies.
//!
//! One breaker exists per (caller, dependency) pair. All transitions happen
//! inside a single mutex so they are atomic with respect to concurrent
//! callers, and the open→half-open move is lazy: it happens on the next call
//! after the recovery timeout, never on a timer.
//!
//! Breakers never swallow the underlying error. They only decide whether the
//! call is attempted at all.

use crate::envelope::unix_now;
use crate::error::BreakerError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker state as exposed in snapshots and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Tunables for one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip closed → open.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that restore closed.
    pub success_threshold: u32,
    /// Cooldown before an open breaker lets a probe through.
    pub recovery_timeout: Duration,
    /// Timeout applied to each guarded call.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Serializable view of a breaker, also the persistence record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Unix seconds of the most recent failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<f64>,
    /// Unix seconds of the most recent success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_time: Option<f64>,
}

/// Pluggable short-TTL persistence so a restarted process resumes breaker
/// state instead of resetting to closed and re-hammering a bad dependency.
pub trait BreakerStore: Send + Sync + 'static {
    fn load(&self, name: &str) -> Option<BreakerSnapshot>;
    fn save(&self, snapshot: &BreakerSnapshot, ttl: Duration);
}

/// In-process store, shared between breakers of one process.
#[derive(Default)]
pub struct MemoryBreakerStore {
    entries: Mutex<HashMap<String, (BreakerSnapshot, Instant)>>,
}

impl MemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BreakerStore for MemoryBreakerStore {
    fn load(&self, name: &str) -> Option<BreakerSnapshot> {
        let mut entries = self.entries.lock();
        match entries.get(name) {
            Some((snapshot, expiry)) if *expiry > Instant::now() => Some(snapshot.clone()),
            Some(_) => {
                entries.remove(name);
                None
            }
            None => None,
        }
    }

    fn save(&self, snapshot: &BreakerSnapshot, ttl: Duration) {
        self.entries
            .lock()
            .insert(snapshot.name.clone(), (snapshot.clone(), Instant::now() + ttl));
    }
}

/// TTL applied to persisted breaker state.
const PERSIST_TTL: Duration = Duration::from_secs(300);

struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    last_failure_time: Option<f64>,
    last_success_time: Option<f64>,
}

/// Guard around calls to one failure-prone dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    store: Option<Arc<dyn BreakerStore>>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_owned(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
                last_failure_time: None,
                last_success_time: None,
            }),
            store: None,
        }
    }

    pub fn with_defaults(name: &str) -> Self {
        Self::new(name, BreakerConfig::default())
    }

    /// Attach a persistence store, resuming any state it holds for this
    /// breaker name.
    pub fn with_store(mut self, store: Arc<dyn BreakerStore>) -> Self {
        if let Some(saved) = store.load(&self.name) {
            let mut inner = self.inner.lock();
            inner.state = saved.state;
            inner.failures = saved.failure_count;
            inner.successes = saved.success_count;
            inner.last_failure_time = saved.last_failure_time;
            inner.last_success_time = saved.last_success_time;
            // Rebuild the cooldown clock from the persisted wall-clock
            // failure time.
            if saved.state == CircuitState::Open {
                let since_failure = saved
                    .last_failure_time
                    .map(|t| (unix_now() - t).max(0.0))
                    .unwrap_or(0.0);
                inner.opened_at =
                    Instant::now().checked_sub(Duration::from_secs_f64(since_failure));
            }
            info!(breaker = %self.name, state = ?saved.state, "resumed persisted breaker state");
        }
        self.store = Some(store);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `fut` under the breaker's gate and call timeout.
    ///
    /// While open and inside the cooldown, fails fast without touching `fut`.
    /// Otherwise the outcome drives the state machine and the original error
    /// is re-raised unchanged.
    pub async fn call<F, T>(&self, fut: F) -> Result<T, BreakerError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        if let Err(retry_in) = self.can_execute() {
            return Err(BreakerError::Open {
                name: self.name.clone(),
                retry_in,
            });
        }

        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                self.record_failure();
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    timeout: self.config.call_timeout,
                })
            }
        }
    }

    /// Gate check; moves open → half-open lazily once the cooldown elapses.
    fn can_execute(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(self.config.recovery_timeout);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    info!(breaker = %self.name, "entering half-open probe period");
                    self.persist(&inner);
                    Ok(())
                } else {
                    Err(self.config.recovery_timeout - elapsed)
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.last_success_time = Some(unix_now());
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.opened_at = None;
                    info!(breaker = %self.name, "dependency recovered, circuit closed");
                }
            }
            CircuitState::Open => {}
        }
        self.persist(&inner);
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(unix_now());
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        "failure threshold reached, circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.successes = 0;
                warn!(breaker = %self.name, "half-open probe failed, circuit reopened");
            }
            CircuitState::Open => {
                // Extends the cooldown.
                inner.opened_at = Some(Instant::now());
            }
        }
        self.persist(&inner);
    }

    fn persist(&self, inner: &BreakerInner) {
        if let Some(store) = &self.store {
            store.save(&snapshot_of(&self.name, inner), PERSIST_TTL);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        snapshot_of(&self.name, &self.inner.lock())
    }
}

fn snapshot_of(name: &str, inner: &BreakerInner) -> BreakerSnapshot {
    BreakerSnapshot {
        name: name.to_owned(),
        state: inner.state,
        failure_count: inner.failures,
        success_count: inner.successes,
        last_failure_time: inner.last_failure_time,
        last_success_time: inner.last_success_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_millis(50),
            call_timeout: Duration::from_millis(100),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<u32, BreakerError> {
        breaker.call(async { Err::<u32, _>(anyhow!("down")) }).await
    }

    #[tokio::test]
    async fn closed_passes_calls_through() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        let out = breaker.call(async { Ok::<_, anyhow::Error>(7) }).await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        for _ in 0..3 {
            let err = fail(&breaker).await.unwrap_err();
            assert!(matches!(err, BreakerError::Inner(_)));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Next call fails fast; the future must not run.
        let err = breaker
            .call(async { panic!("must not be invoked") })
            .await
            .map(|_: u32| ())
            .unwrap_err();
        assert!(matches!(err, BreakerError::Open { .. }));
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        breaker.call(async { Ok::<_, anyhow::Error>(()) }).await.unwrap();
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        // Only two consecutive failures since the success.
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn recovers_through_half_open() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        // Cooldown elapsed: the next call is attempted as a probe.
        breaker.call(async { Ok::<_, anyhow::Error>(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.call(async { Ok::<_, anyhow::Error>(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn slow_call_counts_as_failure() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        let err = breaker
            .call(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BreakerError::Timeout { .. }));
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn state_survives_restart_via_store() {
        let store: Arc<dyn BreakerStore> = Arc::new(MemoryBreakerStore::new());
        let breaker =
            CircuitBreaker::new("dep", fast_config()).with_store(Arc::clone(&store));
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        drop(breaker);

        // A fresh breaker (simulating a restarted process) resumes open.
        let resumed =
            CircuitBreaker::new("dep", fast_config()).with_store(Arc::clone(&store));
        assert_eq!(resumed.state(), CircuitState::Open);
    }

    #[test]
    fn store_entries_expire() {
        let store = MemoryBreakerStore::new();
        let snapshot = BreakerSnapshot {
            name: "dep".into(),
            state: CircuitState::Open,
            failure_count: 5,
            success_count: 0,
            last_failure_time: Some(unix_now()),
            last_success_time: None,
        };
        store.save(&snapshot, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.load("dep").is_none());
    }
}
