//! Sliding-window rate limiter keyed by (calling service, method).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Maximum calls allowed per window.
    pub max_calls: u32,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Sliding-window limiter over (service, method) pairs.
///
/// Timestamps older than the window are pruned on each check, so memory is
/// bounded by `max_calls` entries per active key.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<(String, String), Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record one call and report whether it fits the budget.
    pub fn try_acquire(&self, service: &str, method: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let stamps = windows
            .entry((service.to_owned(), method.to_owned()))
            .or_default();
        stamps.retain(|t| now.duration_since(*t) < self.config.window);
        if stamps.len() as u32 >= self.config.max_calls {
            return false;
        }
        stamps.push(now);
        true
    }
}
