use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::errors::{AppError, AppResult};

const PRUNE_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request budget per caller key (usually the client address).
pub struct RateLimiter {
    limit: u32,
    period: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(limit: u32, period: Duration) -> Self {
        Self {
            limit,
            period,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> AppResult<()> {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> AppResult<()> {
        // A poisoned map only holds counters; keep serving with it.
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if windows.len() >= PRUNE_THRESHOLD {
            let period = self.period;
            windows.retain(|_, window| now.duration_since(window.started) < period);
        }

        let window = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= self.period {
            *window = Window {
                started: now,
                count: 0,
            };
        }

        if window.count >= self.limit {
            let elapsed = now.duration_since(window.started);
            let retry_after = self.period.saturating_sub(elapsed);
            warn!(key, retry_after_secs = retry_after.as_secs(), "rate limit exceeded");
            return Err(AppError::RateLimited {
                key: key.to_string(),
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        window.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_enforced_within_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.check_at("10.0.0.1", start).unwrap();
        }
        let err = limiter
            .check_at("10.0.0.1", start + Duration::from_secs(10))
            .unwrap_err();
        match err {
            AppError::RateLimited {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 50),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn keys_have_independent_budgets() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        limiter.check_at("a", now).unwrap();
        limiter.check_at("b", now).unwrap();
        assert!(limiter.check_at("a", now).is_err());
    }

    #[test]
    fn window_resets_after_period() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        limiter.check_at("a", now).unwrap();
        assert!(limiter.check_at("a", now + Duration::from_secs(59)).is_err());
        limiter
            .check_at("a", now + Duration::from_secs(60))
            .unwrap();
    }
}
