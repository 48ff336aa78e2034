// Fixed-window rate limiting
// Decision: Windows are keyed by principal subject, or by network origin for anonymous callers
// Decision: Uses tokio's Instant so paused-time tests control the clock
// Decision: Past SWEEP_THRESHOLD keys, expired windows are swept at most once per window

use std::collections::HashMap;
use std::time::Duration;

use genrelay_core::GatewayError;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Keys tracked before expired windows are swept
const SWEEP_THRESHOLD: usize = 10_000;

/// Rate limit configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 120,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitWindow {
    window_start: Instant,
    count: u32,
}

#[derive(Debug, Default)]
struct Windows {
    by_key: HashMap<String, RateLimitWindow>,
    last_sweep: Option<Instant>,
}

impl Windows {
    fn sweep_due(&self, now: Instant, window_size: Duration) -> bool {
        self.by_key.len() >= SWEEP_THRESHOLD
            && self
                .last_sweep
                .map_or(true, |at| now.saturating_duration_since(at) >= window_size)
    }
}

/// Per-key fixed-window counter
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(Windows::default()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request for `key`
    pub fn check(&self, key: &str) -> Result<(), GatewayError> {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> Result<(), GatewayError> {
        let window_size = self.config.window;
        let mut windows = self.windows.lock();

        if windows.sweep_due(now, window_size) {
            windows
                .by_key
                .retain(|_, w| now.saturating_duration_since(w.window_start) <= window_size);
            windows.last_sweep = Some(now);
        }

        let window = windows.by_key.entry(key.to_string()).or_insert(RateLimitWindow {
            window_start: now,
            count: 0,
        });

        let elapsed = now.saturating_duration_since(window.window_start);
        if elapsed > window_size {
            window.window_start = now;
            window.count = 0;
        }

        if window.count >= self.config.max_requests {
            let remaining = window_size.saturating_sub(now.saturating_duration_since(window.window_start));
            let retry_after_secs = remaining.as_millis().div_ceil(1000).max(1) as u64;
            return Err(GatewayError::RateLimited { retry_after_secs });
        }

        window.count += 1;
        Ok(())
    }

    /// Number of keys with a live window
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().by_key.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            window: Duration::from_secs(window_secs),
            max_requests: max,
        })
    }

    #[test]
    fn test_limit_plus_one_is_rejected() {
        let limiter = limiter(3, 60);
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_at("svc-a", now).is_ok());
        }
        let err = limiter.check_at("svc-a", now).unwrap_err();
        assert_eq!(err.code(), "rate_limited");
        assert_eq!(err.retry_after(), Some(60));
    }

    #[test]
    fn test_next_window_succeeds() {
        let limiter = limiter(1, 10);
        let start = Instant::now();

        assert!(limiter.check_at("k", start).is_ok());
        assert!(limiter.check_at("k", start + Duration::from_secs(5)).is_err());
        // Window resets once strictly more than the window size has elapsed
        assert!(limiter.check_at("k", start + Duration::from_secs(10)).is_err());
        assert!(limiter
            .check_at("k", start + Duration::from_millis(10_001))
            .is_ok());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1, 60);
        let now = Instant::now();

        assert!(limiter.check_at("a", now).is_ok());
        assert!(limiter.check_at("b", now).is_ok());
        assert!(limiter.check_at("a", now).is_err());
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_retry_after_counts_down() {
        let limiter = limiter(1, 60);
        let start = Instant::now();
        limiter.check_at("k", start).unwrap();

        let err = limiter
            .check_at("k", start + Duration::from_millis(59_500))
            .unwrap_err();
        assert_eq!(err.retry_after(), Some(1));
    }

    #[test]
    fn test_sweep_runs_at_most_once_per_window() {
        let limiter = limiter(1, 60);
        let start = Instant::now();
        for i in 0..SWEEP_THRESHOLD {
            limiter.check_at(&format!("k{i}"), start).unwrap();
        }

        // First sweep finds nothing expired
        let later = start + Duration::from_secs(30);
        limiter.check_at("late", later).unwrap();
        assert_eq!(limiter.tracked_keys(), SWEEP_THRESHOLD + 1);

        // The original windows have expired, but the last sweep is too recent
        let expired = start + Duration::from_secs(61);
        limiter.check_at("expired", expired).unwrap();
        assert_eq!(limiter.tracked_keys(), SWEEP_THRESHOLD + 2);

        limiter
            .check_at("swept", later + Duration::from_secs(60))
            .unwrap();
        assert_eq!(limiter.tracked_keys(), 3);
    }
}
