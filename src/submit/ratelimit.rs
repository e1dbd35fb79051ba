//! Per-user/per-IP rate limiting for submit intake. A `dashmap` keyed by a
//! caller-chosen string, with `tokio::sync::Mutex`-protected per-key state so
//! the map lock is released before awaiting, counting requests in a fixed
//! one-minute window rather than gating on a minimum inter-request delay.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

struct WindowState {
    window_start: Instant,
    count: u32,
}

pub struct RateLimiter {
    limit_per_minute: u32,
    keys: DashMap<String, Arc<Mutex<WindowState>>>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            keys: DashMap::new(),
        }
    }

    /// `true` if `key` is still under its per-minute budget (and the call
    /// counts toward it); `false` if the caller should be rejected with a
    /// rate-limit error.
    pub async fn check(&self, key: &str) -> bool {
        if self.limit_per_minute == 0 {
            return true;
        }

        let state = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(WindowState {
                    window_start: Instant::now(),
                    count: 0,
                }))
            })
            .clone();

        let mut state = state.lock().await;
        if state.window_start.elapsed() >= WINDOW {
            state.window_start = Instant::now();
            state.count = 0;
        }

        if state.count >= self.limit_per_minute {
            return false;
        }
        state.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_the_configured_limit() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.check("user:1").await);
        assert!(limiter.check("user:1").await);
        assert!(!limiter.check("user:1").await);
    }

    #[tokio::test]
    async fn tracks_keys_independently() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("user:1").await);
        assert!(limiter.check("user:2").await);
        assert!(!limiter.check("user:1").await);
    }

    #[tokio::test]
    async fn zero_limit_disables_rate_limiting() {
        let limiter = RateLimiter::new(0);
        for _ in 0..10 {
            assert!(limiter.check("user:1").await);
        }
    }
}
