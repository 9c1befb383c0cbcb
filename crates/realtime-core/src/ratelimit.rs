//! Per-session sliding-window rate limiting.
//!
//! No crate in the corpus covers a sliding window well enough to be worth
//! the dependency, so this is hand-rolled the way the teacher hand-rolls
//! `UiLogger`'s ring buffer: a `Mutex<VecDeque<Instant>>` of recent hits,
//! trimmed lazily on each check.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_requests: 60,
            interval: Duration::from_secs(60),
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    hits: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            config,
            hits: Mutex::new(VecDeque::new()),
        }
    }

    /// Records a request attempt and reports whether it is allowed under
    /// the configured window.
    pub fn check(&self) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().expect("rate limiter mutex poisoned");
        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) > self.config.interval {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() as u32 >= self.config.max_requests {
            return false;
        }
        hits.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_configured_max() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 3,
            interval: Duration::from_secs(60),
        });
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(!limiter.check());
    }

    #[test]
    fn window_expiry_frees_capacity() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            interval: Duration::from_millis(20),
        });
        assert!(limiter.check());
        assert!(!limiter.check());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check());
    }
}
