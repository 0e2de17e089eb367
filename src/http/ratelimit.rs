//! Sliding-window per-IP rate limiting.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// How often the opportunistic sweep runs, in checks.
const SWEEP_EVERY: u64 = 100;

/// Outcome of a granted check.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    /// Requests left in the current window, after this one.
    pub remaining: u32,
}

/// Sliding-window rate limiter keyed by remote address.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    state: Mutex<HashMap<IpAddr, Vec<Instant>>>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            state: Mutex::new(HashMap::new()),
            checks: AtomicU64::new(0),
        }
    }

    /// Record a request from `ip`. Grants at most `max_requests` per
    /// window; on exceed, reports how long until the window frees up.
    pub fn check(&self, ip: IpAddr) -> Result<RateDecision> {
        let now = Instant::now();
        let mut state = self.state.lock().expect("rate limiter poisoned");

        // Sweep stale entries across all IPs on ~1% of calls.
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == 0 {
            let window = self.window;
            state.retain(|_, stamps| {
                stamps.retain(|stamp| now.duration_since(*stamp) < window);
                !stamps.is_empty()
            });
        }

        let stamps = state.entry(ip).or_default();
        stamps.retain(|stamp| now.duration_since(*stamp) < self.window);

        if stamps.len() >= self.max_requests as usize {
            let oldest = stamps.first().copied().unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(oldest))
                .as_millis()
                .max(1) as u64;
            return Err(Error::rate_limited(retry_after));
        }

        stamps.push(now);
        Ok(RateDecision {
            remaining: self.max_requests - stamps.len() as u32,
        })
    }

    /// Remaining allowance for `ip` without consuming a request.
    pub fn remaining(&self, ip: IpAddr) -> u32 {
        let now = Instant::now();
        let state = self.state.lock().expect("rate limiter poisoned");
        let used = state
            .get(&ip)
            .map(|stamps| {
                stamps
                    .iter()
                    .filter(|stamp| now.duration_since(**stamp) < self.window)
                    .count()
            })
            .unwrap_or(0);
        self.max_requests.saturating_sub(used as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn test_grants_up_to_max_then_429() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));

        let first = limiter.check(ip(1)).unwrap();
        assert_eq!(first.remaining, 1);
        let second = limiter.check(ip(1)).unwrap();
        assert_eq!(second.remaining, 0);

        let err = limiter.check(ip(1)).unwrap_err();
        match err {
            Error::RateLimited { retry_after_ms } => assert!(retry_after_ms > 0),
            other => panic!("expected RateLimited, got {}", other),
        }
    }

    #[test]
    fn test_ips_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.check(ip(1)).unwrap();
        assert!(limiter.check(ip(1)).is_err());
        assert!(limiter.check(ip(2)).is_ok());
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(1, Duration::from_millis(30));
        limiter.check(ip(1)).unwrap();
        assert!(limiter.check(ip(1)).is_err());

        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.check(ip(1)).is_ok());
    }

    #[test]
    fn test_remaining_is_read_only() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert_eq!(limiter.remaining(ip(1)), 3);
        limiter.check(ip(1)).unwrap();
        assert_eq!(limiter.remaining(ip(1)), 2);
        assert_eq!(limiter.remaining(ip(1)), 2);
    }

    #[test]
    fn test_sweep_clears_stale_ips() {
        let limiter = RateLimiter::new(5, Duration::from_millis(1));
        for last in 1..=10 {
            limiter.check(ip(last)).unwrap();
        }
        std::thread::sleep(Duration::from_millis(5));

        // Drive enough checks to trigger the periodic sweep.
        for _ in 0..SWEEP_EVERY {
            let _ = limiter.check(ip(200));
        }
        let state = limiter.state.lock().unwrap();
        assert!(!state.contains_key(&ip(1)));
    }
}
