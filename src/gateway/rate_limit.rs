//! Per-client sliding-window request limits.

use axum::http::HeaderMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Sliding window used by gateway rate limiting.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// How often the limiter sweeps stale client entries from its map.
const SWEEP_INTERVAL_SECS: u64 = 300;

#[derive(Debug)]
struct SlidingWindowRateLimiter {
    limit_per_window: u32,
    window: Duration,
    requests: Mutex<(HashMap<String, Vec<Instant>>, Instant)>,
}

impl SlidingWindowRateLimiter {
    fn new(limit_per_window: u32, window: Duration) -> Self {
        Self {
            limit_per_window,
            window,
            requests: Mutex::new((HashMap::new(), Instant::now())),
        }
    }

    fn allow(&self, key: &str) -> bool {
        if self.limit_per_window == 0 {
            return true;
        }

        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or(now);

        let mut guard = self.requests.lock();
        let (requests, last_sweep) = &mut *guard;

        if last_sweep.elapsed() >= Duration::from_secs(SWEEP_INTERVAL_SECS) {
            requests.retain(|_, timestamps| {
                timestamps.retain(|t| *t > cutoff);
                !timestamps.is_empty()
            });
            *last_sweep = now;
        }

        let entry = requests.entry(key.to_owned()).or_default();
        entry.retain(|instant| *instant > cutoff);

        if entry.len() >= self.limit_per_window as usize {
            return false;
        }

        entry.push(now);
        true
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.requests.lock().0.len()
    }
}

/// Limits for the two abuse-prone routes.
#[derive(Debug)]
pub struct GatewayRateLimiter {
    consume: SlidingWindowRateLimiter,
    signup: SlidingWindowRateLimiter,
}

impl GatewayRateLimiter {
    /// A limit of 0 disables that limiter.
    pub fn new(consume_per_minute: u32, signup_per_minute: u32) -> Self {
        let window = Duration::from_secs(RATE_LIMIT_WINDOW_SECS);
        Self {
            consume: SlidingWindowRateLimiter::new(consume_per_minute, window),
            signup: SlidingWindowRateLimiter::new(signup_per_minute, window),
        }
    }

    pub fn allow_consume(&self, key: &str) -> bool {
        self.consume.allow(key)
    }

    pub fn allow_signup(&self, key: &str) -> bool {
        self.signup.allow(key)
    }
}

/// Client identity for rate limiting: first forwarded address, else "unknown".
pub fn client_key_from_headers(headers: &HeaderMap) -> String {
    for header_name in ["X-Forwarded-For", "X-Real-IP"] {
        if let Some(value) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_owned();
            }
        }
    }
    "unknown".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn limiter_blocks_after_limit() {
        let limiter = SlidingWindowRateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        // Other keys are independent.
        assert!(limiter.allow("other"));
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let limiter = GatewayRateLimiter::new(0, 0);
        for _ in 0..1000 {
            assert!(limiter.allow_consume("k"));
            assert!(limiter.allow_signup("k"));
        }
    }

    #[test]
    fn routes_have_separate_budgets() {
        let limiter = GatewayRateLimiter::new(1, 1);
        assert!(limiter.allow_consume("k"));
        assert!(!limiter.allow_consume("k"));
        assert!(limiter.allow_signup("k"));
        assert!(!limiter.allow_signup("k"));
    }

    #[test]
    fn client_key_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_key_from_headers(&headers), "unknown");

        headers.insert("X-Real-IP", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(client_key_from_headers(&headers), "10.0.0.2");

        headers.insert(
            "X-Forwarded-For",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_key_from_headers(&headers), "203.0.113.7");
    }
}
