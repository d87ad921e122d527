//! Per-client request throttling.
//!
//! Fixed windows with an escalating penalty: a client that ends a window
//! over its budget gets its next window doubled, up to a cap. Keyed by
//! client IP; the layer is only installed when `RATE_LIMIT_ENABLED=true`,
//! so development traffic is never throttled.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};

use crate::app::errors;

/// Penalty windows stop growing at one hour.
const MAX_PENALTY: Duration = Duration::from_secs(60 * 60);
/// Expired entries are swept once the table grows past this.
const SWEEP_AT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// How long until the client's window resets; zero when allowed.
    pub retry_after: Duration,
}

/// Per-client request budget over a rolling window.
pub trait RateLimiter: Send + Sync {
    fn consume(&self, key: &str, cost: u32) -> RateLimitDecision;
}

struct Entry {
    consumed: u32,
    expires_at: Instant,
    penalty: Duration,
}

/// In-process [`RateLimiter`] over a keyed table.
pub struct InMemoryRateLimiter {
    points: u32,
    window: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryRateLimiter {
    pub fn new(points: u32, window: Duration) -> Self {
        Self {
            points,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn consume_at(&self, key: &str, cost: u32, now: Instant) -> RateLimitDecision {
        let mut entries = self.entries.lock().unwrap();

        if entries.len() > SWEEP_AT {
            // Blocked entries survive the sweep so their penalty still
            // escalates when the client comes back.
            entries.retain(|_, e| e.expires_at > now || e.consumed > self.points);
        }

        match entries.get_mut(key) {
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        consumed: cost,
                        expires_at: now + self.window,
                        penalty: self.window,
                    },
                );
                RateLimitDecision {
                    allowed: cost <= self.points,
                    retry_after: Duration::ZERO,
                }
            }
            Some(entry) if now >= entry.expires_at => {
                if entry.consumed > self.points {
                    // The previous window ended over budget: double the
                    // penalty and keep counting against it.
                    entry.penalty = (entry.penalty * 2).min(MAX_PENALTY);
                    entry.consumed = entry.consumed.saturating_add(cost);
                } else {
                    entry.penalty = self.window;
                    entry.consumed = cost;
                }
                entry.expires_at = now + entry.penalty;

                if entry.consumed <= self.points {
                    RateLimitDecision {
                        allowed: true,
                        retry_after: Duration::ZERO,
                    }
                } else {
                    RateLimitDecision {
                        allowed: false,
                        retry_after: entry.penalty,
                    }
                }
            }
            Some(entry) => {
                // Denied attempts still count, so a window that ends over
                // budget is visible to the escalation check above.
                entry.consumed = entry.consumed.saturating_add(cost);
                if entry.consumed > self.points {
                    RateLimitDecision {
                        allowed: false,
                        retry_after: entry.expires_at.saturating_duration_since(now),
                    }
                } else {
                    RateLimitDecision {
                        allowed: true,
                        retry_after: Duration::ZERO,
                    }
                }
            }
        }
    }
}

impl RateLimiter for InMemoryRateLimiter {
    fn consume(&self, key: &str, cost: u32) -> RateLimitDecision {
        self.consume_at(key, cost, Instant::now())
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<dyn RateLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let decision = limiter.consume(&addr.ip().to_string(), 1);
    if !decision.allowed {
        let seconds = decision.retry_after.as_secs().max(1);
        return errors::json_error(
            StatusCode::TOO_MANY_REQUESTS,
            format!("too many requests; retry in {seconds}s"),
        );
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_budget_then_rejects() {
        let limiter = InMemoryRateLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.consume_at("10.0.0.1", 1, now).allowed);
        }

        let denied = limiter.consume_at("10.0.0.1", 1, now);
        assert!(!denied.allowed);
        assert!(denied.retry_after > Duration::ZERO);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = InMemoryRateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.consume_at("10.0.0.1", 1, now).allowed);
        assert!(!limiter.consume_at("10.0.0.1", 1, now).allowed);
        assert!(limiter.consume_at("10.0.0.2", 1, now).allowed);
    }

    #[test]
    fn budget_resets_after_a_clean_window() {
        let window = Duration::from_secs(60);
        let limiter = InMemoryRateLimiter::new(2, window);
        let start = Instant::now();

        assert!(limiter.consume_at("10.0.0.1", 1, start).allowed);
        assert!(limiter.consume_at("10.0.0.1", 1, start).allowed);

        let later = start + window + Duration::from_secs(1);
        assert!(limiter.consume_at("10.0.0.1", 1, later).allowed);
        assert!(limiter.consume_at("10.0.0.1", 1, later).allowed);
    }

    #[test]
    fn blocked_window_doubles_the_penalty() {
        let window = Duration::from_secs(60);
        let limiter = InMemoryRateLimiter::new(1, window);
        let start = Instant::now();

        assert!(limiter.consume_at("10.0.0.1", 1, start).allowed);
        assert!(!limiter.consume_at("10.0.0.1", 1, start).allowed);

        // Coming back after the blocked window expires starts a doubled one.
        let later = start + window + Duration::from_secs(1);
        let denied = limiter.consume_at("10.0.0.1", 1, later);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, window * 2);
    }

    #[test]
    fn penalty_growth_is_capped() {
        let window = Duration::from_secs(45 * 60);
        let limiter = InMemoryRateLimiter::new(1, window);
        let start = Instant::now();

        assert!(limiter.consume_at("10.0.0.1", 1, start).allowed);
        assert!(!limiter.consume_at("10.0.0.1", 1, start).allowed);

        let later = start + window + Duration::from_secs(1);
        let denied = limiter.consume_at("10.0.0.1", 1, later);
        assert_eq!(denied.retry_after, MAX_PENALTY);
    }
}
