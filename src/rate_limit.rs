//! Rate limiting for sensitive routes
//!
//! Two layers:
//! - A windowed limiter applied only to routes classed "sensitive" (auth
//!   endpoints). Fixed capacity per window, keyed by client identity. The
//!   per-key window lives in a `DashMap`; the entry API gives an exclusive
//!   per-key lock, so increment-and-check is atomic per key without a
//!   global lock across unrelated clients.
//! - A coarse global per-IP limiter (governor) as a DoS backstop.
//!
//! Stale keys are reclaimed lazily: every `EVICT_STRIDE` checks, one pass
//! drops entries idle past the eviction horizon. No sweep thread.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Run an opportunistic eviction pass once per this many checks.
const EVICT_STRIDE: u64 = 1024;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    /// Denied; the client may retry after this many seconds.
    Deny { retry_after_secs: u64 },
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
    last_seen: Instant,
}

/// Windowed limiter for sensitive routes plus the global per-IP backstop.
pub struct SensitiveRateLimiter {
    windows: DashMap<IpAddr, Window>,
    global: DashMap<IpAddr, Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
    config: RwLock<RateLimitConfig>,
    checks: AtomicU64,
}

impl SensitiveRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            global: DashMap::new(),
            config: RwLock::new(config.clone()),
            checks: AtomicU64::new(0),
        }
    }

    /// Install reloaded limiter parameters. Existing windows keep counting
    /// under the new capacity; global limiters are rebuilt lazily.
    pub fn install(&self, config: &RateLimitConfig) {
        *self.config.write() = config.clone();
        self.global.clear();
    }

    /// Atomic increment-and-check for one sensitive-route request.
    pub fn check_sensitive(&self, key: IpAddr) -> RateDecision {
        let (capacity, window, evict) = {
            let config = self.config.read();
            if !config.enabled {
                return RateDecision::Allow;
            }
            (
                config.capacity,
                Duration::from_secs(config.window_secs),
                Duration::from_secs(config.idle_evict_secs),
            )
        };

        self.maybe_evict(evict);

        let now = Instant::now();
        let mut entry = self.windows.entry(key).or_insert_with(|| Window {
            started: now,
            count: 0,
            last_seen: now,
        });

        // Lazy window reset on access.
        if now.duration_since(entry.started) >= window {
            entry.started = now;
            entry.count = 0;
        }
        entry.last_seen = now;

        if entry.count >= capacity {
            let elapsed = now.duration_since(entry.started);
            let retry_after_secs = window.saturating_sub(elapsed).as_secs().max(1);
            warn!(client = %key, count = entry.count, "sensitive-route rate limit exceeded");
            return RateDecision::Deny { retry_after_secs };
        }

        entry.count += 1;
        RateDecision::Allow
    }

    /// Global per-IP backstop; allows everything when disabled.
    pub fn check_global(&self, key: IpAddr) -> RateDecision {
        let (per_second, burst) = {
            let config = self.config.read();
            if !config.enabled || config.global_requests_per_second == 0 {
                return RateDecision::Allow;
            }
            (config.global_requests_per_second, config.global_burst)
        };

        let limiter = self
            .global
            .entry(key)
            .or_insert_with(|| {
                let quota = Quota::per_second(
                    NonZeroU32::new(per_second).unwrap_or(NonZeroU32::new(100).unwrap()),
                )
                .allow_burst(NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::new(1).unwrap()));
                Arc::new(RateLimiter::direct(quota))
            })
            .clone();

        if limiter.check().is_err() {
            debug!(client = %key, "global rate limit exceeded");
            RateDecision::Deny { retry_after_secs: 1 }
        } else {
            RateDecision::Allow
        }
    }

    /// Drop window entries idle past the horizon. Runs at most once per
    /// `EVICT_STRIDE` checks so the cost stays off the common path.
    fn maybe_evict(&self, horizon: Duration) {
        if self.checks.fetch_add(1, Ordering::Relaxed) % EVICT_STRIDE != 0 {
            return;
        }
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.duration_since(w.last_seen) < horizon);
        let dropped = before.saturating_sub(self.windows.len());
        if dropped > 0 {
            debug!(dropped, "evicted stale rate-limit windows");
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, window_secs: u64) -> SensitiveRateLimiter {
        SensitiveRateLimiter::new(&RateLimitConfig {
            capacity,
            window_secs,
            idle_evict_secs: 600,
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn eleventh_request_in_window_is_denied_with_retry_hint() {
        let limiter = limiter(10, 60);
        let key: IpAddr = "203.0.113.7".parse().unwrap();

        for i in 0..10 {
            assert_eq!(limiter.check_sensitive(key), RateDecision::Allow, "request {}", i);
        }
        match limiter.check_sensitive(key) {
            RateDecision::Deny { retry_after_secs } => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            RateDecision::Allow => panic!("11th request must be denied"),
        }
    }

    #[test]
    fn counter_resets_after_window_expiry() {
        let limiter = limiter(2, 1);
        let key: IpAddr = "203.0.113.8".parse().unwrap();

        assert_eq!(limiter.check_sensitive(key), RateDecision::Allow);
        assert_eq!(limiter.check_sensitive(key), RateDecision::Allow);
        assert!(matches!(
            limiter.check_sensitive(key),
            RateDecision::Deny { .. }
        ));

        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(limiter.check_sensitive(key), RateDecision::Allow);
    }

    #[test]
    fn unrelated_keys_do_not_share_windows() {
        let limiter = limiter(1, 60);
        let a: IpAddr = "203.0.113.9".parse().unwrap();
        let b: IpAddr = "203.0.113.10".parse().unwrap();

        assert_eq!(limiter.check_sensitive(a), RateDecision::Allow);
        assert!(matches!(limiter.check_sensitive(a), RateDecision::Deny { .. }));
        assert_eq!(limiter.check_sensitive(b), RateDecision::Allow);
    }

    #[test]
    fn concurrent_checks_never_lose_updates() {
        let limiter = Arc::new(limiter(50, 60));
        let key: IpAddr = "203.0.113.11".parse().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    let mut allowed = 0u32;
                    for _ in 0..25 {
                        if limiter.check_sensitive(key) == RateDecision::Allow {
                            allowed += 1;
                        }
                    }
                    allowed
                })
            })
            .collect();

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 8 * 25 = 200 attempts against capacity 50: exactly 50 may pass.
        assert_eq!(total, 50);
    }

    #[test]
    fn stale_keys_are_reclaimed() {
        let limiter = SensitiveRateLimiter::new(&RateLimitConfig {
            capacity: 10,
            window_secs: 60,
            idle_evict_secs: 1,
            ..RateLimitConfig::default()
        });
        let key: IpAddr = "203.0.113.12".parse().unwrap();
        limiter.check_sensitive(key);
        assert_eq!(limiter.tracked_keys(), 1);

        std::thread::sleep(Duration::from_millis(1100));
        // Force an eviction pass regardless of stride position.
        limiter.checks.store(0, Ordering::Relaxed);
        limiter.check_sensitive("203.0.113.13".parse().unwrap());
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn disabled_limiter_allows_everything() {
        let limiter = SensitiveRateLimiter::new(&RateLimitConfig {
            enabled: false,
            capacity: 1,
            ..RateLimitConfig::default()
        });
        let key: IpAddr = "203.0.113.14".parse().unwrap();
        for _ in 0..100 {
            assert_eq!(limiter.check_sensitive(key), RateDecision::Allow);
        }
    }
}
