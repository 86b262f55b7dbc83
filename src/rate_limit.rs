use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::metrics::{RATE_LIMIT_KEYS, RATE_LIMIT_REJECTIONS};

// Rate limit entry - tracks requests per IP/key
#[derive(Debug, Clone, Copy)]
pub struct RateLimitEntry {
    pub count: u32,
    pub window_start_ms: i64,
}

impl RateLimitEntry {
    fn expired(&self, now_ms: i64, window_ms: i64) -> bool {
        now_ms - self.window_start_ms > window_ms
    }
}

// Settings for one named limiter
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub name: &'static str,
    pub window: Duration,
    pub max: u32, // 0 disables the limiter
    pub message: &'static str,
}

impl LimiterConfig {
    pub fn new(name: &'static str, window: Duration, max: u32, message: &'static str) -> Self {
        Self {
            name,
            window,
            max,
            message,
        }
    }
}

/// Outcome of a single [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admitted {
        limit: u32,
        remaining: u32,
        reset_after_secs: u64,
    },
    Rejected {
        limit: u32,
        retry_after_secs: u64,
    },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }
}

/// Fixed-window counter keyed by caller identity.
///
/// Each call to [`check`](Self::check) goes through the map's entry API, so the
/// expiry test, the reset and the increment for one key happen under that
/// key's shard lock and cannot interleave with another request for the same key.
pub struct RateLimiter {
    config: LimiterConfig,
    entries: DashMap<String, RateLimitEntry>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn name(&self) -> &'static str {
        self.config.name
    }

    pub fn message(&self) -> &'static str {
        self.config.message
    }

    pub fn is_enabled(&self) -> bool {
        self.config.max > 0
    }

    fn window_ms(&self) -> i64 {
        self.config.window.as_millis() as i64
    }

    pub fn check(&self, key: &str) -> Decision {
        let limit = self.config.max;
        let window_ms = self.window_ms();

        if !self.is_enabled() {
            return Decision::Admitted {
                limit,
                remaining: u32::MAX,
                reset_after_secs: 0,
            };
        }

        let now = self.clock.now_ms();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert(RateLimitEntry {
                count: 0,
                window_start_ms: now,
            });

        // fresh key or stale window -> start over
        if entry.count == 0 || entry.expired(now, window_ms) {
            entry.count = 1;
            entry.window_start_ms = now;
            return Decision::Admitted {
                limit,
                remaining: limit - 1,
                reset_after_secs: ceil_secs(window_ms),
            };
        }

        entry.count = entry.count.saturating_add(1);
        let until_reset = entry.window_start_ms + window_ms - now;

        if entry.count > limit {
            let key_count = entry.count;
            drop(entry);
            RATE_LIMIT_REJECTIONS
                .with_label_values(&[self.config.name])
                .inc();
            debug!(
                limiter = self.config.name,
                key,
                count = key_count,
                max = limit,
                "rate limit exceeded"
            );
            return Decision::Rejected {
                limit,
                retry_after_secs: ceil_secs(until_reset),
            };
        }

        Decision::Admitted {
            limit,
            remaining: limit - entry.count,
            reset_after_secs: ceil_secs(until_reset),
        }
    }

    // Give one unit back, e.g. for a login that turned out to be successful
    pub fn refund(&self, key: &str) {
        let now = self.clock.now_ms();
        let window_ms = self.window_ms();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.expired(now, window_ms) {
                entry.count = entry.count.saturating_sub(1);
            }
        }
    }

    /// Drops every entry whose window has run out. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let window_ms = self.window_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.expired(now, window_ms));
        let removed = before.saturating_sub(self.entries.len());
        RATE_LIMIT_KEYS
            .with_label_values(&[self.config.name])
            .set(self.entries.len() as f64);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn ceil_secs(ms: i64) -> u64 {
    if ms <= 0 {
        return 0;
    }
    ((ms + 999) / 1000) as u64
}

// All limiters the API applies, each with its own key space
pub struct RateLimiters {
    pub global: RateLimiter,
    pub strict: RateLimiter,
    pub login: RateLimiter,
    pub user: RateLimiter,
    pub api: RateLimiter,
    pub deploy: RateLimiter,
}

impl RateLimiters {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            global: RateLimiter::new(config.global.clone(), Arc::clone(&clock)),
            strict: RateLimiter::new(config.strict.clone(), Arc::clone(&clock)),
            login: RateLimiter::new(config.login.clone(), Arc::clone(&clock)),
            user: RateLimiter::new(config.user.clone(), Arc::clone(&clock)),
            api: RateLimiter::new(config.api.clone(), Arc::clone(&clock)),
            deploy: RateLimiter::new(config.deploy.clone(), clock),
        }
    }

    pub fn all(&self) -> [&RateLimiter; 6] {
        [
            &self.global,
            &self.strict,
            &self.login,
            &self.user,
            &self.api,
            &self.deploy,
        ]
    }

    pub fn sweep(&self) -> usize {
        self.all().iter().map(|limiter| limiter.sweep()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub global: LimiterConfig,
    pub strict: LimiterConfig,
    pub login: LimiterConfig,
    pub user: LimiterConfig,
    pub api: LimiterConfig,
    pub deploy: LimiterConfig,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        const MINUTE: u64 = 60;
        Self {
            global: LimiterConfig::new(
                "global",
                Duration::from_secs(15 * MINUTE),
                100,
                "Rate limit exceeded. Please try again later.",
            ),
            strict: LimiterConfig::new(
                "strict",
                Duration::from_secs(15 * MINUTE),
                5,
                "Strict rate limit exceeded. Please try again later.",
            ),
            login: LimiterConfig::new(
                "login",
                Duration::from_secs(15 * MINUTE),
                10,
                "Too many failed login attempts. Please try again later.",
            ),
            user: LimiterConfig::new(
                "user",
                Duration::from_secs(MINUTE),
                30,
                "User rate limit exceeded. Please try again later.",
            ),
            api: LimiterConfig::new(
                "api",
                Duration::from_secs(MINUTE),
                60,
                "API rate limit exceeded. Please try again later.",
            ),
            deploy: LimiterConfig::new(
                "deploy",
                Duration::from_secs(5 * MINUTE),
                3,
                "Deploy rate limit exceeded. Please wait before trying again.",
            ),
            sweep_interval: Duration::from_secs(MINUTE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn limiter(window_secs: u64, max: u32) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let config = LimiterConfig::new("test", Duration::from_secs(window_secs), max, "slow down");
        (RateLimiter::new(config, clock.clone()), clock)
    }

    #[test]
    fn admits_up_to_max_then_rejects() {
        let (limiter, _clock) = limiter(60, 3);

        for expected_remaining in [2, 1, 0] {
            match limiter.check("10.0.0.1") {
                Decision::Admitted { remaining, .. } => assert_eq!(remaining, expected_remaining),
                other => panic!("expected admit, got {other:?}"),
            }
        }

        assert!(!limiter.check("10.0.0.1").is_admitted());
        assert!(!limiter.check("10.0.0.1").is_admitted());
    }

    #[test]
    fn keys_are_independent() {
        let (limiter, _clock) = limiter(60, 1);
        assert!(limiter.check("a").is_admitted());
        assert!(!limiter.check("a").is_admitted());
        assert!(limiter.check("b").is_admitted());
    }

    #[test]
    fn retry_after_bounded_and_shrinking() {
        let (limiter, clock) = limiter(60, 1);
        assert!(limiter.check("k").is_admitted());

        let mut last = u64::MAX;
        for _ in 0..5 {
            match limiter.check("k") {
                Decision::Rejected { retry_after_secs, .. } => {
                    assert!(retry_after_secs <= 60);
                    assert!(retry_after_secs < last);
                    last = retry_after_secs;
                }
                other => panic!("expected reject, got {other:?}"),
            }
            clock.advance(ChronoDuration::seconds(10));
        }
    }

    #[test]
    fn retry_after_rounds_up() {
        let (limiter, clock) = limiter(60, 1);
        assert!(limiter.check("k").is_admitted());
        clock.advance(ChronoDuration::milliseconds(500));

        assert_eq!(
            limiter.check("k"),
            Decision::Rejected {
                limit: 1,
                retry_after_secs: 60
            }
        );
    }

    #[test]
    fn expired_window_resets_to_one() {
        let (limiter, clock) = limiter(60, 2);
        for _ in 0..5 {
            limiter.check("k");
        }

        // still inside the window at exactly window_ms
        clock.advance(ChronoDuration::seconds(60));
        assert!(!limiter.check("k").is_admitted());

        clock.advance(ChronoDuration::milliseconds(1));
        assert_eq!(
            limiter.check("k"),
            Decision::Admitted {
                limit: 2,
                remaining: 1,
                reset_after_secs: 60
            }
        );
        assert!(limiter.check("k").is_admitted());
        assert!(!limiter.check("k").is_admitted());
    }

    #[test]
    fn disabled_limiter_always_admits() {
        let (limiter, _clock) = limiter(60, 0);
        for _ in 0..100 {
            assert!(limiter.check("k").is_admitted());
        }
        assert!(limiter.is_empty());
    }

    #[test]
    fn refund_returns_budget() {
        let (limiter, _clock) = limiter(60, 2);
        assert!(limiter.check("ip").is_admitted());
        limiter.refund("ip");
        assert!(limiter.check("ip").is_admitted());
        assert!(limiter.check("ip").is_admitted());
        assert!(!limiter.check("ip").is_admitted());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let (limiter, clock) = limiter(60, 5);
        limiter.check("old");
        clock.advance(ChronoDuration::seconds(45));
        limiter.check("new");
        clock.advance(ChronoDuration::seconds(30));

        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.len(), 1);
        assert!(limiter.check("new").is_admitted());
    }

    #[test]
    fn concurrent_checks_do_not_lose_increments() {
        let (limiter, _clock) = limiter(60, 1000);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..100).filter(|_| limiter.check("shared").is_admitted()).count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 800);
        assert_eq!(
            limiter.check("shared"),
            Decision::Admitted {
                limit: 1000,
                remaining: 199,
                reset_after_secs: 60
            }
        );
    }

    #[test]
    fn concurrent_checks_never_exceed_max() {
        let (limiter, _clock) = limiter(60, 50);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20).filter(|_| limiter.check("hot").is_admitted()).count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[test]
    fn registry_limiters_are_independent() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiters = RateLimiters::new(&RateLimitConfig::default(), clock);

        for _ in 0..3 {
            assert!(limiters.deploy.check("1.2.3.4").is_admitted());
        }
        assert!(!limiters.deploy.check("1.2.3.4").is_admitted());
        assert!(limiters.global.check("1.2.3.4").is_admitted());
        assert_eq!(limiters.deploy.name(), "deploy");
    }
}
