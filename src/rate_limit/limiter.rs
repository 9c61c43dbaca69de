//! Per-key weighted rate limiter.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::rate_limit::key::RateLimitKey;
use crate::rate_limit::window::{Admission, LimitConfig, WeightedWindow};

/// Keys untouched for this long are dropped entirely.
pub const DEFAULT_IDLE_EVICTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Sliding-window limiter with one bucket per [`RateLimitKey`].
///
/// Check-and-record for one key happens under that key's shard lock, so
/// concurrent callers never lose updates, and different keys only contend
/// when they hash to the same shard.
///
/// ```rust
/// use exchange_pipeline::rate_limit::{Admission, LimitConfig, RateLimitKey, RateLimiter};
///
/// let limiter = RateLimiter::new();
/// let key = RateLimitKey::public("binance");
/// let config = LimitConfig::new(1, 1_000);
///
/// assert_eq!(limiter.check(&key, Some(&config), 1), Admission::Ok);
/// assert!(matches!(limiter.check(&key, Some(&config), 1), Admission::Delay(_)));
/// // No config means no limit.
/// assert_eq!(limiter.check(&key, None, 1), Admission::Ok);
/// ```
pub struct RateLimiter {
    buckets: DashMap<RateLimitKey, WeightedWindow>,
    clock: Arc<dyn Clock>,
    idle_eviction: Duration,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
            idle_eviction: DEFAULT_IDLE_EVICTION,
        }
    }

    /// Override the idle eviction horizon.
    pub fn with_idle_eviction(mut self, idle: Duration) -> Self {
        self.idle_eviction = idle;
        self
    }

    pub fn idle_eviction(&self) -> Duration {
        self.idle_eviction
    }

    /// Admit `cost` for `key` now, or say how long to wait.
    pub fn check(&self, key: &RateLimitKey, config: Option<&LimitConfig>, cost: u64) -> Admission {
        let Some(config) = config else {
            return Admission::Ok;
        };
        let now = self.clock.now_ms();
        let mut bucket = self.buckets.entry(key.clone()).or_default();
        bucket.try_acquire(now, config, cost)
    }

    /// Wait until `cost` is admitted for `key`. Returns the total time slept.
    ///
    /// A cost that can never fit fails immediately instead of waiting.
    pub async fn wait(
        &self,
        key: &RateLimitKey,
        config: Option<&LimitConfig>,
        cost: u64,
    ) -> Result<Duration, ConfigError> {
        let mut waited = Duration::ZERO;
        loop {
            match self.check(key, config, cost) {
                Admission::Ok => return Ok(waited),
                Admission::Delay(ms) => {
                    tracing::debug!(%key, delay_ms = ms, cost, "rate limited, waiting");
                    let delay = Duration::from_millis(ms);
                    tokio::time::sleep(delay).await;
                    waited = waited.saturating_add(delay);
                }
                Admission::ExceedsCapacity => {
                    let max_weight = config.map_or(0, |c| c.max_weight);
                    tracing::warn!(%key, cost, max_weight, "request cost exceeds rate limit capacity");
                    return Err(ConfigError::CostExceedsCapacity { cost, max_weight });
                }
            }
        }
    }

    /// Prune entries older than `max_age` from every bucket and evict keys idle
    /// past the eviction horizon. Returns the number of keys evicted.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = self.clock.now_ms();
        let max_age_ms = max_age.as_millis() as u64;
        let idle_ms = self.idle_eviction.as_millis() as u64;
        let before = self.buckets.len();

        self.buckets.retain(|_, bucket| {
            if let Some(cutoff) = now.checked_sub(max_age_ms) {
                bucket.prune(cutoff);
            }
            !(bucket.is_empty() && bucket.idle_for(now) >= idle_ms)
        });

        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.buckets.len(), "evicted idle rate limit buckets");
        }
        evicted
    }

    /// Run [`RateLimiter::cleanup`] every `interval` until the limiter is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                limiter.cleanup(max_age);
            }
        })
    }

    /// Cost currently counted against `key`.
    pub fn used(&self, key: &RateLimitKey) -> u64 {
        self.buckets.get(key).map_or(0, |bucket| bucket.used())
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("tracked_keys", &self.buckets.len())
            .field("idle_eviction", &self.idle_eviction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_ten_per_second() {
        let limiter = RateLimiter::with_clock(Arc::new(ManualClock::new(1_000_000)));
        let key = RateLimitKey::public("binance");
        let config = LimitConfig::new(10, 1_000);

        for _ in 0..10 {
            assert_eq!(limiter.check(&key, Some(&config), 1), Admission::Ok);
        }
        match limiter.check(&key, Some(&config), 1) {
            Admission::Delay(d) => assert!(d > 0 && d <= 1_000, "delay {d}"),
            other => panic!("11th request not delayed: {other:?}"),
        }
    }

    #[test]
    fn test_keys_are_isolated() {
        let limiter = RateLimiter::with_clock(Arc::new(ManualClock::new(0)));
        let config = LimitConfig::new(2, 1_000);
        let a = RateLimitKey::api_key("okx", "keyA");
        let b = RateLimitKey::api_key("okx", "keyB");
        let public = RateLimitKey::public("okx");

        assert!(limiter.check(&a, Some(&config), 2).is_ok());
        assert!(!limiter.check(&a, Some(&config), 1).is_ok());
        assert!(limiter.check(&b, Some(&config), 2).is_ok());
        assert!(limiter.check(&public, Some(&config), 2).is_ok());
        assert_eq!(limiter.used(&a), 2);
        assert_eq!(limiter.tracked_keys(), 3);
    }

    #[test]
    fn test_cleanup_evicts_idle_keys() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::with_clock(clock.clone());
        let config = LimitConfig::new(5, 1_000);
        limiter.check(&RateLimitKey::api_key("x", "old"), Some(&config), 1);

        clock.advance(23 * 60 * 60 * 1_000);
        limiter.check(&RateLimitKey::api_key("x", "fresh"), Some(&config), 1);

        clock.advance(60 * 60 * 1_000);
        assert_eq!(limiter.cleanup(Duration::from_secs(60)), 1);
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.used(&RateLimitKey::api_key("x", "fresh")), 0);
    }

    #[test]
    fn test_concurrent_checks_respect_capacity() {
        let limiter = Arc::new(RateLimiter::with_clock(Arc::new(ManualClock::new(0))));
        let config = LimitConfig::new(100, 60_000);
        let key = RateLimitKey::public("bybit");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| limiter.check(&key, Some(&config), 1).is_ok())
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }

    #[tokio::test]
    async fn test_wait_sleeps_until_admitted() {
        let limiter = RateLimiter::new();
        let key = RateLimitKey::public("kraken");
        let config = LimitConfig::new(2, 100);

        let start = Instant::now();
        for _ in 0..3 {
            limiter.wait(&key, Some(&config), 1).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_wait_rejects_cost_above_capacity() {
        let limiter = RateLimiter::with_clock(Arc::new(ManualClock::new(0)));
        let key = RateLimitKey::public("kraken");
        let config = LimitConfig::new(5, 1_000);

        let error = limiter.wait(&key, Some(&config), 50).await.unwrap_err();
        assert!(matches!(
            error,
            ConfigError::CostExceedsCapacity { cost: 50, max_weight: 5 }
        ));
        assert_eq!(limiter.used(&key), 0);
        // Without a limit there is no capacity to exceed.
        assert_eq!(limiter.wait(&key, None, 50).await.unwrap(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_maintenance_task_stops_with_limiter() {
        let limiter = Arc::new(RateLimiter::new());
        let handle = limiter.spawn_maintenance(Duration::from_millis(5), Duration::from_secs(1));
        drop(limiter);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
