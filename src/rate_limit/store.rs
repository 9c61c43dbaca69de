//! Latest quota snapshot per `{exchange, credential}`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::clock::{Clock, SystemClock};
use crate::rate_limit::headers::RateLimitInfo;
use crate::rate_limit::key::RateLimitKey;

struct Snapshot {
    info: Arc<RateLimitInfo>,
    updated_ms: u64,
}

/// Most-recent-wins store of [`RateLimitInfo`].
///
/// Readers get a cloned `Arc` and never hold a shard lock past the call.
pub struct RateLimitStore {
    entries: DashMap<RateLimitKey, Snapshot>,
    clock: Arc<dyn Clock>,
}

impl RateLimitStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Replace the snapshot for `key`, returning the stored value.
    pub fn update(&self, key: RateLimitKey, info: RateLimitInfo) -> Arc<RateLimitInfo> {
        let info = Arc::new(info);
        let snapshot = Snapshot {
            info: Arc::clone(&info),
            updated_ms: self.clock.now_ms(),
        };
        self.entries.insert(key, snapshot);
        info
    }

    pub fn get(&self, key: &RateLimitKey) -> Option<Arc<RateLimitInfo>> {
        self.entries.get(key).map(|entry| Arc::clone(&entry.info))
    }

    /// All snapshots recorded for one exchange.
    pub fn for_exchange(&self, exchange: &str) -> Vec<(RateLimitKey, Arc<RateLimitInfo>)> {
        self.entries
            .iter()
            .filter(|entry| entry.key().exchange == exchange)
            .map(|entry| (entry.key().clone(), Arc::clone(&entry.info)))
            .collect()
    }

    pub fn remove(&self, key: &RateLimitKey) -> Option<Arc<RateLimitInfo>> {
        self.entries.remove(key).map(|(_, snapshot)| snapshot.info)
    }

    /// Drop snapshots not updated within `max_idle`. Returns the number dropped.
    pub fn cleanup(&self, max_idle: Duration) -> usize {
        let now = self.clock.now_ms();
        let max_idle_ms = u64::try_from(max_idle.as_millis()).unwrap_or(u64::MAX);
        let before = self.entries.len();
        self.entries
            .retain(|_, snapshot| now.saturating_sub(snapshot.updated_ms) < max_idle_ms);

        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.entries.len(), "evicted stale rate limit snapshots");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::headers::HeaderSource;

    fn info(remaining: u64) -> RateLimitInfo {
        RateLimitInfo {
            exchange: "okx".into(),
            limit: Some(20),
            used: Some(20 - remaining),
            remaining: Some(remaining),
            reset_at_ms: None,
            source: HeaderSource::Generic,
            raw_headers: vec![],
        }
    }

    #[test]
    fn test_most_recent_wins() {
        let store = RateLimitStore::new();
        let key = RateLimitKey::api_key("okx", "k1");

        store.update(key.clone(), info(10));
        let held = store.get(&key).unwrap();
        store.update(key.clone(), info(5));

        assert_eq!(store.get(&key).unwrap().remaining, Some(5));
        // Earlier readers keep their snapshot.
        assert_eq!(held.remaining, Some(10));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_per_credential_entries() {
        let store = RateLimitStore::new();
        store.update(RateLimitKey::api_key("okx", "k1"), info(1));
        store.update(RateLimitKey::api_key("okx", "k2"), info(2));
        store.update(RateLimitKey::public("binance"), info(3));

        assert_eq!(store.for_exchange("okx").len(), 2);
        assert!(store.remove(&RateLimitKey::public("binance")).is_some());
        assert!(store.get(&RateLimitKey::public("binance")).is_none());
    }

    #[test]
    fn test_cleanup_drops_stale_snapshots() {
        let clock = Arc::new(ManualClock::new(0));
        let store = RateLimitStore::with_clock(clock.clone());
        store.update(RateLimitKey::api_key("okx", "old"), info(1));

        clock.advance(50_000);
        store.update(RateLimitKey::api_key("okx", "fresh"), info(2));

        clock.advance(20_000);
        assert_eq!(store.cleanup(Duration::from_secs(60)), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get(&RateLimitKey::api_key("okx", "old")).is_none());
        assert!(store.get(&RateLimitKey::api_key("okx", "fresh")).is_some());
    }
}
