//! Weighted sliding window.

use std::collections::VecDeque;

use serde::Deserialize;

use crate::error::ConfigError;

/// Capacity of a bucket: at most `max_weight` total cost per `period_ms`.
///
/// Exchange specs write this as `{"requests": 10, "period": 1000}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LimitConfig {
    #[serde(alias = "requests")]
    pub max_weight: u64,
    #[serde(alias = "period")]
    pub period_ms: u64,
}

impl LimitConfig {
    pub fn new(max_weight: u64, period_ms: u64) -> Self {
        Self {
            max_weight,
            period_ms,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_weight == 0 {
            return Err(ConfigError::InvalidRateLimit("max_weight must be positive".into()));
        }
        if self.period_ms == 0 {
            return Err(ConfigError::InvalidRateLimit("period must be positive".into()));
        }
        Ok(())
    }
}

/// Outcome of a capacity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted and recorded.
    Ok,
    /// Not admitted; retry after this many milliseconds (always >= 1).
    Delay(u64),
    /// The cost is larger than the whole capacity and can never be admitted.
    ExceedsCapacity,
}

impl Admission {
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Ordered `(timestamp_ms, cost)` entries inside one window.
#[derive(Debug, Default)]
pub struct WeightedWindow {
    entries: VecDeque<(u64, u64)>,
    total: u64,
    last_used_ms: u64,
}

impl WeightedWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `cost` at `now_ms` if it fits, otherwise compute the shortest
    /// wait after which it would.
    ///
    /// A cost larger than `max_weight` is refused without touching the window.
    pub fn try_acquire(&mut self, now_ms: u64, config: &LimitConfig, cost: u64) -> Admission {
        if cost > config.max_weight {
            return Admission::ExceedsCapacity;
        }
        self.last_used_ms = now_ms;
        if let Some(cutoff) = now_ms.checked_sub(config.period_ms) {
            self.prune(cutoff);
        }

        if let Some(wanted) = self.total.checked_add(cost).filter(|w| *w <= config.max_weight) {
            self.entries.push_back((now_ms, cost));
            self.total = wanted;
            return Admission::Ok;
        }

        // Here `cost > max_weight - total`, so this cannot underflow.
        let overage = cost - config.max_weight.saturating_sub(self.total);
        let mut freed: u64 = 0;
        let mut release_at = now_ms;
        for &(ts, entry_cost) in &self.entries {
            freed = freed.saturating_add(entry_cost);
            release_at = ts;
            if freed >= overage {
                break;
            }
        }
        // An entry is pruned once `now - period >= ts`, so waiting until
        // exactly `ts + period` is enough.
        let delay = release_at
            .saturating_add(config.period_ms)
            .saturating_sub(now_ms);
        Admission::Delay(delay.max(1))
    }

    /// Drop entries at or before `cutoff_ms`.
    pub fn prune(&mut self, cutoff_ms: u64) {
        while let Some(&(ts, cost)) = self.entries.front() {
            if ts > cutoff_ms {
                break;
            }
            self.entries.pop_front();
            self.total = self.total.saturating_sub(cost);
        }
    }

    /// Total cost currently in the window.
    pub fn used(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Milliseconds since the window was last touched.
    pub fn idle_for(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_used_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_within_limit() {
        let config = LimitConfig::new(3, 1_000);
        let mut window = WeightedWindow::new();
        assert!(window.try_acquire(0, &config, 1).is_ok());
        assert!(window.try_acquire(1, &config, 1).is_ok());
        assert!(window.try_acquire(2, &config, 1).is_ok());
        assert_eq!(window.try_acquire(3, &config, 1), Admission::Delay(997));
    }

    #[test]
    fn test_costs_are_summed() {
        let config = LimitConfig::new(10, 1_000);
        let mut window = WeightedWindow::new();
        assert!(window.try_acquire(0, &config, 6).is_ok());
        assert!(window.try_acquire(100, &config, 4).is_ok());
        assert_eq!(window.used(), 10);
        assert!(!window.try_acquire(200, &config, 1).is_ok());
    }

    #[test]
    fn test_delay_waits_only_for_enough_weight() {
        let config = LimitConfig::new(10, 1_000);
        let mut window = WeightedWindow::new();
        window.try_acquire(0, &config, 2);
        window.try_acquire(300, &config, 3);
        window.try_acquire(600, &config, 5);

        // Needs 2 units: the first entry alone frees them.
        assert_eq!(window.try_acquire(700, &config, 2), Admission::Delay(300));
        // Needs 4 units: the first two entries must age out.
        assert_eq!(window.try_acquire(700, &config, 4), Admission::Delay(600));
    }

    #[test]
    fn test_entries_expire() {
        let config = LimitConfig::new(2, 100);
        let mut window = WeightedWindow::new();
        window.try_acquire(0, &config, 1);
        window.try_acquire(10, &config, 1);
        assert!(!window.try_acquire(50, &config, 1).is_ok());
        assert!(window.try_acquire(101, &config, 1).is_ok());
        assert_eq!(window.used(), 2);
    }

    #[test]
    fn test_oversized_cost_is_refused() {
        let config = LimitConfig::new(5, 1_000);
        let mut window = WeightedWindow::new();
        assert_eq!(window.try_acquire(0, &config, 50), Admission::ExceedsCapacity);
        assert_eq!(window.used(), 0);
        assert!(window.is_empty());

        assert!(window.try_acquire(10, &config, 1).is_ok());
        assert_eq!(window.try_acquire(20, &config, u64::MAX), Admission::ExceedsCapacity);
        assert_eq!(window.used(), 1);
        assert!(window.used() <= config.max_weight);
    }

    #[test]
    fn test_huge_capacity_does_not_overflow() {
        let config = LimitConfig::new(u64::MAX, u64::MAX);
        let mut window = WeightedWindow::new();
        assert!(window.try_acquire(u64::MAX - 1, &config, u64::MAX - 1).is_ok());
        assert!(matches!(
            window.try_acquire(u64::MAX, &config, 2),
            Admission::Delay(d) if d >= 1
        ));
        assert_eq!(window.used(), u64::MAX - 1);
    }

    #[test]
    fn test_mixed_costs_never_exceed_capacity() {
        let config = LimitConfig::new(5, 1_000);
        let mut window = WeightedWindow::new();

        assert!(window.try_acquire(0, &config, 3).is_ok());
        // 3 + 4 > 5: must wait for the first entry to leave.
        assert_eq!(window.try_acquire(100, &config, 4), Admission::Delay(900));
        assert!(window.try_acquire(200, &config, 2).is_ok());
        assert_eq!(window.used(), 5);
        assert!(!window.try_acquire(300, &config, 1).is_ok());

        assert!(window.try_acquire(1_000, &config, 3).is_ok());
        assert_eq!(window.used(), 5);
        // Freeing 4 units needs both (200, 2) and (1_000, 3) gone.
        assert_eq!(window.try_acquire(1_100, &config, 4), Admission::Delay(900));
        assert!(window.try_acquire(1_200, &config, 2).is_ok());
        assert_eq!(window.used(), 5);
    }

    #[test]
    fn test_capacity_invariant_over_trailing_windows() {
        let config = LimitConfig::new(7, 100);
        let mut window = WeightedWindow::new();
        let mut accepted: Vec<(u64, u64)> = Vec::new();

        for step in 0..2_000u64 {
            let now = step * 3;
            let cost = step % 4 + 1;
            if window.try_acquire(now, &config, cost).is_ok() {
                accepted.push((now, cost));
            }
        }

        for &(start, _) in &accepted {
            let in_window: u64 = accepted
                .iter()
                .filter(|(ts, _)| *ts >= start && *ts < start + config.period_ms)
                .map(|(_, c)| c)
                .sum();
            assert!(in_window <= config.max_weight);
        }
    }

    #[test]
    fn test_limit_config_from_spec_names() {
        let config: LimitConfig = serde_json::from_str(r#"{"requests": 10, "period": 1000}"#).unwrap();
        assert_eq!(config, LimitConfig::new(10, 1_000));
        assert!(LimitConfig::new(0, 1).validate().is_err());
        assert!(LimitConfig::new(1, 0).validate().is_err());
    }
}
