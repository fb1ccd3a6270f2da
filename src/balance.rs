use std::{
    sync::atomic::{AtomicI32, Ordering},
    time::Duration,
};

use crate::ConfigError;

/// Points value to report when a call produced no quota information, e.g. it failed before a
/// response arrived.
///
/// [Balance::update] ignores it, so a failed call can still give its slot back.
pub const SENTINEL: i32 = -1;

/// The last known point balance of a rate-limited upstream, along with its refill model.
///
/// Starts full (`remaining == limit`).
#[derive(Debug)]
pub struct Balance {
    remaining: AtomicI32,
    threshold: i32,
    limit: i32,
    refill_rate: i32,
}

impl Balance {
    /// Create a full balance.
    ///
    /// * `threshold`: at or below this many remaining points, admissions should pause.
    /// * `limit`: the most points the upstream can hold.
    /// * `refill_rate`: points the upstream restores per second.
    pub fn new(threshold: i32, limit: i32, refill_rate: i32) -> Result<Self, ConfigError> {
        if refill_rate <= 0 {
            return Err(ConfigError::NonPositiveRefillRate(refill_rate));
        }
        if threshold < 0 {
            return Err(ConfigError::NegativeThreshold(threshold));
        }
        if threshold > limit {
            return Err(ConfigError::ThresholdAboveLimit { threshold, limit });
        }

        Ok(Self {
            remaining: AtomicI32::new(limit),
            threshold,
            limit,
            refill_rate,
        })
    }

    /// Record a new observation of the remaining points.
    ///
    /// [SENTINEL] (or anything below it) leaves the balance untouched.
    pub fn update(&self, points: i32) {
        if points > SENTINEL {
            self.remaining.store(points, Ordering::Release);
        }
    }

    /// Whether the remaining points are at or below the threshold.
    pub fn at_threshold(&self) -> bool {
        self.remaining() <= self.threshold
    }

    /// Estimated time for the upstream to refill back to the limit.
    ///
    /// Whole seconds only, truncated. Zero when the balance is already full.
    pub fn refill_duration(&self) -> Duration {
        let missing = self.limit.saturating_sub(self.remaining()).max(0);
        Duration::from_secs((missing / self.refill_rate) as u64)
    }

    pub fn remaining(&self) -> i32 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    pub fn limit(&self) -> i32 {
        self.limit
    }

    pub fn refill_rate(&self) -> i32 {
        self.refill_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance() -> Balance {
        Balance::new(100, 1000, 100).unwrap()
    }

    #[test]
    fn starts_full() {
        let b = balance();
        assert_eq!(b.remaining(), 1000);
        assert_eq!(b.threshold(), 100);
        assert_eq!(b.limit(), 1000);
        assert_eq!(b.refill_rate(), 100);
    }

    #[test]
    fn refill_duration() {
        let b = balance();
        assert_eq!(b.refill_duration(), Duration::ZERO);

        b.update(0);
        assert_eq!(b.refill_duration(), Duration::from_secs(10));

        // 950 missing points at 100/s is 9.5s, truncated.
        b.update(50);
        assert_eq!(b.refill_duration(), Duration::from_secs(9));
    }

    #[test]
    fn refill_duration_above_limit_is_zero() {
        let b = balance();
        b.update(5000);
        assert_eq!(b.refill_duration(), Duration::ZERO);
    }

    #[test]
    fn at_threshold() {
        let b = balance();
        assert!(!b.at_threshold());

        b.update(101);
        assert!(!b.at_threshold());

        b.update(100);
        assert!(b.at_threshold());

        b.update(0);
        assert!(b.at_threshold());
    }

    #[test]
    fn sentinel_is_ignored() {
        let b = balance();
        b.update(500);
        b.update(SENTINEL);
        assert_eq!(b.remaining(), 500);

        b.update(-20);
        assert_eq!(b.remaining(), 500);
    }

    #[test]
    fn rejects_bad_config() {
        assert_eq!(
            Balance::new(100, 1000, 0).unwrap_err(),
            ConfigError::NonPositiveRefillRate(0)
        );
        assert_eq!(
            Balance::new(100, 1000, -5).unwrap_err(),
            ConfigError::NonPositiveRefillRate(-5)
        );
        assert_eq!(
            Balance::new(-1, 1000, 10).unwrap_err(),
            ConfigError::NegativeThreshold(-1)
        );
        assert_eq!(
            Balance::new(1001, 1000, 10).unwrap_err(),
            ConfigError::ThresholdAboveLimit {
                threshold: 1001,
                limit: 1000
            }
        );
        assert!(Balance::new(1000, 1000, 1).is_ok());
        assert!(Balance::new(0, 0, 1).is_ok());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn refill_never_exceeds_full_refill(
                limit in 0i32..100_000,
                rate in 1i32..10_000,
                points in -1i32..200_000,
            ) {
                let b = Balance::new(0, limit, rate).unwrap();
                b.update(points);
                let full = Duration::from_secs((limit / rate) as u64);
                prop_assert!(b.refill_duration() <= full);
            }

            #[test]
            fn sentinel_never_changes_remaining(first in 0i32..100_000) {
                let b = Balance::new(0, 100_000, 1).unwrap();
                b.update(first);
                b.update(SENTINEL);
                prop_assert_eq!(b.remaining(), first);
            }

            #[test]
            fn threshold_predicate(threshold in 0i32..1000, points in 0i32..2000) {
                let b = Balance::new(threshold, 1000, 10).unwrap();
                b.update(points);
                prop_assert_eq!(b.at_threshold(), points <= threshold);
            }
        }
    }
}
