//! Disk quota accounting.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Running counter of bytes consumed beneath a server root, checked against
/// a hard limit.
///
/// Increments are atomic. The compare-with-limit precheck is advisory in the
/// sense that two racing writers can both pass it; the definitive guard is
/// that any writer whose precheck fails refuses to write.
#[derive(Debug)]
pub struct UsageCounter {
    limit: AtomicU64,
    used: AtomicI64,
    last_walk: Mutex<Option<Instant>>,
    walk_interval: Duration,
}

impl UsageCounter {
    pub fn new(limit: u64, walk_interval: Duration) -> Self {
        Self {
            limit: AtomicU64::new(limit),
            used: AtomicI64::new(0),
            last_walk: Mutex::new(None),
            walk_interval,
        }
    }

    /// Quota in bytes; zero means unlimited.
    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, limit: u64) {
        self.limit.store(limit, Ordering::Release);
    }

    /// Currently accounted bytes. Never negative even if decrements raced a
    /// recomputation.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire).max(0) as u64
    }

    pub fn set_used(&self, used: u64) {
        self.used.store(used as i64, Ordering::Release);
    }

    /// Atomically applies a signed delta.
    pub fn add(&self, delta: i64) {
        self.used.fetch_add(delta, Ordering::AcqRel);
    }

    /// True when `delta` additional bytes would still fit under the limit.
    pub fn can_fit(&self, delta: i64) -> bool {
        let limit = self.limit();
        if limit == 0 {
            return true;
        }
        let used = self.used.load(Ordering::Acquire);
        used.saturating_add(delta) <= limit as i64
    }

    /// True while the accounted usage is within the limit.
    pub fn has_space_available(&self) -> bool {
        let limit = self.limit();
        limit == 0 || self.used() <= limit
    }

    /// Returns true when the cached usage is stale and a walk should be
    /// scheduled, marking the walk as started.
    pub fn should_walk(&self, force: bool) -> bool {
        let mut last = self.last_walk.lock().expect("usage walk clock poisoned");
        let stale = force
            || last
                .map(|at| at.elapsed() >= self.walk_interval)
                .unwrap_or(true);
        if stale {
            *last = Some(Instant::now());
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_when_zero() {
        let usage = UsageCounter::new(0, Duration::from_secs(60));
        usage.add(i64::MAX / 2);
        assert!(usage.can_fit(i64::MAX / 2));
        assert!(usage.has_space_available());
    }

    #[test]
    fn precheck_refuses_overflow() {
        let usage = UsageCounter::new(100, Duration::from_secs(60));
        usage.set_used(90);
        assert!(usage.can_fit(10));
        assert!(!usage.can_fit(11));
    }

    #[test]
    fn usage_never_reports_negative() {
        let usage = UsageCounter::new(100, Duration::from_secs(60));
        usage.add(-50);
        assert_eq!(usage.used(), 0);
    }
}
