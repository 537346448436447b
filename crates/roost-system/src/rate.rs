//! Token-bucket rate limiting.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A token bucket that refills completely at the start of each window.
///
/// Used to throttle console output (tokens = lines per window) and to cap
/// backup read/write throughput (tokens = bytes per second). The bucket is
/// internally locked and safe to share.
#[derive(Debug)]
pub struct Rate {
    limit: u64,
    window: Duration,
    inner: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    count: u64,
    window_start: Instant,
}

impl Rate {
    /// Creates a bucket allowing `limit` tokens per `window`.
    #[must_use]
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            inner: Mutex::new(Bucket {
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Attempts to take a single token, returning false when the current
    /// window is exhausted. A limit of zero disables the bucket entirely and
    /// always allows.
    pub fn try_allow(&self) -> bool {
        self.try_take(1)
    }

    /// Attempts to take `n` tokens at once.
    pub fn try_take(&self, n: u64) -> bool {
        if self.limit == 0 {
            return true;
        }
        let mut b = self.inner.lock().expect("rate bucket poisoned");
        let now = Instant::now();
        if now.duration_since(b.window_start) >= self.window {
            b.count = 0;
            b.window_start = now;
        }
        if b.count + n > self.limit {
            return false;
        }
        b.count += n;
        true
    }

    /// Blocks the calling thread until `n` tokens are available.
    ///
    /// Only intended for use on blocking I/O paths (backup streaming); async
    /// callers should use [`Rate::try_take`] and yield themselves.
    pub fn take_blocking(&self, n: u64) {
        if self.limit == 0 {
            return;
        }
        // Requests larger than the bucket are split so they can ever succeed.
        let mut remaining = n;
        while remaining > 0 {
            let chunk = remaining.min(self.limit);
            while !self.try_take(chunk) {
                std::thread::sleep(self.window / 4);
            }
            remaining -= chunk;
        }
    }

    /// Resets the bucket, restoring a full window of tokens.
    pub fn reset(&self) {
        let mut b = self.inner.lock().expect("rate bucket poisoned");
        b.count = 0;
        b.window_start = Instant::now();
    }

    /// The configured number of tokens per window.
    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_within_window() {
        let rate = Rate::new(3, Duration::from_secs(60));
        assert!(rate.try_allow());
        assert!(rate.try_allow());
        assert!(rate.try_allow());
        assert!(!rate.try_allow());
    }

    #[test]
    fn reset_restores_tokens() {
        let rate = Rate::new(1, Duration::from_secs(60));
        assert!(rate.try_allow());
        assert!(!rate.try_allow());
        rate.reset();
        assert!(rate.try_allow());
    }

    #[test]
    fn refills_after_window() {
        let rate = Rate::new(2, Duration::from_millis(10));
        assert!(rate.try_take(2));
        assert!(!rate.try_allow());
        std::thread::sleep(Duration::from_millis(15));
        assert!(rate.try_allow());
    }

    #[test]
    fn zero_limit_always_allows() {
        let rate = Rate::new(0, Duration::from_millis(100));
        for _ in 0..10_000 {
            assert!(rate.try_allow());
        }
    }
}
