//! Time utilities and TTL sentinels.
//!
//! All entry-level expiration arithmetic goes through a [`TimeSource`] so
//! that TTL behavior is testable without sleeping. Production code uses
//! [`WallClock`]; tests use [`ManualClock`] and advance it explicitly.

use std::sync::atomic::{AtomicU64, Ordering};

/// TTL value meaning "never expires".
pub const TTL_ETERNAL: u64 = 0;

/// Smallest representable TTL, used when a policy demands immediate expiry.
pub const TTL_MINIMUM: u64 = 1;

/// Expire time meaning "never expires".
pub const EXPIRE_TIME_ETERNAL: u64 = 0;

/// Source of wall time in milliseconds.
///
/// Exactly one time source is active per cache context. Entry operations
/// never sample the system clock directly.
pub trait TimeSource: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// System wall-clock time source (default).
#[derive(Debug, Default)]
pub struct WallClock;

impl TimeSource for WallClock {
    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually advanced time source for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at the given millisecond value.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    /// Advance the clock by the given number of milliseconds.
    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set the clock to an absolute millisecond value.
    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // Start well away from zero so "1ms in the past" never underflows.
        Self::new(1_000_000)
    }
}

impl TimeSource for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Convert a TTL into an absolute expire time.
///
/// An eternal TTL yields the eternal expire time; overflow saturates to
/// eternal as well, matching the "no expiry" reading of a huge TTL.
pub fn to_expire_time(now_ms: u64, ttl_ms: u64) -> u64 {
    if ttl_ms == TTL_ETERNAL {
        EXPIRE_TIME_ETERNAL
    } else {
        now_ms.checked_add(ttl_ms).unwrap_or(EXPIRE_TIME_ETERNAL)
    }
}

/// An expire time guaranteed to already have passed at `now_ms`.
pub fn expire_time_in_past(now_ms: u64) -> u64 {
    now_ms.saturating_sub(1).max(1)
}

/// Check whether an expire time has elapsed.
pub fn is_expired(expire_time: u64, now_ms: u64) -> bool {
    expire_time != EXPIRE_TIME_ETERNAL && expire_time <= now_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_millis(), 100);
        clock.advance(50);
        assert_eq!(clock.now_millis(), 150);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[test]
    fn expire_time_arithmetic() {
        assert_eq!(to_expire_time(1000, TTL_ETERNAL), EXPIRE_TIME_ETERNAL);
        assert_eq!(to_expire_time(1000, 500), 1500);
        assert_eq!(to_expire_time(u64::MAX, 2), EXPIRE_TIME_ETERNAL);
        assert!(is_expired(999, 1000));
        assert!(is_expired(1000, 1000));
        assert!(!is_expired(1001, 1000));
        assert!(!is_expired(EXPIRE_TIME_ETERNAL, u64::MAX));
    }

    #[test]
    fn past_expire_time_is_before_now() {
        let now = 5000;
        assert!(is_expired(expire_time_in_past(now), now));
    }
}
