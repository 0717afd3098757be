//! Monotonic clock primitive.
//!
//! The engine is parameterized over a clock so that tests can drive it with
//! a deterministic, manually-advanced source instead of the real
//! `CLOCK_MONOTONIC`. See §6 (External Interfaces) — "a clock source
//! providing a monotonic 64-bit ns counter".

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonic nanosecond clock.
///
/// Implementations must be non-decreasing: two successive calls to `now_ns`
/// from the same thread must never observe time going backwards.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Wall clock backed by `clock_gettime(CLOCK_MONOTONIC)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid out-pointer for `clock_gettime`.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            // CLOCK_MONOTONIC cannot fail for a valid pointer on any
            // supported kernel; treat failure as "no time has passed".
            return 0;
        }
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}

/// A clock a test can advance by hand, shared across the threads/CPUs it fakes.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self(AtomicU64::new(start_ns))
    }

    pub fn set(&self, now_ns: u64) {
        self.0.store(now_ns, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ns: u64) -> u64 {
        self.0.fetch_add(delta_ns, Ordering::SeqCst) + delta_ns
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Rounds `time` up to the next multiple of `interval` (§4.3 re-arm rule).
///
/// `align_up(now, interval)` is used as the *first* deadline on init; the
/// re-arm rule instead aligns `now + interval`, which always lands strictly
/// in the future even when `now` is already a multiple of `interval`.
pub fn align_up(time: u64, interval: u64) -> u64 {
    debug_assert!(interval > 0);
    time.div_ceil(interval) * interval
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_next_boundary() {
        assert_eq!(align_up(0, 1_000_000), 0);
        assert_eq!(align_up(1, 1_000_000), 1_000_000);
        assert_eq!(align_up(1_000_000, 1_000_000), 1_000_000);
        assert_eq!(align_up(1_500_000, 1_000_000), 2_000_000);
    }

    #[test]
    fn manual_clock_advances_monotonically() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_ns(), 100);
        assert_eq!(clock.advance(50), 150);
        assert_eq!(clock.now_ns(), 150);
    }
}
