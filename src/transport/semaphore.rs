use core::convert::Infallible;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::time::Clock;

/// Granularity of blocking waits
const POLL_INTERVAL_US: u32 = 250;

/// Counting semaphore built on a single atomic counter
///
/// Every [`Semaphore::give`] is matched by exactly one successful take, so
/// back-to-back signals are never collapsed into one wakeup (up to `max`).
pub struct Semaphore {
    count: AtomicU32,
    max: u32,
}

impl Semaphore {
    pub const fn new(max: u32) -> Self {
        Self { count: AtomicU32::new(0), max }
    }

    /// Signal once, returns false if the counter is already saturated
    pub fn give(&self) -> bool {
        self.count
            .fetch_update(Ordering::Release, Ordering::Relaxed, |c| (c < self.max).then(|| c + 1))
            .is_ok()
    }

    pub fn try_take(&self) -> nb::Result<(), Infallible> {
        self.count
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |c| c.checked_sub(1))
            .map(drop)
            .map_err(|_| nb::Error::WouldBlock)
    }

    /// Wait at most `timeout_ms` for a signal
    pub fn take<C: Clock>(&self, clock: &C, timeout_ms: u32) -> bool {
        let start = clock.now_us();
        loop {
            if self.try_take().is_ok() {
                return true;
            }
            if clock.expired(start, timeout_ms) {
                return false;
            }
            clock.delay_us(POLL_INTERVAL_US);
        }
    }

    /// Discard all pending signals, returns how many were dropped
    pub fn drain(&self) -> u32 {
        self.count.swap(0, Ordering::Acquire)
    }

    pub fn available(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_full(&self) -> bool {
        self.available() >= self.max
    }
}
