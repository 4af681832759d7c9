//! Monotonic time source
//!
//! Both execution contexts (input polling and coordination service) read time
//! through the same [`Clock`], so it is accessed by shared reference.

/// Monotonic microsecond clock with blocking delays
pub trait Clock: Sync {
    /// Microseconds since some fixed point in the past (e.g. boot)
    fn now_us(&self) -> u64;

    /// Block the calling context for at least `us` microseconds
    fn delay_us(&self, us: u32);

    /// Block the calling context for at least `ms` milliseconds
    fn delay_ms(&self, ms: u32) {
        self.delay_us(ms.saturating_mul(1000));
    }

    /// Truncated 32-bit timestamp, as carried in message headers
    fn stamp(&self) -> u32 {
        self.now_us() as u32
    }

    /// Microseconds elapsed since `since` (as returned by [`Self::now_us`])
    fn elapsed_us(&self, since: u64) -> u64 {
        self.now_us().saturating_sub(since)
    }

    /// Check whether `ms` milliseconds have passed since `since`
    fn expired(&self, since: u64, ms: u32) -> bool {
        self.elapsed_us(since) >= ms as u64 * 1000
    }
}
