use core::convert::Infallible;

/// Helper trait to resolve Infallible Results (e.g. from GPIO reads)
pub trait InfallibleResult<T> {
    fn infallible(self) -> T;
}

impl<T> InfallibleResult<T> for Result<T, Infallible> {
    fn infallible(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => match e {},
        }
    }
}

/// Time between two truncated 32-bit microsecond stamps
///
/// Stamps wrap roughly every 71 minutes, so the difference is computed modulo 2^32.
pub const fn stamp_delta(now: u32, then: u32) -> u32 {
    now.wrapping_sub(then)
}

/// Integer average that yields 0 for an empty set
pub const fn average(total: u64, count: u32) -> u64 {
    if count == 0 { 0 } else { total / count as u64 }
}
