//! Overflow-safe counter deltas and per-second rate normalization.
//!
//! Interface counters are monotonic but wrap at the top of their range.
//! [`wrapping_delta`] computes `(current - previous) mod 2^64`, which for a
//! single wrap equals `(MAX - previous) + current + 1`.  [`per_second`]
//! normalizes a delta over a millisecond interval, widening to 128 bits so
//! `delta * 1000` cannot overflow, and returns zero on a zero interval
//! rather than dividing.

/// Wrap-aware difference between two u64 counter snapshots.
///
/// Assumes at most one wrap between the snapshots.
#[must_use]
pub fn wrapping_delta(current: u64, previous: u64) -> u64 {
    current.wrapping_sub(previous)
}

/// Normalize a counter delta over `dt_ms` to a per-second rate.
///
/// Returns 0 when `dt_ms` is 0.  The scaled intermediate is computed in
/// u128; a result beyond `u64::MAX` saturates.
#[must_use]
pub fn per_second(delta: u64, dt_ms: u64) -> u64 {
    if dt_ms == 0 {
        return 0;
    }
    let scaled = u128::from(delta) * 1_000 / u128::from(dt_ms);
    u64::try_from(scaled).unwrap_or(u64::MAX)
}
