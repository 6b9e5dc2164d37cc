//! Interval-mode scheduling helpers.

use std::time::{Duration, SystemTime};

/// Time from `now` until the next wall-clock multiple of `period`.
///
/// The boundary is always strictly in the future: at exactly 12:05:00 with
/// a five minute period the result is five minutes, not zero. A zero
/// period yields zero.
pub fn until_next_boundary(now: SystemTime, period: Duration) -> Duration {
    let period = period.as_nanos();
    if period == 0 {
        return Duration::ZERO;
    }
    let since_epoch = now
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let remaining = period - since_epoch % period;
    Duration::from_nanos(u64::try_from(remaining).unwrap_or(u64::MAX))
}

/// Consecutive soft failure counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FailureStreak {
    count: u32,
    limit: u32,
}

impl FailureStreak {
    pub(crate) fn new(limit: u32) -> Self {
        Self { count: 0, limit }
    }

    /// Count a failure. Returns `true` when the streak reached the limit.
    pub(crate) fn record_failure(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        self.count >= self.limit
    }

    pub(crate) fn reset(&mut self) {
        self.count = 0;
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }
}
