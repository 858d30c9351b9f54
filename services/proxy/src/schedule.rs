//! Staggered refresh scheduling.
//!
//! Supervisor `i` of `n` launches its first generation at
//! `i * period / n` and refreshes every `period` after that, so refreshes
//! across the pool are spread evenly over one period.

use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Initial delay for the supervisor at `index` in a pool of `pool_size`.
pub fn stagger_delay(index: usize, pool_size: usize, period: Duration) -> Duration {
    if pool_size == 0 {
        return Duration::ZERO;
    }
    let nanos = period.as_nanos() * index as u128 / pool_size as u128;
    let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % NANOS_PER_SEC) as u32)
}

/// Launch and refresh offsets for one supervisor, relative to manager start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSchedule {
    /// Delay before generation 1.
    pub stagger: Duration,
    /// Time between refreshes.
    pub period: Duration,
}

impl RefreshSchedule {
    pub fn for_index(index: usize, pool_size: usize, period: Duration) -> Self {
        Self {
            stagger: stagger_delay(index, pool_size, period),
            period,
        }
    }

    /// Offset of tick `k`; tick 0 launches generation 1. Saturates at
    /// `Duration::MAX`.
    pub fn tick_offset(&self, k: u32) -> Duration {
        self.stagger.saturating_add(self.period.saturating_mul(k))
    }

    /// Offset of the first regular refresh.
    pub fn first_refresh(&self) -> Duration {
        self.tick_offset(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 15)]
    #[case(2, 30)]
    #[case(3, 45)]
    fn test_stagger_four_over_a_minute(#[case] index: usize, #[case] secs: u64) {
        assert_eq!(
            stagger_delay(index, 4, Duration::from_secs(60)),
            Duration::from_secs(secs)
        );
    }

    #[test]
    fn test_stagger_default_pool() {
        // 31 regions over 15 minutes.
        let period = Duration::from_secs(15 * 60);
        assert_eq!(stagger_delay(0, 31, period), Duration::ZERO);
        assert_eq!(
            stagger_delay(1, 31, period),
            Duration::from_nanos(900_000_000_000 / 31)
        );
        assert!(stagger_delay(30, 31, period) < period);
    }

    #[test]
    fn test_stagger_empty_pool() {
        assert_eq!(stagger_delay(3, 0, Duration::from_secs(60)), Duration::ZERO);
    }

    #[test]
    fn test_refresh_ticks() {
        let schedule = RefreshSchedule::for_index(2, 4, Duration::from_secs(60));
        assert_eq!(schedule.tick_offset(0), Duration::from_secs(30));
        assert_eq!(schedule.first_refresh(), Duration::from_secs(90));
        assert_eq!(schedule.tick_offset(2), Duration::from_secs(150));
    }

    #[test]
    fn test_tick_offset_saturates() {
        let schedule = RefreshSchedule::for_index(1, 2, Duration::from_secs(u64::MAX / 2));
        assert_eq!(schedule.tick_offset(u32::MAX), Duration::MAX);
        assert_eq!(schedule.tick_offset(0), schedule.stagger);
        assert!(schedule.stagger < schedule.period);
    }
}
