//! Virtual time for sprint pacing.

use std::time::Duration;
use tokio::time::Instant;

/// Maps virtual time units onto wall-clock time.
///
/// Units elapse with the tokio clock, so paused-time tests can drive a
/// sprint without real waiting.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    unit: Duration,
    origin: Instant,
}

impl VirtualClock {
    pub fn new(unit: Duration) -> Self {
        Self {
            unit: unit.max(Duration::from_nanos(1)),
            origin: Instant::now(),
        }
    }

    pub fn unit(&self) -> Duration {
        self.unit
    }

    /// Wall-clock length of `units`.
    pub fn to_wall(&self, units: u64) -> Duration {
        let nanos = self.unit.as_nanos().saturating_mul(units as u128);
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    /// Whole units contained in `duration`, rounded down.
    pub fn to_units(&self, duration: Duration) -> u64 {
        (duration.as_nanos() / self.unit.as_nanos()).min(u64::MAX as u128) as u64
    }

    /// Units elapsed since the clock was created.
    pub fn now_units(&self) -> u64 {
        self.to_units(self.origin.elapsed())
    }

    /// Instant `units` from now.
    pub fn deadline_after(&self, units: u64) -> Instant {
        Instant::now() + self.to_wall(units)
    }

    /// Suspend the caller for `units` of virtual time.
    pub async fn advance(&self, units: u64) {
        tokio::time::sleep(self.to_wall(units)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversions() {
        let clock = VirtualClock::new(Duration::from_millis(250));
        assert_eq!(clock.to_wall(4), Duration::from_secs(1));
        assert_eq!(clock.to_units(Duration::from_millis(999)), 3);
        assert_eq!(clock.to_units(Duration::ZERO), 0);
    }

    #[test]
    fn test_zero_unit_is_bumped() {
        let clock = VirtualClock::new(Duration::ZERO);
        assert!(clock.unit() > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advance_moves_now_units() {
        let clock = VirtualClock::new(Duration::from_secs(1));
        assert_eq!(clock.now_units(), 0);
        clock.advance(60).await;
        assert_eq!(clock.now_units(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_after() {
        let clock = VirtualClock::new(Duration::from_millis(10));
        let deadline = clock.deadline_after(5);
        assert_eq!(deadline - Instant::now(), Duration::from_millis(50));
    }
}
