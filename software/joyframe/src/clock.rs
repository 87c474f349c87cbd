//! Conversion between wall-clock durations and backend ticks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The discrete time unit a backend schedules in.
///
/// A zero ticksize means the backend drives its own timing; durations are
/// then counted in whole milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickClock {
    ticksize: Duration,
}

impl TickClock {
    pub const fn new(ticksize: Duration) -> Self {
        Self { ticksize }
    }

    pub const fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    pub const fn ticksize(&self) -> Duration {
        self.ticksize
    }

    /// True when the backend paces itself and ticks are milliseconds
    pub const fn is_backend_driven(&self) -> bool {
        self.ticksize.is_zero()
    }

    /// Wall-clock length of one tick
    pub fn unit(&self) -> Duration {
        if self.is_backend_driven() {
            Duration::from_millis(1)
        } else {
            self.ticksize
        }
    }

    /// Ticks covering `duration`, rounded up so the requested duration is
    /// always honored. Saturates at `u32::MAX`.
    pub fn ticks(&self, duration: Duration) -> u32 {
        let unit = self.unit().as_nanos();
        let n = duration.as_nanos().div_ceil(unit);
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    pub fn duration(&self, ticks: u32) -> Duration {
        self.unit() * ticks
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_rounds_up_to_whole_ticks() {
        let wired = TickClock::from_millis(8);
        assert_eq!(wired.ticks(ms(0)), 0);
        assert_eq!(wired.ticks(ms(1)), 1);
        assert_eq!(wired.ticks(ms(8)), 1);
        assert_eq!(wired.ticks(ms(9)), 2);
        assert_eq!(wired.duration(2), ms(16));

        let wireless = TickClock::from_millis(15);
        assert_eq!(wireless.ticks(ms(30)), 2);
        assert_eq!(wireless.ticks(ms(31)), 3);
        assert_eq!(wireless.ticks(Duration::from_micros(15_001)), 2);
    }

    #[test]
    fn test_backend_driven_counts_millis() {
        let clock = TickClock::default();
        assert!(clock.is_backend_driven());
        assert_eq!(clock.unit(), ms(1));
        assert_eq!(clock.ticks(ms(150)), 150);
        assert_eq!(clock.ticks(Duration::from_micros(1500)), 2);
        assert_eq!(clock.duration(150), ms(150));
    }

    #[test]
    fn test_saturates() {
        let clock = TickClock::from_millis(1);
        assert_eq!(clock.ticks(Duration::from_secs(u64::MAX / 2)), u32::MAX);
    }
}
