//! Train-id extrapolation from time-server ticks.

use std::sync::OnceLock;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Epochstamp, Timestamp, Trainstamp, ATTOSEC_PER_MICROSEC};

/// One `slotTimeTick(id, sec, frac, period)` from the time server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeTick {
    pub train_id: u64,
    pub sec: u64,
    pub frac: u64,
    /// Train period in microseconds.
    pub period_us: u64,
}

/// Maps wall-clock instants to train ids by linear extrapolation from the
/// last tick.
#[derive(Debug, Default)]
pub struct TrainClock {
    reference: RwLock<Option<TimeTick>>,
}

static GLOBAL: OnceLock<TrainClock> = OnceLock::new();

impl TrainClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide clock.
    pub fn global() -> &'static TrainClock {
        GLOBAL.get_or_init(TrainClock::new)
    }

    /// Record a tick. A zero period leaves the clock unsynchronized.
    pub fn tick(&self, tick: TimeTick) {
        *self.reference.write() = (tick.period_us > 0).then_some(tick);
    }

    #[must_use]
    pub fn last_tick(&self) -> Option<TimeTick> {
        *self.reference.read()
    }

    /// Train id at `epoch`; 0 before the first tick.
    #[must_use]
    pub fn train_id_at(&self, epoch: &Epochstamp) -> u64 {
        let Some(tick) = self.last_tick() else {
            return 0;
        };
        let reference = Epochstamp::new(tick.sec, tick.frac);
        let distance_us =
            epoch.attoseconds_since(&reference).unsigned_abs() / u128::from(ATTOSEC_PER_MICROSEC);
        let periods = u64::try_from(distance_us / u128::from(tick.period_us)).unwrap_or(u64::MAX);
        if reference <= *epoch {
            tick.train_id.saturating_add(periods)
        } else if tick.train_id > periods {
            tick.train_id - periods - 1
        } else {
            warn!(
                epoch = %epoch,
                reference = %reference,
                train_id = tick.train_id,
                period_us = tick.period_us,
                "instant precedes train 0; using train id 0"
            );
            0
        }
    }

    /// Pair `epoch` with its extrapolated train id.
    #[must_use]
    pub fn timestamp(&self, epoch: Epochstamp) -> Timestamp {
        Timestamp::new(epoch, Trainstamp(self.train_id_at(&epoch)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ATTOSEC_PER_SEC;

    fn clock() -> TrainClock {
        let clock = TrainClock::new();
        clock.tick(TimeTick {
            train_id: 1000,
            sec: 100,
            frac: 0,
            period_us: 100_000,
        });
        clock
    }

    #[test]
    fn test_unsynchronized_clock_yields_zero() {
        assert_eq!(TrainClock::new().train_id_at(&Epochstamp::now()), 0);
    }

    #[test]
    fn test_forward_extrapolation() {
        let c = clock();
        assert_eq!(c.train_id_at(&Epochstamp::new(100, 0)), 1000);
        assert_eq!(c.train_id_at(&Epochstamp::new(100, ATTOSEC_PER_SEC / 20)), 1000);
        assert_eq!(c.train_id_at(&Epochstamp::new(101, 0)), 1010);
    }

    #[test]
    fn test_backward_extrapolation() {
        let c = clock();
        // 50 ms before the tick: n = 0, id = 1000 - 0 - 1
        assert_eq!(c.train_id_at(&Epochstamp::new(99, ATTOSEC_PER_SEC / 20 * 19)), 999);
        // 1 s before: n = 10
        assert_eq!(c.train_id_at(&Epochstamp::new(99, 0)), 989);
        assert_eq!(c.train_id_at(&Epochstamp::new(0, 0)), 0);
    }
}
