//! Idle sweeper.
//!
//! Drives `SessionTracker::check_idle` on a cadence. The live pipeline calls
//! `maybe_sweep` on every loop turn (including turns where no frame arrived);
//! replay calls `sweep` with each frame's timestamp before that frame is
//! classified, so idle closures are reported ahead of newly opened sessions.

use std::time::Duration;

use crate::tracker::{OutOfOrderTimestamp, SessionTracker};
use crate::{CompletedSession, Timestamp};

pub struct IdleSweeper {
    interval: Duration,
    last_sweep: Option<Timestamp>,
    sweeps: u64,
}

impl IdleSweeper {
    /// `interval` should be shorter than the idle timeout to bound end-of-session latency.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sweep: None,
            sweeps: 0,
        }
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        match self.last_sweep {
            Some(last) => now - last >= self.interval.as_secs_f64(),
            None => true,
        }
    }

    /// Sweep if the cadence interval has elapsed since the previous sweep.
    pub fn maybe_sweep(
        &mut self,
        tracker: &mut SessionTracker,
        now: Timestamp,
    ) -> Result<Vec<CompletedSession>, OutOfOrderTimestamp> {
        if !self.is_due(now) {
            return Ok(Vec::new());
        }
        self.sweep(tracker, now)
    }

    /// Sweep unconditionally.
    pub fn sweep(
        &mut self,
        tracker: &mut SessionTracker,
        now: Timestamp,
    ) -> Result<Vec<CompletedSession>, OutOfOrderTimestamp> {
        let completed = tracker.check_idle(now)?;
        self.last_sweep = Some(now);
        self.sweeps += 1;
        Ok(completed)
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps
    }

    /// Time until the next sweep is due, for use as a receive timeout.
    pub fn time_until_due(&self, now: Timestamp) -> Duration {
        match self.last_sweep {
            Some(last) => {
                let remaining = self.interval.as_secs_f64() - (now - last);
                Duration::from_secs_f64(remaining.max(0.0))
            }
            None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Activity, Observation};

    #[test]
    fn sweeps_on_cadence_only() {
        let mut tracker = SessionTracker::with_idle_timeout(Duration::from_secs(30));
        let mut sweeper = IdleSweeper::new(Duration::from_secs(10));

        assert!(sweeper.is_due(0.0));
        sweeper.maybe_sweep(&mut tracker, 0.0).unwrap();
        assert!(!sweeper.is_due(5.0));
        assert_eq!(sweeper.time_until_due(4.0), Duration::from_secs(6));
        sweeper.maybe_sweep(&mut tracker, 5.0).unwrap();
        assert_eq!(sweeper.sweeps(), 1);
        sweeper.maybe_sweep(&mut tracker, 10.0).unwrap();
        assert_eq!(sweeper.sweeps(), 2);
    }

    #[test]
    fn stalled_feed_still_closes_sessions() {
        let mut tracker = SessionTracker::with_idle_timeout(Duration::from_secs(30));
        let mut sweeper = IdleSweeper::new(Duration::from_secs(10));
        tracker
            .on_observation(&Observation::new(100.0).with("Mochi", Activity::Eating, "f"))
            .unwrap();

        // No further observations; only the periodic sweeps run.
        let mut closed = Vec::new();
        let mut now = 100.0;
        while now <= 200.0 {
            closed.extend(sweeper.maybe_sweep(&mut tracker, now).unwrap());
            now += 1.0;
        }
        assert_eq!(closed.len(), 1);
        assert!(closed[0].closed_at > 130.0 && closed[0].closed_at <= 141.0);
        assert_eq!(tracker.open_count(), 0);
    }
}
