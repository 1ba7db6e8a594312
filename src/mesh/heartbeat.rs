//! Adaptive heartbeat pacing.
//!
//! The interval widens multiplicatively while peers answer (×1.5 after a
//! success streak) and halves on failure, clamped to `[min, max]`. The
//! emit loop lives in the adapter; this is the pure state machine.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AdaptiveHeartbeat {
    interval: Duration,
    min: Duration,
    max: Duration,
    success_streak: u32,
    failure_streak: u32,
    success_threshold: u32,
    failure_threshold: u32,
}

impl AdaptiveHeartbeat {
    pub fn new(
        initial: Duration,
        min: Duration,
        max: Duration,
        success_threshold: u32,
        failure_threshold: u32,
    ) -> Self {
        let min = min.min(max);
        Self {
            interval: initial.clamp(min, max),
            min,
            max,
            success_streak: 0,
            failure_streak: 0,
            success_threshold: success_threshold.max(1),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// A peer heartbeat arrived. Returns the new interval when the streak
    /// crossed the threshold and widened it.
    pub fn on_success(&mut self) -> Option<Duration> {
        self.success_streak += 1;
        self.failure_streak = 0;
        if self.success_streak >= self.success_threshold {
            self.success_streak = 0;
            self.interval = self.interval.mul_f64(1.5).min(self.max);
            return Some(self.interval);
        }
        None
    }

    /// A send failed or the event loop observed an error. Returns the new
    /// interval when the streak crossed the threshold and tightened it.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.failure_streak += 1;
        if self.failure_streak >= self.failure_threshold {
            self.failure_streak = 0;
            self.success_streak = 0;
            self.interval = self.interval.div_f64(2.0).max(self.min);
            return Some(self.interval);
        }
        None
    }

    /// Back to the initial pacing (used after an explicit reconnect).
    pub fn reset(&mut self, initial: Duration) {
        self.interval = initial.clamp(self.min, self.max);
        self.success_streak = 0;
        self.failure_streak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hb() -> AdaptiveHeartbeat {
        AdaptiveHeartbeat::new(
            Duration::from_secs(1),
            Duration::from_millis(200),
            Duration::from_secs(5),
            3,
            1,
        )
    }

    #[test]
    fn three_successes_widen_by_half() {
        let mut hb = hb();
        assert_eq!(hb.on_success(), None);
        assert_eq!(hb.on_success(), None);
        assert_eq!(hb.on_success(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn one_failure_halves() {
        let mut hb = hb();
        assert_eq!(hb.on_failure(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn interval_stays_within_bounds() {
        let mut hb = hb();
        for _ in 0..20 {
            hb.on_failure();
            assert!(hb.interval() >= Duration::from_millis(200));
        }
        assert_eq!(hb.interval(), Duration::from_millis(200));

        for _ in 0..60 {
            hb.on_success();
            assert!(hb.interval() <= Duration::from_secs(5));
        }
        assert_eq!(hb.interval(), Duration::from_secs(5));
    }

    #[test]
    fn failure_resets_success_streak() {
        let mut hb = hb();
        hb.on_success();
        hb.on_success();
        hb.on_failure();
        // Streak restarted: two more successes are not enough to widen.
        assert_eq!(hb.on_success(), None);
        assert_eq!(hb.on_success(), None);
        assert!(hb.on_success().is_some());
    }
}
