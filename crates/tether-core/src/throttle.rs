//! Congestion-driven send-rate throttle.
//!
//! A two-state quality machine selects the sender tick rate: `Good` sends
//! at 40 Hz, `Bad` at 5 Hz. Latency above the threshold for `bad_hold`
//! demotes; latency back at or under the threshold for `good_hold`
//! promotes. To stop a flapping link from oscillating between the rates,
//! a demotion that arrives shortly after a promotion doubles `good_hold`
//! (up to a cap), and every promotion that sticks halves it back toward
//! the default.
//!
//! The machine is pure: time is passed in, no clocks are read.

use std::time::{Duration, Instant};

/// Coarse link-health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    /// Latency is acceptable; send at the full rate.
    Good,
    /// Latency is degraded; throttle the send rate.
    Bad,
}

/// Tuning knobs for the quality machine.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Latency above this value counts as degraded.
    pub latency_threshold: Duration,
    /// How long latency must stay above the threshold before demotion.
    pub bad_hold: Duration,
    /// How long latency must stay at or below the threshold before
    /// promotion. Doubled on oscillation, halved back on stability.
    pub good_hold: Duration,
    /// Upper bound for the dampened `good_hold`.
    pub max_hold: Duration,
    /// Interval between sent packages while `Good` (40 Hz).
    pub good_interval: Duration,
    /// Interval between sent packages while `Bad` (5 Hz).
    pub bad_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            latency_threshold: Duration::from_millis(250),
            bad_hold: Duration::from_secs(1),
            good_hold: Duration::from_secs(10),
            max_hold: Duration::from_secs(60),
            good_interval: Duration::from_millis(25),
            bad_interval: Duration::from_millis(200),
        }
    }
}

/// The quality state machine. Starts `Good`.
#[derive(Debug, Clone)]
pub struct Throttle {
    config: ThrottleConfig,
    quality: Quality,
    /// Current promotion hold, dampened between `good_hold` and `max_hold`.
    hold: Duration,
    /// Since when latency has been continuously above the threshold.
    above_since: Option<Instant>,
    /// Since when latency has been continuously at or below the threshold.
    below_since: Option<Instant>,
    last_promotion: Option<Instant>,
}

impl Throttle {
    /// Create a throttle in the `Good` state.
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        let hold = config.good_hold;
        Throttle {
            config,
            quality: Quality::Good,
            hold,
            above_since: None,
            below_since: None,
            last_promotion: None,
        }
    }

    /// Current link quality.
    #[must_use]
    pub fn quality(&self) -> Quality {
        self.quality
    }

    /// The send interval selected by the current quality.
    #[must_use]
    pub fn send_interval(&self) -> Duration {
        match self.quality {
            Quality::Good => self.config.good_interval,
            Quality::Bad => self.config.bad_interval,
        }
    }

    /// Feed a latency observation. Returns the new quality if a transition
    /// occurred.
    pub fn observe(&mut self, latency: Duration, now: Instant) -> Option<Quality> {
        let degraded = latency > self.config.latency_threshold;
        match self.quality {
            Quality::Good => {
                if !degraded {
                    self.above_since = None;
                    return None;
                }
                let since = *self.above_since.get_or_insert(now);
                if now.duration_since(since) < self.config.bad_hold {
                    return None;
                }
                // Demote. Flapping right after a promotion lengthens the
                // way back up.
                if self
                    .last_promotion
                    .is_some_and(|t| now.duration_since(t) < self.hold)
                {
                    self.hold = (self.hold * 2).min(self.config.max_hold);
                }
                self.quality = Quality::Bad;
                self.above_since = None;
                self.below_since = None;
                Some(Quality::Bad)
            }
            Quality::Bad => {
                if degraded {
                    self.below_since = None;
                    return None;
                }
                let since = *self.below_since.get_or_insert(now);
                if now.duration_since(since) < self.hold {
                    return None;
                }
                self.quality = Quality::Good;
                self.last_promotion = Some(now);
                self.below_since = None;
                self.above_since = None;
                self.hold = (self.hold / 2).max(self.config.good_hold);
                Some(Quality::Good)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn starts_good_at_full_rate() {
        let throttle = Throttle::new(ThrottleConfig::default());
        assert_eq!(throttle.quality(), Quality::Good);
        assert_eq!(throttle.send_interval(), ms(25));
    }

    #[test]
    fn brief_latency_spike_does_not_demote() {
        let mut throttle = Throttle::new(ThrottleConfig::default());
        let t0 = Instant::now();

        assert_eq!(throttle.observe(ms(500), t0), None);
        assert_eq!(throttle.observe(ms(500), t0 + ms(500)), None);
        // Back under the threshold before bad_hold elapsed.
        assert_eq!(throttle.observe(ms(50), t0 + ms(900)), None);
        assert_eq!(throttle.quality(), Quality::Good);
    }

    #[test]
    fn sustained_latency_demotes_after_bad_hold() {
        let mut throttle = Throttle::new(ThrottleConfig::default());
        let t0 = Instant::now();

        assert_eq!(throttle.observe(ms(500), t0), None);
        assert_eq!(throttle.observe(ms(500), t0 + secs(2)), Some(Quality::Bad));
        assert_eq!(throttle.send_interval(), ms(200));
    }

    #[test]
    fn recovery_promotes_after_good_hold() {
        let mut throttle = Throttle::new(ThrottleConfig::default());
        let t0 = Instant::now();

        throttle.observe(ms(500), t0);
        throttle.observe(ms(500), t0 + secs(2));
        assert_eq!(throttle.quality(), Quality::Bad);

        // Below threshold, but not yet for the full hold.
        assert_eq!(throttle.observe(ms(80), t0 + secs(3)), None);
        assert_eq!(throttle.observe(ms(80), t0 + secs(12)), None);
        // Eleven seconds below threshold since t0+3s.
        assert_eq!(
            throttle.observe(ms(80), t0 + secs(14)),
            Some(Quality::Good)
        );
        assert_eq!(throttle.send_interval(), ms(25));
    }

    #[test]
    fn latency_relapse_resets_the_promotion_clock() {
        let mut throttle = Throttle::new(ThrottleConfig::default());
        let t0 = Instant::now();

        throttle.observe(ms(500), t0);
        throttle.observe(ms(500), t0 + secs(2));

        throttle.observe(ms(80), t0 + secs(3));
        throttle.observe(ms(500), t0 + secs(8)); // relapse
        assert_eq!(throttle.observe(ms(80), t0 + secs(9)), None);
        // Only 6 s below threshold since the relapse.
        assert_eq!(throttle.observe(ms(80), t0 + secs(15)), None);
        assert_eq!(throttle.quality(), Quality::Bad);
    }

    #[test]
    fn flapping_doubles_the_promotion_hold() {
        let mut throttle = Throttle::new(ThrottleConfig::default());
        let t0 = Instant::now();

        // First demotion and recovery.
        throttle.observe(ms(500), t0);
        throttle.observe(ms(500), t0 + secs(2));
        throttle.observe(ms(80), t0 + secs(3));
        assert_eq!(
            throttle.observe(ms(80), t0 + secs(13)),
            Some(Quality::Good)
        );

        // Demote again right away: the hold doubles to 20 s.
        throttle.observe(ms(500), t0 + secs(14));
        assert_eq!(
            throttle.observe(ms(500), t0 + secs(16)),
            Some(Quality::Bad)
        );

        throttle.observe(ms(80), t0 + secs(17));
        // 15 s below threshold is no longer enough.
        assert_eq!(throttle.observe(ms(80), t0 + secs(32)), None);
        assert_eq!(
            throttle.observe(ms(80), t0 + secs(38)),
            Some(Quality::Good)
        );
    }
}
