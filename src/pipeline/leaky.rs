//! Leaky-integrator trigger filter.
//!
//! Acts as an envelope detector for sharp movements: a sample whose magnitude exceeds
//! the resting level by more than `trigger_threshold` re-arms the output to `1.0`, but
//! only once the previous trigger has decayed below `REARM_LEVEL`. Every tick the
//! output decays geometrically by `damping`.

use tokio::time::{Duration, Instant};

use crate::hardware::protocol::AccelerometerSample;
use crate::pipeline::filter::{FilterOutput, MotionFilter};

/// Output must fall below this before another trigger is accepted.
const REARM_LEVEL: f64 = 0.01;

/// Parameters of a [`LeakyIntegratorFilter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakySettings {
    /// Tick interval
    pub update_period: Duration,
    /// Per-tick decay factor in `(0, 1]`.
    pub damping: f64,
    /// Magnitude of a ring at rest (~1 g), subtracted before thresholding.
    pub resting_level: f64,
    /// Excess magnitude that fires a trigger
    pub trigger_threshold: f64,
}

impl Default for LeakySettings {
    fn default() -> Self {
        Self {
            update_period: Duration::from_millis(50),
            damping: 0.9,
            resting_level: 500.0,
            trigger_threshold: 500.0,
        }
    }
}

/// Trigger envelope: a strong movement sets the value to 1.0, which then decays by
/// `damping` every tick.
#[derive(Debug)]
pub struct LeakyIntegratorFilter {
    settings: LeakySettings,
    value: f64,
}

impl LeakyIntegratorFilter {
    /// Filter at rest.
    pub fn new(settings: LeakySettings) -> Self {
        Self {
            settings,
            value: 0.0,
        }
    }

    /// Current envelope value without advancing time.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.value
    }
}

impl MotionFilter for LeakyIntegratorFilter {
    fn on_accelerometer_data(&mut self, sample: AccelerometerSample) {
        let excess = (sample.magnitude() - self.settings.resting_level).max(0.0);
        if excess > self.settings.trigger_threshold && self.value < REARM_LEVEL {
            self.value = 1.0;
        }
    }

    fn tick(&mut self, now: Instant) -> FilterOutput {
        self.value *= self.settings.damping;
        FilterOutput {
            value: self.value,
            timestamp: now,
        }
    }

    fn update_period(&self) -> Duration {
        self.settings.update_period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(z: i16) -> AccelerometerSample {
        AccelerometerSample {
            x: 0,
            y: 0,
            z,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn rest_does_not_trigger() {
        let mut filter = LeakyIntegratorFilter::new(LeakySettings::default());
        filter.on_accelerometer_data(sample(512));
        filter.on_accelerometer_data(sample(900));
        assert_eq!(filter.tick(Instant::now()).value, 0.0);
    }

    #[test]
    fn spike_triggers_and_decays() {
        let mut filter = LeakyIntegratorFilter::new(LeakySettings {
            damping: 0.5,
            ..LeakySettings::default()
        });
        filter.on_accelerometer_data(sample(2000));
        assert_eq!(filter.value(), 1.0);

        let now = Instant::now();
        assert!((filter.tick(now).value - 0.5).abs() < 1e-12);
        assert!((filter.tick(now).value - 0.25).abs() < 1e-12);
    }

    #[test]
    fn no_retrigger_until_decayed() {
        let mut filter = LeakyIntegratorFilter::new(LeakySettings {
            damping: 0.5,
            ..LeakySettings::default()
        });
        filter.on_accelerometer_data(sample(2000));
        filter.tick(Instant::now());
        filter.on_accelerometer_data(sample(2000));
        assert!((filter.value() - 0.5).abs() < 1e-12);

        for _ in 0..10 {
            filter.tick(Instant::now());
        }
        filter.on_accelerometer_data(sample(2000));
        assert_eq!(filter.value(), 1.0);
    }
}
