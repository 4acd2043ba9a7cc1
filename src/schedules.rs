use std::{num::NonZeroU64, time::Duration};

use ml_core::{now, Elapsed, Period};

/// A periodic trigger for auxiliary loop actions such as logging or evaluation.
///
/// Exactly one dimension of the period drives an instance, chosen in the order
/// steps, samples, time; any other dimension set on the period is ignored.
///
/// * Steps: fires when `steps >= offset` and `(steps - offset)` is a multiple of the
///   period. Stateless, so the same `Elapsed` always gives the same answer.
/// * Samples: fires once at least `period` samples were seen since the last firing.
/// * Time: fires once at least `period` of wall-clock time passed since the last
///   firing, or since construction.
#[derive(Debug, Clone)]
pub struct Every {
    period: Period,
    steps_offset: u64,
    last_samples: u64,
    last_time: f64,
}

impl Every {
    /// Creates a trigger for `period`, counting steps from `steps_offset`.
    pub fn new(period: Period, steps_offset: u64) -> Self {
        Self {
            period,
            steps_offset,
            last_samples: 0,
            last_time: now(),
        }
    }

    pub fn steps(steps: NonZeroU64) -> Self {
        Self::new(Period::steps(steps), 0)
    }

    pub fn samples(samples: NonZeroU64) -> Self {
        Self::new(Period::samples(samples), 0)
    }

    pub fn time(time: Duration) -> Self {
        Self::new(Period::time(time), 0)
    }

    pub fn with_offset(mut self, steps_offset: u64) -> Self {
        self.steps_offset = steps_offset;
        self
    }

    /// Returns whether the action is due at `elapsed`.
    pub fn fire(&mut self, elapsed: &Elapsed) -> bool {
        if let Some(period) = self.period.steps {
            return elapsed.steps >= self.steps_offset
                && (elapsed.steps - self.steps_offset) % period.get() == 0;
        }

        if let Some(period) = self.period.samples {
            if elapsed.samples.saturating_sub(self.last_samples) >= period.get() {
                self.last_samples = elapsed.samples;
                return true;
            }
            return false;
        }

        if let Some(period) = self.period.time {
            if elapsed.date - self.last_time >= period.as_secs_f64() {
                self.last_time = elapsed.date;
                return true;
            }
        }

        false
    }
}

/// Shorthand for a step-based [`Every`].
pub fn every(steps: NonZeroU64) -> Every {
    Every::steps(steps)
}
