use std::{
    num::NonZeroU64,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Seconds since the Unix epoch, as a float.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Progress of a training loop.
///
/// Counters never decrease over the lifetime of a loop. `date` is a wall-clock
/// timestamp in seconds since the Unix epoch and `start` is the date the loop began.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Elapsed {
    pub steps: u64,
    pub samples: u64,
    pub date: f64,
    pub start: f64,
}

impl Elapsed {
    /// Progress at the very beginning of a loop.
    pub fn create() -> Self {
        let date = now();
        Self {
            steps: 0,
            samples: 0,
            date,
            start: date,
        }
    }

    /// Returns the progress after one more step over `batch_size` samples.
    pub fn update(&self, batch_size: usize) -> Self {
        self.update_at(batch_size, now())
    }

    /// Like [`Elapsed::update`] with an explicit wall-clock date.
    pub fn update_at(&self, batch_size: usize, date: f64) -> Self {
        Self {
            steps: self.steps + 1,
            samples: self.samples + batch_size as u64,
            date: date.max(self.date),
            start: self.start,
        }
    }

    /// Wall-clock time since the loop began.
    pub fn time(&self) -> Duration {
        Duration::from_secs_f64((self.date - self.start).max(0.0))
    }

    /// True once any dimension set on `period` has been reached.
    pub fn reached(&self, period: &Period) -> bool {
        period.steps.is_some_and(|s| self.steps >= s.get())
            || period.samples.is_some_and(|s| self.samples >= s.get())
            || period.time.is_some_and(|t| self.time() >= t)
    }
}

/// A span of training progress: "N steps", "M samples" or "T of wall-clock time".
///
/// Several dimensions may be set; consumers decide how to combine them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Period {
    pub steps: Option<NonZeroU64>,
    pub samples: Option<NonZeroU64>,
    pub time: Option<Duration>,
}

impl Period {
    pub fn steps(steps: NonZeroU64) -> Self {
        Self {
            steps: Some(steps),
            ..Self::default()
        }
    }

    pub fn samples(samples: NonZeroU64) -> Self {
        Self {
            samples: Some(samples),
            ..Self::default()
        }
    }

    pub fn time(time: Duration) -> Self {
        Self {
            time: Some(time),
            ..Self::default()
        }
    }
}

/// The period ending at `steps` steps, for stopping a loop.
pub fn at(steps: NonZeroU64) -> Period {
    Period::steps(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_accumulates_steps_and_samples() {
        let e = Elapsed::create().update(32).update(16);
        assert_eq!(e.steps, 2);
        assert_eq!(e.samples, 48);
        assert!(e.date >= e.start);
    }

    #[test]
    fn reached_checks_any_dimension() {
        let e = Elapsed::create().update_at(10, 0.0);
        assert!(e.reached(&at(NonZeroU64::new(1).unwrap())));
        assert!(!e.reached(&Period::samples(NonZeroU64::new(11).unwrap())));
        assert!(e.reached(&Period::samples(NonZeroU64::new(10).unwrap())));
    }

    #[test]
    fn update_never_moves_date_backwards() {
        let e = Elapsed::create();
        let next = e.update_at(1, e.date - 100.0);
        assert_eq!(next.date, e.date);
    }
}
