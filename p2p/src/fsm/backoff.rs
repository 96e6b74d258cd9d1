//! Exponential backoff, used both per-address and fleet-wide.
use spv_common::block::time::LocalDuration;

/// An exponential backoff schedule. Each failure multiplies the current delay
/// by `multiplier`, capped at `max`; a success resets it to `initial`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: LocalDuration,
    multiplier: f64,
    max: LocalDuration,
    current: LocalDuration,
}

impl Backoff {
    /// Create a new backoff schedule.
    pub fn new(initial: LocalDuration, multiplier: f64, max: LocalDuration) -> Self {
        Self {
            initial,
            multiplier,
            max,
            current: initial,
        }
    }

    /// Backoff schedule used for individual peer addresses: `(1s, 1.5, 10m)`.
    pub fn peer() -> Self {
        Self::new(
            LocalDuration::from_secs(1),
            1.5,
            LocalDuration::from_mins(10),
        )
    }

    /// Backoff schedule used for fleet-wide (discovery) retries: `(1s, 1.5, 10s)`.
    pub fn group() -> Self {
        Self::new(
            LocalDuration::from_secs(1),
            1.5,
            LocalDuration::from_secs(10),
        )
    }

    /// The delay to wait before the next attempt.
    pub fn delay(&self) -> LocalDuration {
        self.current
    }

    /// Record a success, resetting the delay to its initial value.
    pub fn succeed(&mut self) {
        self.current = self.initial;
    }

    /// Record a failure, multiplying the current delay, capped at `max`.
    pub fn fail(&mut self) {
        let next = (self.current.as_millis() as f64) * self.multiplier;
        let next = LocalDuration::from_millis(next as u64);
        self.current = next.min(self.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_resets() {
        let mut b = Backoff::peer();
        let initial = b.delay();

        b.fail();
        assert!(b.delay() > initial);

        b.fail();
        b.fail();
        b.fail();
        b.fail();
        b.fail();
        b.fail();
        b.fail();
        b.fail();
        b.fail();
        b.fail();
        assert_eq!(b.delay(), LocalDuration::from_mins(10));

        b.succeed();
        assert_eq!(b.delay(), initial);
    }
}
