//! Monotonic time abstractions shared by firmware and host targets.

use core::ops::Add;
use core::time::Duration;

/// Instant type used for liveness windows and isolation deadlines.
pub trait ChargerInstant: Copy + Ord + Add<Duration, Output = Self> {
    /// Returns the saturating duration from `earlier` to `self`.
    fn saturating_duration_since(&self, earlier: Self) -> Duration;
}

/// Source of monotonic time for the charge logic.
pub trait Clock {
    type Instant: ChargerInstant;

    fn now(&self) -> Self::Instant;

    /// Called once per iteration of a deadline-bounded busy wait.
    fn relax(&self) {}
}

impl<C> Clock for &C
where
    C: Clock + ?Sized,
{
    type Instant = C::Instant;

    fn now(&self) -> Self::Instant {
        (**self).now()
    }

    fn relax(&self) {
        (**self).relax();
    }
}

/// Returns `true` when `stamp` was taken strictly less than `window` before `now`.
///
/// A missing stamp is never fresh.
pub fn is_fresh<I: ChargerInstant>(now: I, stamp: Option<I>, window: Duration) -> bool {
    stamp.is_some_and(|at| now.saturating_duration_since(at) < window)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct Millis(u64);

    impl Add<Duration> for Millis {
        type Output = Self;

        fn add(self, rhs: Duration) -> Self {
            Millis(self.0 + u64::try_from(rhs.as_millis()).unwrap())
        }
    }

    impl ChargerInstant for Millis {
        fn saturating_duration_since(&self, earlier: Self) -> Duration {
            Duration::from_millis(self.0.saturating_sub(earlier.0))
        }
    }

    #[test]
    fn missing_stamp_is_stale() {
        assert!(!is_fresh(Millis(0), None, Duration::from_secs(1)));
    }

    #[test]
    fn window_upper_bound_is_exclusive() {
        let window = Duration::from_millis(2500);
        assert!(is_fresh(Millis(2499), Some(Millis(0)), window));
        assert!(!is_fresh(Millis(2500), Some(Millis(0)), window));
    }

    #[test]
    fn stamp_from_the_future_counts_as_fresh() {
        assert!(is_fresh(Millis(10), Some(Millis(20)), Duration::from_millis(1)));
    }
}
