//! [`TimeTracker`] definition and implementation.

use std::time::{Duration, Instant};

/// Deadline arithmetic with first-class zero/infinite sentinels.
///
/// All blocking waits in this crate carry a `TimeTracker` rather than a raw
/// `Duration` so that a deadline computed once at the top of a call can be
/// propagated through nested waits (gate entry, buffer wait, broker round
/// trip) without re-deriving "how long is left" at each level and without
/// losing precision to repeated `Instant::now()` calls.
#[derive(Debug, Clone, Copy)]
pub struct TimeTracker {
    /// `None` means "wait indefinitely". `Some(deadline)` is an absolute
    /// instant; `Some(deadline) <= now` at construction time means "do not
    /// block" (the `ZERO` sentinel).
    deadline: Option<Instant>,
}

impl TimeTracker {
    /// A tracker that never expires.
    #[must_use]
    pub const fn infinite() -> Self {
        Self { deadline: None }
    }

    /// A tracker expiring `duration` from now. A zero `duration` is
    /// equivalent to [`Self::ZERO`].
    #[must_use]
    pub fn from_duration(duration: Duration) -> Self {
        if duration.is_zero() {
            return Self::zero();
        }
        Self {
            deadline: Instant::now().checked_add(duration),
        }
    }

    /// A tracker that has already expired: the "do not block at all"
    /// sentinel.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            deadline: Some(Instant::now()),
        }
    }

    /// `true` if this tracker demands "do not block at all".
    #[must_use]
    pub fn is_zero(&self) -> bool {
        matches!(self.deadline, Some(deadline) if deadline <= Instant::now())
    }

    /// `true` if this tracker never expires.
    #[must_use]
    pub const fn is_infinite(&self) -> bool {
        self.deadline.is_none()
    }

    /// Time remaining until the deadline, saturating at zero. `None` means
    /// infinite remaining time.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        match self.deadline {
            None => None,
            Some(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
        }
    }

    /// `true` if the deadline has passed. Always `false` for an infinite
    /// tracker.
    #[must_use]
    pub fn timed_out(&self) -> bool {
        match self.deadline {
            None => false,
            Some(deadline) => Instant::now() >= deadline,
        }
    }

    /// The absolute deadline instant, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl From<Duration> for TimeTracker {
    fn from(duration: Duration) -> Self {
        Self::from_duration(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn zero_is_zero_and_timed_out() {
        let t = TimeTracker::zero();
        assert!(t.is_zero());
        assert!(t.timed_out());
        assert_eq!(t.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn infinite_never_times_out() {
        let t = TimeTracker::infinite();
        assert!(!t.is_zero());
        assert!(!t.timed_out());
        assert_eq!(t.remaining(), None);
        assert!(t.is_infinite());
    }

    #[test]
    fn from_duration_counts_down() {
        let t = TimeTracker::from_duration(Duration::from_millis(50));
        assert!(!t.timed_out());
        thread::sleep(Duration::from_millis(80));
        assert!(t.timed_out());
        assert_eq!(t.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn zero_duration_matches_zero_sentinel() {
        let t = TimeTracker::from_duration(Duration::ZERO);
        assert!(t.is_zero());
    }
}
