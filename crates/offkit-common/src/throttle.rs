//! Rate-gating for repeated trigger sources.
//!
//! Several unrelated signals (connectivity restored, window focus,
//! visibility changes, a periodic timer) all want to kick off the same
//! underlying operation. [`Throttle`] collapses them into at most one firing
//! per minimum interval. It is frequency-gating only and carries no
//! correctness weight: a missed firing is picked up by the next trigger.
//!
//! Single-writer discipline: one owner calls [`Throttle::try_fire`]; wrap in
//! a mutex when the owner is shared across tasks.

use std::time::{Duration, Instant};

/// A last-fired timestamp plus a minimum re-fire interval.
#[derive(Debug, Clone)]
pub struct Throttle {
    /// Minimum wall-time between two accepted firings.
    min_interval: Duration,
    /// When the throttle last fired, if ever.
    last_fired: Option<Instant>,
}

impl Throttle {
    /// Create a throttle that fires at most once per `min_interval`.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_fired: None,
        }
    }

    /// The configured minimum interval.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Whether a firing at `now` would be accepted.
    pub fn ready_at(&self, now: Instant) -> bool {
        match self.last_fired {
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
            None => true,
        }
    }

    /// Attempt to fire at an explicit instant. Returns `true` and records the
    /// firing when the interval has elapsed, `false` otherwise.
    pub fn try_fire_at(&mut self, now: Instant) -> bool {
        if self.ready_at(now) {
            self.last_fired = Some(now);
            true
        } else {
            false
        }
    }

    /// Attempt to fire now.
    pub fn try_fire(&mut self) -> bool {
        self.try_fire_at(Instant::now())
    }

    /// Forget the last firing so the next trigger is accepted immediately.
    pub fn reset(&mut self) {
        self.last_fired = None;
    }
}
