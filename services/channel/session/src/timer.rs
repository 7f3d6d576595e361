//! Tick-driven elapsed-time timers.

use std::time::Duration;

/// Time elapsed since a timer was started, advanced by the owner's tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Timer {
    /// Not running
    #[default]
    Inactive,
    /// Running for the given duration
    Elapsed(Duration),
}

impl Timer {
    /// Restart from zero
    pub fn start(&mut self) {
        *self = Timer::Elapsed(Duration::ZERO);
    }

    /// Start only if not already running
    pub fn ensure_started(&mut self) {
        if !self.is_active() {
            self.start();
        }
    }

    /// Stop the timer
    pub fn stop(&mut self) {
        *self = Timer::Inactive;
    }

    /// Whether the timer is running
    pub fn is_active(&self) -> bool {
        matches!(self, Timer::Elapsed(_))
    }

    /// Add `elapsed` to a running timer
    pub fn advance(&mut self, elapsed: Duration) {
        if let Timer::Elapsed(total) = self {
            *total = total.saturating_add(elapsed);
        }
    }

    /// Whether a running timer has reached `limit`
    pub fn reached(&self, limit: Duration) -> bool {
        match self {
            Timer::Elapsed(total) => *total >= limit,
            Timer::Inactive => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_timer_never_fires() {
        let mut timer = Timer::default();
        timer.advance(Duration::from_secs(100));
        assert_eq!(timer, Timer::Inactive);
        assert!(!timer.reached(Duration::ZERO));
    }

    #[test]
    fn test_timer_accumulates() {
        let mut timer = Timer::Inactive;
        timer.start();
        timer.advance(Duration::from_millis(600));
        assert!(!timer.reached(Duration::from_secs(1)));
        timer.advance(Duration::from_millis(400));
        assert!(timer.reached(Duration::from_secs(1)));

        timer.ensure_started();
        assert!(timer.reached(Duration::from_secs(1)));
        timer.start();
        assert_eq!(timer, Timer::Elapsed(Duration::ZERO));
    }
}
