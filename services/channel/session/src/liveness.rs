//! Offline, rebind, alive-check and time-wait timers.
//!
//! [`Liveness::tick`] advances every running timer and reports what is due.
//! The session decides how to act on each [`LivenessEvent`].

use crate::settings::{RebindLimits, SessionSettings};
use crate::timer::Timer;
use smallvec::SmallVec;
use std::time::Duration;
use tracing::trace;

/// Something the tick found due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// No line was bound within the offline timeout
    OfflineExpired,
    /// Start a new rebind attempt
    RebindDue,
    /// Send an alive-check probe
    SendPing,
    /// The probe went unanswered
    AliveWaitExpired,
    /// TimeWait lingered long enough
    TimeWaitExpired,
}

/// Timer set for one session
#[derive(Debug)]
pub struct Liveness {
    settings: SessionSettings,
    rebind_limits: Option<RebindLimits>,
    offline: Timer,
    rebind: Timer,
    rebind_cooltime: Timer,
    alive_check: Timer,
    alive_wait: Timer,
    time_wait: Timer,
}

impl Liveness {
    /// Timers for a session; `rebind_limits` is only given to the connecting side
    pub fn new(settings: SessionSettings, rebind_limits: Option<RebindLimits>) -> Self {
        Self {
            settings,
            rebind_limits,
            offline: Timer::Inactive,
            rebind: Timer::Inactive,
            rebind_cooltime: Timer::Inactive,
            alive_check: Timer::Inactive,
            alive_wait: Timer::Inactive,
            time_wait: Timer::Inactive,
        }
    }

    /// Settings in use
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// A line became current
    pub fn line_bound(&mut self) {
        self.offline.stop();
        self.rebind.stop();
        self.rebind_cooltime.stop();
        self.alive_wait.stop();
        if self.settings.alive_check_interval.is_zero() {
            self.alive_check.stop();
        } else {
            self.alive_check.start();
        }
    }

    /// The current line was lost
    pub fn line_lost(&mut self) {
        if !self.settings.offline_timeout.is_zero() {
            self.offline.ensure_started();
        }
        self.alive_check.stop();
        self.alive_wait.stop();
        if self.rebind_limits.is_some() {
            self.rebind.stop();
            self.rebind_cooltime.start();
        }
    }

    /// A rebind attempt was started
    pub fn rebind_started(&mut self) {
        self.rebind.start();
        self.rebind_cooltime.stop();
    }

    /// The rebinding line closed without binding
    pub fn rebind_failed(&mut self) {
        self.rebind.stop();
        self.rebind_cooltime.start();
    }

    /// A matching PONG arrived
    pub fn alive_confirmed(&mut self) {
        if self.alive_wait.is_active() {
            self.alive_wait.stop();
            self.alive_check.start();
        }
    }

    /// Whether a probe is awaiting its reply
    pub fn awaiting_pong(&self) -> bool {
        self.alive_wait.is_active()
    }

    /// Close state entered TimeWait
    pub fn time_wait_entered(&mut self) {
        self.time_wait.ensure_started();
    }

    /// Stop every timer
    pub fn stop_all(&mut self) {
        self.offline.stop();
        self.rebind.stop();
        self.rebind_cooltime.stop();
        self.alive_check.stop();
        self.alive_wait.stop();
        self.time_wait.stop();
    }

    /// Advance all timers by `elapsed` and report what became due.
    ///
    /// Offline expiry and a due rebind end the tick early.
    pub fn tick(&mut self, elapsed: Duration) -> SmallVec<[LivenessEvent; 2]> {
        let mut due = SmallVec::new();

        self.offline.advance(elapsed);
        if self.offline.reached(self.settings.offline_timeout) {
            trace!(timeout = ?self.settings.offline_timeout, "Offline timed out");
            self.offline.stop();
            due.push(LivenessEvent::OfflineExpired);
            return due;
        }

        if let Some(limits) = self.rebind_limits {
            self.rebind.advance(elapsed);
            self.rebind_cooltime.advance(elapsed);
            if self.rebind.reached(limits.rebind_timeout)
                || self.rebind_cooltime.reached(limits.rebind_cooltime_timeout)
            {
                trace!(rebind = ?self.rebind, cooltime = ?self.rebind_cooltime, "Rebind due");
                self.rebind_started();
                due.push(LivenessEvent::RebindDue);
                return due;
            }
        }

        if self.alive_check.is_active() {
            self.alive_check.advance(elapsed);
            if self.alive_check.reached(self.settings.alive_check_interval) {
                self.alive_check.stop();
                self.alive_wait.start();
                due.push(LivenessEvent::SendPing);
            }
        } else if self.alive_wait.is_active() {
            self.alive_wait.advance(elapsed);
            if self.alive_wait.reached(self.settings.alive_check_wait_interval) {
                self.alive_wait.stop();
                due.push(LivenessEvent::AliveWaitExpired);
            }
        }

        self.time_wait.advance(elapsed);
        if self.time_wait.reached(self.settings.time_wait_timeout) {
            self.time_wait.stop();
            due.push(LivenessEvent::TimeWaitExpired);
        }

        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Liveness {
        Liveness::new(SessionSettings::default(), Some(RebindLimits::default()))
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_alive_check_then_wait() {
        let mut l = client();
        l.line_bound();

        assert!(l.tick(ms(3_900)).is_empty());
        assert_eq!(l.tick(ms(100)).as_slice(), &[LivenessEvent::SendPing]);
        assert!(l.awaiting_pong());

        assert!(l.tick(ms(1_900)).is_empty());
        assert_eq!(l.tick(ms(100)).as_slice(), &[LivenessEvent::AliveWaitExpired]);
        assert!(!l.awaiting_pong());
    }

    #[test]
    fn test_pong_restarts_alive_check() {
        let mut l = client();
        l.line_bound();
        l.tick(ms(4_000));
        l.alive_confirmed();
        assert!(!l.awaiting_pong());

        // A full interval has to pass again before the next probe
        assert!(l.tick(ms(3_000)).is_empty());
        assert_eq!(l.tick(ms(1_000)).as_slice(), &[LivenessEvent::SendPing]);
    }

    #[test]
    fn test_rebind_after_cooltime() {
        let mut l = client();
        l.line_bound();
        l.line_lost();

        assert!(l.tick(ms(900)).is_empty());
        assert_eq!(l.tick(ms(100)).as_slice(), &[LivenessEvent::RebindDue]);

        // Attempt runs for the rebind timeout before another is started
        assert!(l.tick(ms(1_900)).is_empty());
        assert_eq!(l.tick(ms(100)).as_slice(), &[LivenessEvent::RebindDue]);

        // A failed attempt waits for the cooltime again
        l.rebind_failed();
        assert!(l.tick(ms(500)).is_empty());
        assert_eq!(l.tick(ms(500)).as_slice(), &[LivenessEvent::RebindDue]);
    }

    #[test]
    fn test_offline_timeout_wins() {
        let mut l = client();
        l.line_bound();
        l.line_lost();
        l.rebind_started();

        let mut fired = Vec::new();
        for _ in 0..200 {
            fired.extend(l.tick(ms(100)));
            if fired.contains(&LivenessEvent::OfflineExpired) {
                break;
            }
            if fired.last() == Some(&LivenessEvent::RebindDue) {
                l.rebind_failed();
            }
        }
        assert_eq!(fired.last(), Some(&LivenessEvent::OfflineExpired));
    }

    #[test]
    fn test_responder_never_rebinds() {
        let mut l = Liveness::new(SessionSettings::default(), None);
        l.line_bound();
        l.line_lost();
        for _ in 0..10 {
            assert!(l.tick(ms(1_000)).is_empty());
        }
        assert_eq!(l.tick(ms(10_000)).as_slice(), &[LivenessEvent::OfflineExpired]);
    }

    #[test]
    fn test_time_wait_expiry() {
        let mut l = Liveness::new(SessionSettings::default(), None);
        l.time_wait_entered();
        assert!(l.tick(ms(500)).is_empty());
        assert_eq!(l.tick(ms(500)).as_slice(), &[LivenessEvent::TimeWaitExpired]);
        assert!(l.tick(ms(5_000)).is_empty());
    }
}
