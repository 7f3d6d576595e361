//! Keepalive probes with PING/PONG ticks and smoothed RTT.
//!
//! A probe carries the sender's clock in milliseconds; the peer echoes it
//! back unchanged, so the round trip is measured entirely on one clock.

use once_cell::sync::Lazy;
use std::time::{Duration, Instant};
use tracing::trace;

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since process start, truncated to `u32`
pub fn now_ticks() -> u32 {
    START.elapsed().as_millis() as u32
}

/// Round trip from probe ticks to `now`, tolerant of `u32` wraparound
pub fn rtt_from_ticks(sent: u32, now: u32) -> Duration {
    Duration::from_millis(now.wrapping_sub(sent) as u64)
}

/// Fold `sample` into `old` with a 12.5% weight
pub fn smooth_rtt(old: Duration, sample: Duration) -> Duration {
    let nanos = (old.as_nanos() * 875 + sample.as_nanos() * 125) / 1000;
    Duration::from_nanos(nanos as u64)
}

/// Outstanding probe and RTT estimate for one session
#[derive(Debug, Default)]
pub struct Keepalive {
    /// Ticks of the probe awaiting its reply
    outstanding: Option<u32>,
    /// Smoothed round-trip time
    srtt: Option<Duration>,
}

impl Keepalive {
    /// Record a probe being sent
    pub fn record_ping(&mut self, ticks: u32) {
        self.outstanding = Some(ticks);
    }

    /// Forget any outstanding probe
    pub fn clear(&mut self) {
        self.outstanding = None;
    }

    /// Process a reply; returns the updated SRTT when `ticks` match the probe
    pub fn process_pong(&mut self, ticks: u32, now: u32) -> Option<Duration> {
        if self.outstanding != Some(ticks) {
            trace!(ticks, outstanding = ?self.outstanding, "Ignoring unmatched PONG");
            return None;
        }
        self.outstanding = None;

        let sample = rtt_from_ticks(ticks, now);
        let srtt = match self.srtt {
            Some(old) => smooth_rtt(old, sample),
            None => sample,
        };
        self.srtt = Some(srtt);
        trace!(?sample, ?srtt, "RTT updated");
        Some(srtt)
    }

    /// Current smoothed RTT, if any probe has completed
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }
}
