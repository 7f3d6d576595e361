//! Timeouts and intervals for session channels.
//!
//! A zero `offline_timeout` or `alive_check_interval` disables the
//! corresponding timer.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Settings shared by both ends of a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    /// How long a session may stay without a bound line before it is dropped
    pub offline_timeout: Duration,
    /// How long `TimeWait` lingers before resolving to `Closed`
    pub time_wait_timeout: Duration,
    /// Idle time on a bound line before a ping is sent
    pub alive_check_interval: Duration,
    /// How long to wait for the ping reply before the line is presumed dead
    pub alive_check_wait_interval: Duration,
    /// Period of the driver's `update()` tick
    pub tick_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            offline_timeout: Duration::from_secs(20),
            time_wait_timeout: Duration::from_secs(1),
            alive_check_interval: Duration::from_secs(4),
            alive_check_wait_interval: Duration::from_secs(2),
            tick_interval: Duration::from_millis(100),
        }
    }
}

/// Rebind pacing, only used by the connecting side
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RebindLimits {
    /// Cap on a single rebind attempt before a fresh one is started
    pub rebind_timeout: Duration,
    /// Delay after a line loss before the next rebind attempt
    pub rebind_cooltime_timeout: Duration,
}

impl Default for RebindLimits {
    fn default() -> Self {
        Self {
            rebind_timeout: Duration::from_secs(2),
            rebind_cooltime_timeout: Duration::from_secs(1),
        }
    }
}

/// Client-side settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientSettings {
    /// Common session settings
    pub session: SessionSettings,
    /// Rebind pacing
    pub rebind: RebindLimits,
    /// Upper bound on the create handshake
    pub connect_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            rebind: RebindLimits::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Gateway settings
#[derive(Clone, Debug)]
pub struct GatewaySettings {
    /// Listen address
    pub listen: SocketAddr,
    /// Reject creates whose token was not issued by `open_binding`
    pub token_required: bool,
    /// Lifetime of an unused binding token
    pub token_timeout: Duration,
    /// Time allowed for the first packet on an accepted connection
    pub handshake_timeout: Duration,
    /// Settings for every session the gateway opens
    pub session: SessionSettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 5000)),
            token_required: false,
            token_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            session: SessionSettings::default(),
        }
    }
}
