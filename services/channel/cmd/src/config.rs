//! Configuration for the channel binary.
//!
//! Values come from an optional YAML file, then `CHANNEL_*` environment
//! variables, then command-line flags. Durations are humantime strings
//! such as `"20s"` or `"500ms"`.

use anyhow::{Context, Result};
use channel_session::{ClientSettings, GatewaySettings, RebindLimits, SessionSettings};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Channel service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Gateway listener and token settings
    pub gateway: GatewayConfig,
    /// Timers shared by both ends
    pub session: SessionConfig,
    /// Client-only timers
    pub client: ClientConfig,
}

/// `gateway:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address
    pub listen: SocketAddr,
    /// Reject creates without an issued binding token
    pub token_required: bool,
    /// Lifetime of an unused binding token
    #[serde(with = "duration_str")]
    pub token_timeout: Duration,
    /// Time allowed for the first packet of a connection
    #[serde(with = "duration_str")]
    pub handshake_timeout: Duration,
}

/// `session:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time without a bound line before the session is dropped
    #[serde(with = "duration_str")]
    pub offline_timeout: Duration,
    /// TimeWait linger
    #[serde(with = "duration_str")]
    pub time_wait_timeout: Duration,
    /// Idle time before a ping
    #[serde(with = "duration_str")]
    pub alive_check_interval: Duration,
    /// Wait for the ping reply
    #[serde(with = "duration_str")]
    pub alive_check_wait_interval: Duration,
    /// Timer tick
    #[serde(with = "duration_str")]
    pub tick_interval: Duration,
}

/// `client:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Cap on one rebind attempt
    #[serde(with = "duration_str")]
    pub rebind_timeout: Duration,
    /// Delay before the next rebind attempt
    #[serde(with = "duration_str")]
    pub rebind_cooltime_timeout: Duration,
    /// Upper bound on the create handshake
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let defaults = GatewaySettings::default();
        Self {
            listen: defaults.listen,
            token_required: defaults.token_required,
            token_timeout: defaults.token_timeout,
            handshake_timeout: defaults.handshake_timeout,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let defaults = SessionSettings::default();
        Self {
            offline_timeout: defaults.offline_timeout,
            time_wait_timeout: defaults.time_wait_timeout,
            alive_check_interval: defaults.alive_check_interval,
            alive_check_wait_interval: defaults.alive_check_wait_interval,
            tick_interval: defaults.tick_interval,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        let defaults = ClientSettings::default();
        Self {
            rebind_timeout: defaults.rebind.rebind_timeout,
            rebind_cooltime_timeout: defaults.rebind.rebind_cooltime_timeout,
            connect_timeout: defaults.connect_timeout,
        }
    }
}

impl ChannelConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = serde_yaml::from_str::<ChannelConfig>(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;

        info!(
            "Final channel configuration: listen={}, token_required={}, offline_timeout={:?}, alive_check_interval={:?}",
            config.gateway.listen,
            config.gateway.token_required,
            config.session.offline_timeout,
            config.session.alive_check_interval
        );
        Ok(config)
    }

    /// Apply `CHANNEL_*` overrides looked up through `lookup`
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup("CHANNEL_LISTEN") {
            self.gateway.listen = listen
                .parse()
                .with_context(|| format!("invalid CHANNEL_LISTEN {:?}", listen))?;
            info!("Listen address overridden by environment: {}", self.gateway.listen);
        }

        if let Some(required) = lookup("CHANNEL_TOKEN_REQUIRED") {
            self.gateway.token_required = required.eq_ignore_ascii_case("true");
            info!("Token requirement overridden by environment: {}", self.gateway.token_required);
        }

        let durations: [(&str, &mut Duration); 5] = [
            ("CHANNEL_OFFLINE_TIMEOUT", &mut self.session.offline_timeout),
            ("CHANNEL_ALIVE_CHECK_INTERVAL", &mut self.session.alive_check_interval),
            ("CHANNEL_TICK_INTERVAL", &mut self.session.tick_interval),
            ("CHANNEL_TOKEN_TIMEOUT", &mut self.gateway.token_timeout),
            ("CHANNEL_CONNECT_TIMEOUT", &mut self.client.connect_timeout),
        ];
        for (key, slot) in durations {
            if let Some(value) = lookup(key) {
                *slot = humantime::parse_duration(&value)
                    .with_context(|| format!("invalid {} {:?}", key, value))?;
                info!("{} overridden by environment: {:?}", key, slot);
            }
        }

        Ok(())
    }

    /// Session timers
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            offline_timeout: self.session.offline_timeout,
            time_wait_timeout: self.session.time_wait_timeout,
            alive_check_interval: self.session.alive_check_interval,
            alive_check_wait_interval: self.session.alive_check_wait_interval,
            tick_interval: self.session.tick_interval,
        }
    }

    /// Settings for `serve`
    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            listen: self.gateway.listen,
            token_required: self.gateway.token_required,
            token_timeout: self.gateway.token_timeout,
            handshake_timeout: self.gateway.handshake_timeout,
            session: self.session_settings(),
        }
    }

    /// Settings for `connect`
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            session: self.session_settings(),
            rebind: RebindLimits {
                rebind_timeout: self.client.rebind_timeout,
                rebind_cooltime_timeout: self.client.rebind_cooltime_timeout,
            },
            connect_timeout: self.client.connect_timeout,
        }
    }
}

/// Serde adapter for humantime duration strings
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
