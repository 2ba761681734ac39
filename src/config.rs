//! Relay configuration, read from environment variables:
//!
//! - `NIMBUS_BIND_ADDR`                (IPv4 or IPv6 address, default: "0.0.0.0")
//! - `NIMBUS_PLAYER_PORT`              (default: 8000)
//! - `NIMBUS_STREAMER_PORT`            (default: 8888)
//! - `NIMBUS_PEER_CONNECTION_OPTIONS`  (JSON object, default: `{}`)
//! - `NIMBUS_STREAMER_POLICY`          (`replace` or `reject`, default: `replace`)
//! - `NIMBUS_PING_INTERVAL_SECS`       (default: 30)
//! - `NIMBUS_PONG_TIMEOUT_SECS`        (default: 10)

use std::env;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::signaling::{DEFAULT_PLAYER_PORT, DEFAULT_STREAMER_PORT};

const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
const DEFAULT_PONG_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// What to do when a streamer connects while another one holds the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamerPolicy {
    /// Close the old streamer, disconnect its players, install the new one.
    #[default]
    Replace,
    /// Refuse the new streamer with "try again later".
    Reject,
}

impl FromStr for StreamerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "reject" => Ok(Self::Reject),
            other => Err(format!("expected `replace` or `reject`, got `{}`", other)),
        }
    }
}

impl fmt::Display for StreamerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replace => f.write_str("replace"),
            Self::Reject => f.write_str("reject"),
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Interface both listeners bind to.
    pub bind_addr: IpAddr,

    pub player_port: u16,

    pub streamer_port: u16,

    /// Sent to every peer in the `config` message (ICE servers etc).
    pub peer_connection_options: Value,

    pub streamer_policy: StreamerPolicy,

    /// WebSocket ping period for liveness checks.
    pub ping_interval: Duration,

    /// How long to wait for a pong before dropping the connection.
    pub pong_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            player_port: DEFAULT_PLAYER_PORT,
            streamer_port: DEFAULT_STREAMER_PORT,
            peer_connection_options: Value::Object(Default::default()),
            streamer_policy: StreamerPolicy::default(),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            pong_timeout: Duration::from_secs(DEFAULT_PONG_TIMEOUT_SECS),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, falling back to defaults
    /// for missing keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let bind_addr = read_or_default(&lookup, "NIMBUS_BIND_ADDR", defaults.bind_addr)?;
        let player_port = read_or_default(&lookup, "NIMBUS_PLAYER_PORT", defaults.player_port)?;
        let streamer_port =
            read_or_default(&lookup, "NIMBUS_STREAMER_PORT", defaults.streamer_port)?;
        let streamer_policy =
            read_or_default(&lookup, "NIMBUS_STREAMER_POLICY", defaults.streamer_policy)?;
        let ping_interval = read_or_default(
            &lookup,
            "NIMBUS_PING_INTERVAL_SECS",
            DEFAULT_PING_INTERVAL_SECS,
        )?;
        let pong_timeout =
            read_or_default(&lookup, "NIMBUS_PONG_TIMEOUT_SECS", DEFAULT_PONG_TIMEOUT_SECS)?;

        let peer_connection_options = match lookup("NIMBUS_PEER_CONNECTION_OPTIONS") {
            Some(raw) => parse_peer_connection_options(&raw)?,
            None => defaults.peer_connection_options,
        };

        if ping_interval == 0 {
            return Err(ConfigError::Invalid {
                key: "NIMBUS_PING_INTERVAL_SECS",
                value: ping_interval.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Config {
            bind_addr,
            player_port,
            streamer_port,
            peer_connection_options,
            streamer_policy,
            ping_interval: Duration::from_secs(ping_interval),
            pong_timeout: Duration::from_secs(pong_timeout),
        })
    }

    pub fn player_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.player_port)
    }

    pub fn streamer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.streamer_port)
    }
}

fn parse_peer_connection_options(raw: &str) -> Result<Value, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        key: "NIMBUS_PEER_CONNECTION_OPTIONS",
        value: raw.to_string(),
        reason,
    };
    let value: Value = serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;
    if !value.is_object() {
        return Err(invalid("expected a JSON object".to_string()));
    }
    Ok(value)
}

fn read_or_default<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(val) => val.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: val.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}
