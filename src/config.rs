//! Server configuration parsed from environment variables.
//!
//! Every knob has a default; unparsable values fall back to it, except for
//! values that would leave the realtime layer unable to work (zero-sized
//! buffers, a heartbeat timeout shorter than the ping interval), which are
//! rejected at startup.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 45;
pub const DEFAULT_PRESENCE_STALE_SECS: u64 = 60;
pub const DEFAULT_PRESENCE_SWEEP_INTERVAL_SECS: u64 = 30;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0}")]
    Inconsistent(String),
}

/// Tuning knobs for connections, heartbeats and presence decay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// Per-connection outbound queue capacity. A full queue evicts the connection.
    pub outbound_buffer: usize,
    /// Upper bound on a single socket write.
    pub write_timeout: Duration,
    /// How often the server pings each connection.
    pub heartbeat_interval: Duration,
    /// Inbound silence after which a connection is dropped.
    pub heartbeat_timeout: Duration,
    /// Presence records idle for longer than this are swept.
    pub presence_stale: Duration,
    /// Sweep period.
    pub sweep_interval: Duration,
    /// Push a `board_snapshot` to each connection right after it joins.
    pub snapshot_on_join: bool,
    /// Follow task mutations with rendered `htmx_update` fragments.
    pub htmx_fragments: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            presence_stale: Duration::from_secs(DEFAULT_PRESENCE_STALE_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_PRESENCE_SWEEP_INTERVAL_SECS),
            snapshot_on_join: true,
            htmx_fragments: false,
        }
    }
}

impl RealtimeConfig {
    /// Build from environment variables:
    /// - `WS_OUTBOUND_BUFFER` (default 256)
    /// - `WS_WRITE_TIMEOUT_MS` (default 5000)
    /// - `WS_HEARTBEAT_INTERVAL_SECS` (default 15)
    /// - `WS_HEARTBEAT_TIMEOUT_SECS` (default 45)
    /// - `PRESENCE_STALE_SECS` (default 60)
    /// - `PRESENCE_SWEEP_INTERVAL_SECS` (default 30)
    /// - `SNAPSHOT_ON_JOIN` (default true)
    /// - `HTMX_FRAGMENTS` (default false)
    ///
    /// # Errors
    ///
    /// Returns `Inconsistent` when the parsed values cannot work together.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            outbound_buffer: env_parse("WS_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER),
            write_timeout: Duration::from_millis(env_parse("WS_WRITE_TIMEOUT_MS", DEFAULT_WRITE_TIMEOUT_MS)),
            heartbeat_interval: Duration::from_secs(env_parse(
                "WS_HEARTBEAT_INTERVAL_SECS",
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
            )),
            heartbeat_timeout: Duration::from_secs(env_parse("WS_HEARTBEAT_TIMEOUT_SECS", DEFAULT_HEARTBEAT_TIMEOUT_SECS)),
            presence_stale: Duration::from_secs(env_parse("PRESENCE_STALE_SECS", DEFAULT_PRESENCE_STALE_SECS)),
            sweep_interval: Duration::from_secs(env_parse(
                "PRESENCE_SWEEP_INTERVAL_SECS",
                DEFAULT_PRESENCE_SWEEP_INTERVAL_SECS,
            )),
            snapshot_on_join: env_bool("SNAPSHOT_ON_JOIN").unwrap_or(true),
            htmx_fragments: env_bool("HTMX_FRAGMENTS").unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `Inconsistent` for a zero buffer, zero intervals, or a heartbeat
    /// timeout that does not exceed the ping interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_buffer == 0 {
            return Err(ConfigError::Inconsistent("WS_OUTBOUND_BUFFER must be at least 1".into()));
        }
        if self.heartbeat_interval.is_zero() || self.sweep_interval.is_zero() || self.write_timeout.is_zero() {
            return Err(ConfigError::Inconsistent("intervals and timeouts must be non-zero".into()));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::Inconsistent(
                "WS_HEARTBEAT_TIMEOUT_SECS must exceed WS_HEARTBEAT_INTERVAL_SECS".into(),
            ));
        }
        Ok(())
    }
}

/// Process-level settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// `None` runs against the in-memory stores.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub port: u16,
    pub realtime: RealtimeConfig,
}

impl ServerConfig {
    /// # Errors
    ///
    /// Returns `InvalidValue` for an unparsable `PORT`, or any realtime
    /// validation error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidValue { key: "PORT", value: raw })?,
            Err(_) => DEFAULT_PORT,
        };
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            port,
            realtime: RealtimeConfig::from_env()?,
        })
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|raw| parse_bool(&raw))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
