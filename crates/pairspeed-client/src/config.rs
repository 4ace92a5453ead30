//! Client settings, read from `PAIRSPEED_*` environment variables.

use std::time::Duration;

use crate::latency::DEFAULT_PROBE_PERIOD;
use crate::throughput::{CHUNK_SIZE, REPORT_INTERVAL};

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080/signal";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name}: {value:?} is not a valid number")]
    InvalidNumber { name: &'static str, value: String },

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
}

/// Configuration for one measurement session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub relay_url: String,
    pub probe_period: Duration,
    pub report_interval: Duration,
    pub chunk_size: usize,
    /// Bound on each relay request; `None` waits indefinitely.
    pub relay_timeout: Option<Duration>,
    /// Handed to the transport engine.
    pub stun_servers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.into(),
            probe_period: DEFAULT_PROBE_PERIOD,
            report_interval: REPORT_INTERVAL,
            chunk_size: CHUNK_SIZE,
            relay_timeout: None,
            stun_servers: vec![DEFAULT_STUN_SERVER.into()],
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(url) = lookup("PAIRSPEED_RELAY_URL") {
            config.relay_url = url;
        }
        if let Some(ms) = number(&lookup, "PAIRSPEED_PROBE_PERIOD_MS")? {
            config.probe_period = Duration::from_millis(ms);
        }
        if let Some(ms) = number(&lookup, "PAIRSPEED_REPORT_INTERVAL_MS")? {
            config.report_interval = Duration::from_millis(ms);
        }
        if let Some(bytes) = number(&lookup, "PAIRSPEED_CHUNK_SIZE")? {
            if bytes == 0 {
                return Err(ConfigError::Zero { name: "PAIRSPEED_CHUNK_SIZE" });
            }
            config.chunk_size = bytes as usize;
        }
        config.relay_timeout = number(&lookup, "PAIRSPEED_RELAY_TIMEOUT_MS")?.map(Duration::from_millis);
        if let Some(servers) = lookup("PAIRSPEED_STUN_SERVERS") {
            config.stun_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(config)
    }
}

fn number(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<u64>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<SessionConfig, ConfigError> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        SessionConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from(&[]).unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.probe_period, Duration::from_secs(1));
        assert_eq!(config.report_interval, Duration::from_millis(200));
        assert_eq!(config.chunk_size, 16_000);
        assert_eq!(config.relay_timeout, None);
    }

    #[test]
    fn reads_overrides() {
        let config = from(&[
            ("PAIRSPEED_RELAY_URL", "wss://relay.example/signal"),
            ("PAIRSPEED_PROBE_PERIOD_MS", "250"),
            ("PAIRSPEED_RELAY_TIMEOUT_MS", " 5000 "),
            ("PAIRSPEED_STUN_SERVERS", "stun:a:1, stun:b:2,"),
        ])
        .unwrap();
        assert_eq!(config.relay_url, "wss://relay.example/signal");
        assert_eq!(config.probe_period, Duration::from_millis(250));
        assert_eq!(config.relay_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.stun_servers, vec!["stun:a:1", "stun:b:2"]);
    }

    #[test]
    fn rejects_bad_numbers() {
        assert_eq!(
            from(&[("PAIRSPEED_CHUNK_SIZE", "16k")]),
            Err(ConfigError::InvalidNumber { name: "PAIRSPEED_CHUNK_SIZE", value: "16k".into() })
        );
        assert_eq!(
            from(&[("PAIRSPEED_CHUNK_SIZE", "0")]),
            Err(ConfigError::Zero { name: "PAIRSPEED_CHUNK_SIZE" })
        );
    }
}
