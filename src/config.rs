//! Deployment configuration, loaded from TOML and overridable per-flag.
//!
//! Everything tunable per deployment lives here: default thresholds,
//! clock-skew tolerance, the speed cap, queue depths, and the staleness
//! horizon. All fields default so an empty file (or none at all) yields
//! a working localhost deployment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::session::Thresholds;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address for the HTTP/WebSocket listener.
    pub bind: SocketAddr,
    pub auth: AuthConfig,
    pub tracking: TrackingConfig,
    pub channels: ChannelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".parse().expect("static addr"),
            auth: AuthConfig::default(),
            tracking: TrackingConfig::default(),
            channels: ChannelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret for device credentials (`<subject>:<secret>`).
    /// Unset means development mode: bare subject ids authenticate.
    pub shared_secret: Option<String>,
    /// Bearer token required by the operator HTTP API. Unset means the
    /// operator API is open (localhost-only deployments).
    pub operator_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Thresholds assigned to sessions that start without tuned values.
    pub default_thresholds: Thresholds,
    /// Client/server clock disagreement beyond which a fix is flagged
    /// (accepted with a warning, never rejected).
    pub clock_skew_tolerance_ms: u64,
    /// Ground-speed cap for the spoofing/GPS-jump filter. ~250 km/h.
    pub max_speed_mps: f64,
    /// Sessions with no accepted fix for this long are flagged stale in
    /// operator listings.
    pub stale_after_ms: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            default_thresholds: Thresholds::default(),
            clock_skew_tolerance_ms: 60_000,
            max_speed_mps: 69.4,
            stale_after_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Depth of the bounded durable-write hand-off queue.
    pub persist_queue_depth: usize,
    /// Per-connection outbound buffer; slow watchers drop beyond this.
    pub watcher_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            persist_queue_depth: 256,
            watcher_buffer: 32,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}

impl Config {
    /// Load config from a TOML file path. Returns `None` if the file
    /// doesn't exist, letting the caller fall back to defaults.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.tracking.clock_skew_tolerance_ms, 60_000);
        assert_eq!(config.tracking.default_thresholds.min_distance_meters, 50.0);
        assert_eq!(config.channels.persist_queue_depth, 256);
        assert!(config.auth.shared_secret.is_none());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            bind = "0.0.0.0:9090"

            [auth]
            shared_secret = "hunter2"
            operator_token = "ops-token"

            [tracking]
            clock_skew_tolerance_ms = 30000
            max_speed_mps = 55.0
            stale_after_ms = 120000

            [tracking.default_thresholds]
            min_distance_meters = 25.0
            min_interval_ms = 15000
            max_accuracy_meters = 30.0

            [channels]
            persist_queue_depth = 64
            watcher_buffer = 16
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.bind.port(), 9090);
        assert_eq!(config.auth.shared_secret.as_deref(), Some("hunter2"));
        assert_eq!(config.tracking.max_speed_mps, 55.0);
        assert_eq!(config.tracking.default_thresholds.min_interval_ms, 15_000);
        assert_eq!(config.channels.watcher_buffer, 16);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let toml = r#"
            [tracking]
            max_speed_mps = 40.0
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.tracking.max_speed_mps, 40.0);
        assert_eq!(config.tracking.clock_skew_tolerance_ms, 60_000);
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(Config::load(&path).unwrap().is_none());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geotrackd.toml");
        std::fs::write(&path, "bind = \"127.0.0.1:7000\"\n").unwrap();
        let config = Config::load(&path).unwrap().unwrap();
        assert_eq!(config.bind.port(), 7000);
    }

    #[test]
    fn load_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "bind = [not toml").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
    }

    #[test]
    fn serialize_round_trip() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let reparsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(reparsed.bind, config.bind);
        assert_eq!(
            reparsed.tracking.default_thresholds,
            config.tracking.default_thresholds
        );
    }
}
