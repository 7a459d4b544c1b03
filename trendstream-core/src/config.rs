//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/trendstream/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/trendstream/` (~/.config/trendstream/)
//! - Data: `$XDG_DATA_HOME/trendstream/` (~/.local/share/trendstream/)
//! - State/Logs: `$XDG_STATE_HOME/trendstream/` (~/.local/state/trendstream/)

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Event collector configuration
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Per-signal auto-tracking toggles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoTrackConfig {
    #[serde(default = "default_true")]
    pub pageview: bool,
    #[serde(default = "default_true")]
    pub click: bool,
    #[serde(default = "default_true")]
    pub scroll: bool,
    #[serde(default = "default_true")]
    pub search: bool,
}

impl Default for AutoTrackConfig {
    fn default() -> Self {
        Self {
            pageview: true,
            click: true,
            scroll: true,
            search: true,
        }
    }
}

/// Event collector configuration
///
/// Owned by a single [`Tracker`](crate::Tracker). Runtime changes go through
/// [`CollectorConfig::merge`], which applies a [`ConfigOverride`] field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Collection endpoint receiving `{"events": [...]}` POSTs
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Inactivity threshold in milliseconds before a session id is renewed
    #[serde(default = "default_session_duration")]
    pub session_duration: u64,

    /// Auto-tracking toggles
    #[serde(default)]
    pub auto_track: AutoTrackConfig,

    /// Country code attached to every envelope (no geolocation is performed)
    #[serde(default = "default_country")]
    pub country: String,

    /// Lifetime of the durable user id
    #[serde(default = "default_user_id_expiry_days")]
    pub user_id_expiry_days: u32,

    /// Log delivery failures at warn level
    #[serde(default)]
    pub debug: bool,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Prefer the queued beacon transport over per-request delivery
    #[serde(default = "default_true")]
    pub beacon: bool,

    /// Capacity of the beacon queue
    #[serde(default = "default_beacon_queue_size")]
    pub beacon_queue_size: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            session_duration: default_session_duration(),
            auto_track: AutoTrackConfig::default(),
            country: default_country(),
            user_id_expiry_days: default_user_id_expiry_days(),
            debug: false,
            timeout_secs: default_timeout(),
            beacon: true,
            beacon_queue_size: default_beacon_queue_size(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_url() -> String {
    "http://localhost:8000/api/collect".to_string()
}

fn default_session_duration() -> u64 {
    30 * 60 * 1000
}

fn default_country() -> String {
    "KR".to_string()
}

fn default_user_id_expiry_days() -> u32 {
    365
}

fn default_timeout() -> u64 {
    10
}

fn default_beacon_queue_size() -> usize {
    256
}

impl CollectorConfig {
    /// Inactivity threshold as a chrono duration
    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.session_duration.min(i64::MAX as u64) as i64)
    }

    /// Lifetime of the durable user id
    pub fn user_id_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.user_id_expiry_days))
    }

    /// HTTP request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Apply a partial override in place.
    ///
    /// Values are taken as given; nothing is validated.
    pub fn merge(&mut self, patch: ConfigOverride) {
        if let Some(api_url) = patch.api_url {
            self.api_url = api_url;
        }
        if let Some(session_duration) = patch.session_duration {
            self.session_duration = session_duration;
        }
        if let Some(auto_track) = patch.auto_track {
            if let Some(v) = auto_track.pageview {
                self.auto_track.pageview = v;
            }
            if let Some(v) = auto_track.click {
                self.auto_track.click = v;
            }
            if let Some(v) = auto_track.scroll {
                self.auto_track.scroll = v;
            }
            if let Some(v) = auto_track.search {
                self.auto_track.search = v;
            }
        }
        if let Some(country) = patch.country {
            self.country = country;
        }
        if let Some(debug) = patch.debug {
            self.debug = debug;
        }
    }
}

/// Partial configuration accepted by [`Tracker::config`](crate::Tracker::config)
///
/// Field names mirror the page-facing `config()` call (`apiUrl`, `sessionDuration`,
/// `autoTrack`), so an override can be deserialized straight from a JSON snippet.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverride {
    pub api_url: Option<String>,
    pub session_duration: Option<u64>,
    pub auto_track: Option<AutoTrackOverride>,
    pub country: Option<String>,
    pub debug: Option<bool>,
}

/// Partial auto-tracking toggles
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AutoTrackOverride {
    pub pageview: Option<bool>,
    pub click: Option<bool>,
    pub scroll: Option<bool>,
    pub search: Option<bool>,
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/trendstream/config.toml` (~/.config/trendstream/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("trendstream").join("config.toml")
    }

    /// Returns the data directory path (durable identity store)
    ///
    /// `$XDG_DATA_HOME/trendstream/` (~/.local/share/trendstream/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("trendstream")
    }

    /// Returns the state directory path (session store and logs)
    ///
    /// `$XDG_STATE_HOME/trendstream/` (~/.local/state/trendstream/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("trendstream")
    }

    /// `$XDG_DATA_HOME/trendstream/identity.json`
    pub fn durable_store_path() -> PathBuf {
        Self::data_dir().join("identity.json")
    }

    /// `$XDG_STATE_HOME/trendstream/session.json`
    pub fn session_store_path() -> PathBuf {
        Self::state_dir().join("session.json")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/trendstream/trendstream.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("trendstream.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.collector.session_duration, 1_800_000);
        assert_eq!(config.collector.country, "KR");
        assert_eq!(config.collector.user_id_expiry_days, 365);
        assert!(config.collector.auto_track.click);
        assert!(!config.collector.debug);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[collector]
api_url = "https://collect.example.com/api/collect"
session_duration = 60000
country = "JP"

[collector.auto_track]
scroll = false

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(
            config.collector.api_url,
            "https://collect.example.com/api/collect"
        );
        assert_eq!(config.collector.session_duration, 60_000);
        assert_eq!(config.collector.country, "JP");
        assert!(!config.collector.auto_track.scroll);
        assert!(config.collector.auto_track.pageview);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_merge_only_touches_given_fields() {
        let mut config = CollectorConfig::default();
        config.merge(ConfigOverride {
            session_duration: Some(5_000),
            auto_track: Some(AutoTrackOverride {
                click: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        });

        assert_eq!(config.session_duration, 5_000);
        assert!(!config.auto_track.click);
        assert!(config.auto_track.scroll);
        assert_eq!(config.api_url, default_api_url());
    }

    #[test]
    fn test_merge_does_not_validate() {
        let mut config = CollectorConfig::default();
        config.merge(ConfigOverride {
            api_url: Some("not a url".to_string()),
            session_duration: Some(0),
            ..Default::default()
        });
        assert_eq!(config.api_url, "not a url");
        assert_eq!(config.session_duration, 0);
    }

    #[test]
    fn test_override_from_page_json() {
        let patch: ConfigOverride = serde_json::from_str(
            r#"{"apiUrl": "https://c.example.com", "autoTrack": {"search": false}}"#,
        )
        .unwrap();
        assert_eq!(patch.api_url.as_deref(), Some("https://c.example.com"));
        assert_eq!(patch.auto_track.unwrap().search, Some(false));
    }

    #[test]
    fn test_session_timeout() {
        let config = CollectorConfig::default();
        assert_eq!(config.session_timeout(), chrono::Duration::minutes(30));
        assert_eq!(config.user_id_ttl(), chrono::Duration::days(365));
    }
}
