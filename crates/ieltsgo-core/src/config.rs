//! Client configuration
//!
//! Loaded from `~/.ieltsgo/config.toml`. Every field has a default, so a
//! missing file or a partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::ConfigError;

/// Environment variable overriding `api_base_url`
pub const API_URL_ENV: &str = "IELTSGO_API_URL";

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api/v1";
pub const DEFAULT_CONNECT_DELAY_MS: u64 = 1200;
pub const DEFAULT_TEARDOWN_GRACE_MS: u64 = 500;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_UNREAD_POLL_SECS: u64 = 60;
pub const DEFAULT_LIST_CACHE_TTL_SECS: u64 = 10;

/// Timings of the realtime notification stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Wait after the first subscriber arrives before opening the stream
    #[serde(default = "default_connect_delay_ms")]
    pub connect_delay_ms: u64,
    /// Wait after the last subscriber leaves before closing the stream
    #[serde(default = "default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_connect_delay_ms() -> u64 {
    DEFAULT_CONNECT_DELAY_MS
}
fn default_teardown_grace_ms() -> u64 {
    DEFAULT_TEARDOWN_GRACE_MS
}
fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}
fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            connect_delay_ms: DEFAULT_CONNECT_DELAY_MS,
            teardown_grace_ms: DEFAULT_TEARDOWN_GRACE_MS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }
}

impl StreamSettings {
    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Top-level client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub stream: StreamSettings,
    /// Cadence of the REST unread-count fallback poll
    #[serde(default = "default_unread_poll_secs")]
    pub unread_poll_interval_secs: u64,
    #[serde(default = "default_list_cache_ttl_secs")]
    pub list_cache_ttl_secs: u64,
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}
fn default_unread_poll_secs() -> u64 {
    DEFAULT_UNREAD_POLL_SECS
}
fn default_list_cache_ttl_secs() -> u64 {
    DEFAULT_LIST_CACHE_TTL_SECS
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            stream: StreamSettings::default(),
            unread_poll_interval_secs: DEFAULT_UNREAD_POLL_SECS,
            list_cache_ttl_secs: DEFAULT_LIST_CACHE_TTL_SECS,
        }
    }
}

impl ClientConfig {
    /// Directory holding config and credentials (`~/.ieltsgo`)
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ieltsgo")
    }

    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Load from the default location, then apply environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::default_path())?;
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                debug!("Using {} override: {}", API_URL_ENV, url);
                config.api_base_url = url;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.base_url().map(|_| ())
    }

    fn base_url(&self) -> Result<Url, ConfigError> {
        // Trailing slash so that join() appends instead of replacing the last segment
        let raw = format!("{}/", self.api_base_url.trim_end_matches('/'));
        Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl {
            url: self.api_base_url.clone(),
            source,
        })
    }

    /// Absolute URL of an API path such as `notifications/unread-count`
    pub fn endpoint(&self, path: &str) -> Result<Url, ConfigError> {
        let base = self.base_url()?;
        base.join(path.trim_start_matches('/'))
            .map_err(|source| ConfigError::InvalidUrl {
                url: self.api_base_url.clone(),
                source,
            })
    }

    /// Absolute URL built from individual path segments
    ///
    /// Each segment is percent-encoded, so caller-supplied ids cannot add
    /// path separators or climb out of the API base.
    pub fn endpoint_segments(&self, segments: &[&str]) -> Result<Url, ConfigError> {
        let mut url = self.base_url()?;
        url.path_segments_mut()
            .map_err(|()| ConfigError::InvalidUrl {
                url: self.api_base_url.clone(),
                source: url::ParseError::RelativeUrlWithCannotBeABaseBase,
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// The realtime notification stream endpoint
    pub fn stream_url(&self) -> Result<Url, ConfigError> {
        self.endpoint("notifications/stream")
    }

    pub fn unread_poll_interval(&self) -> Duration {
        Duration::from_secs(self.unread_poll_interval_secs)
    }

    pub fn list_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.list_cache_ttl_secs)
    }
}
