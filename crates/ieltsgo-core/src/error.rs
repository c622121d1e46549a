//! Error types for the IELTSGo client

use thiserror::Error;

/// Failures of the realtime notification stream
///
/// None of these escape `NotificationHub::connect`; they are reported to
/// error listeners and drive the reconnect schedule.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// DNS, connection refused, TLS, timeout
    #[error("stream transport error: {0}")]
    Transport(String),

    /// Server answered with a non-success status
    #[error("stream connection failed: {status} {reason}")]
    Status { status: u16, reason: String },

    /// The body read failed after the stream was open
    #[error("stream read error: {0}")]
    Read(String),

    /// Caller-initiated stop; never reported or retried
    #[error("stream cancelled")]
    Cancelled,
}

impl StreamError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        StreamError::Transport(err.to_string())
    }
}

/// Failures of the REST notification API
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no access token available, please log in first")]
    MissingToken,

    #[error("invalid notification id '{0}'")]
    InvalidId(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ApiError {
    /// Whether the server rejected our credentials
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Status { status: 401, .. })
    }
}

/// Failures loading client configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid API base URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}
