//! Error types for the Home Assistant link.

use tokio_tungstenite::tungstenite;

/// Errors produced by the websocket session, the supervisor and configuration loading.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HassError {
    /// Connection refused, reset, DNS failure or any other transport-level fault.
    #[error("Transport error: {0}")]
    Transport(String),
    /// Malformed frame or unexpected frame sequence from the remote.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// A send was attempted without a live, authenticated connection.
    #[error("Not connected")]
    NotConnected,
    /// A host callback returned an error or panicked.
    #[error("Handler error: {0}")]
    Handler(String),
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),
    /// Invalid websocket URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),
    /// Connecting took longer than the configured timeout.
    #[error("Connection timed out")]
    Timeout,
    /// The attempt was cancelled by a stop request.
    #[error("Connection attempt was cancelled")]
    Cancelled,
}

impl HassError {
    /// Whether the supervisor should keep retrying after this error.
    ///
    /// Only configuration mistakes are permanent; everything else is treated
    /// as a transient remote or network condition.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::InvalidUrl(_))
    }
}

impl From<tungstenite::Error> for HassError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Url(e) => Self::InvalidUrl(e.to_string()),
            tungstenite::Error::Protocol(e) => Self::Protocol(e.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for HassError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<url::ParseError> for HassError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

impl From<toml::de::Error> for HassError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<std::io::Error> for HassError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// A specialized Result type for Home Assistant link operations.
pub type Result<T> = std::result::Result<T, HassError>;
