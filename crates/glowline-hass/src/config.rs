//! Configuration for the Home Assistant link.
//!
//! [`HassConfig`] is the host-facing settings block (address, port, token,
//! friendly name). [`RetryPolicy`] tunes the supervisor's reconnect loop.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::error::{HassError, Result};

/// Path of the Home Assistant websocket endpoint.
pub const WEBSOCKET_PATH: &str = "/api/websocket";

/// Default Home Assistant HTTP/websocket port.
pub const DEFAULT_PORT: u16 = 8123;

/// Settings for one Home Assistant integration instance.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HassConfig {
    /// Name of this integration instance and associated settings.
    pub name: String,
    /// Address of the Home Assistant host.
    pub ip_address: String,
    /// Long-lived access token used for the auth handshake.
    pub access_token: String,
    /// Websocket port, 1-65535. Numeric strings are accepted.
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
}

impl Default for HassConfig {
    fn default() -> Self {
        Self {
            name: "Home Assistant WebSocket".to_string(),
            ip_address: "127.0.0.1".to_string(),
            access_token: String::new(),
            port: DEFAULT_PORT,
        }
    }
}

impl HassConfig {
    /// Create a configuration for the given host and token with default name and port.
    pub fn new(ip_address: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            access_token: access_token.into(),
            ..Default::default()
        }
    }

    /// Set the friendly name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the websocket port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration from a TOML file and validate it.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            HassError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(HassError::Config("name must not be empty".into()));
        }
        if self.ip_address.trim().is_empty() {
            return Err(HassError::Config("ip_address must not be empty".into()));
        }
        if self.port == 0 {
            return Err(HassError::Config("port must be in range 1-65535".into()));
        }
        Ok(())
    }

    /// The websocket URL, `ws://<ip_address>:<port>/api/websocket`.
    pub fn websocket_url(&self) -> Result<Url> {
        let url = Url::parse(&format!(
            "ws://{}:{}{}",
            self.ip_address.trim(),
            self.port,
            WEBSOCKET_PATH
        ))?;
        Ok(url)
    }
}

impl fmt::Debug for HassConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HassConfig")
            .field("name", &self.name)
            .field("ip_address", &self.ip_address)
            .field("access_token", &"<redacted>")
            .field("port", &self.port)
            .finish()
    }
}

fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Int(i64),
        Text(String),
    }

    let raw = match PortValue::deserialize(deserializer)? {
        PortValue::Int(n) => n,
        PortValue::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| serde::de::Error::custom(format!("port '{s}' is not a number")))?,
    };

    match u16::try_from(raw) {
        Ok(port) if port >= 1 => Ok(port),
        _ => Err(serde::de::Error::custom(format!(
            "port {raw} out of range 1-65535"
        ))),
    }
}

/// Reconnect policy for the supervisor.
///
/// The interval is fixed: every failed or closed attempt waits the same
/// amount of time before the next one, with no attempt ceiling.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Delay between the end of one attempt and the start of the next.
    pub interval: Duration,
    /// Upper bound on opening the transport. `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
    /// Capacity of the per-session callback queue.
    pub dispatch_capacity: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            connect_timeout: Some(Duration::from_secs(10)),
            dispatch_capacity: 256,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay between attempts.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the transport connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Disable the connect timeout.
    pub fn no_connect_timeout(mut self) -> Self {
        self.connect_timeout = None;
        self
    }

    /// Set the callback queue capacity (minimum 1).
    pub fn dispatch_capacity(mut self, capacity: usize) -> Self {
        self.dispatch_capacity = capacity.max(1);
        self
    }
}
