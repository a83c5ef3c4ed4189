//! Home Assistant websocket link for Glowline.
//!
//! This crate keeps a lighting host connected to a Home Assistant instance:
//!
//! - **Supervisor**: reconnects forever at a fixed interval until stopped
//! - **Session**: runs the `auth_required` -> `auth` -> `auth_ok` handshake and
//!   hands application frames to host callbacks without blocking the socket
//! - **Commands**: typed outbound commands with per-session request ids,
//!   including `light.turn_on` with an RGB color
//! - **Integration**: builds all of the above from a [`HassConfig`]
//!
//! # Quick start
//!
//! ```ignore
//! use glowline_hass::{HassConfig, HassIntegration};
//!
//! let config = HassConfig::new("192.168.1.10", token).port(8123);
//! let integration = HassIntegration::new(config);
//! integration.connect()?;
//!
//! // Later, once authenticated:
//! integration.send_color([255, 120, 0], "desk")?;
//!
//! integration.disconnect();
//! ```
//!
//! # Logging
//!
//! Everything is reported through `tracing` under the targets in [`targets`].
//! Install a subscriber in the host application to see it:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("glowline_hass=debug")
//!     .init();
//! ```

mod config;
mod error;
mod integration;
pub mod websocket;

pub use config::{DEFAULT_PORT, HassConfig, RetryPolicy, WEBSOCKET_PATH};
pub use error::{HassError, Result};
pub use integration::HassIntegration;

// Re-export commonly used types at the crate root
pub use websocket::{
    Callbacks, CommandBody, ConnectionState, FrameKind, InboundFrame, OutboundCommand, RgbColor,
    Session, SessionHandle, Supervisor,
};

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Retry loop target.
    pub const SUPERVISOR: &str = "glowline_hass::supervisor";
    /// Per-connection handshake and dispatch target.
    pub const SESSION: &str = "glowline_hass::session";
    /// Host integration target.
    pub const INTEGRATION: &str = "glowline_hass::integration";
}
