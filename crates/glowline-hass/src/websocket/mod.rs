//! Reconnecting Home Assistant websocket client.
//!
//! This module provides:
//! - [`Supervisor`]: the retry loop, reconnecting at a fixed interval until stopped
//! - [`Session`]: one connection, running the `auth_required` -> `auth` ->
//!   `auth_ok` handshake and dispatching frames to [`Callbacks`]
//! - [`SessionHandle`]: non-blocking, typed sends on the live session
//! - [`Connector`]: the transport seam, with [`TungsteniteConnector`] for real sockets
//!
//! # Example
//!
//! ```ignore
//! use glowline_hass::websocket::{Callbacks, Supervisor};
//! use glowline_hass::RetryPolicy;
//!
//! let supervisor = Supervisor::new(RetryPolicy::default());
//!
//! let callbacks = Callbacks::new()
//!     .on_ready(|session| {
//!         session.send_light_command([255, 160, 40], "desk")?;
//!         Ok(())
//!     })
//!     .on_message(|frame| {
//!         println!("{}: {}", frame.kind(), frame.payload());
//!         Ok(())
//!     });
//!
//! supervisor.start(url, token, callbacks);
//! ```

mod frame;
mod session;
mod state;
mod supervisor;
mod transport;

pub use frame::{CommandBody, FrameKind, InboundFrame, OutboundCommand, RgbColor, ServiceTarget};
pub use session::{Callbacks, HandlerError, HandlerResult, Session, SessionHandle};
pub use state::ConnectionState;
pub use supervisor::Supervisor;
pub use transport::{Connector, FrameSink, FrameStream, Transport, TungsteniteConnector};

/// Websocket message type carried by a [`Transport`].
pub use tokio_tungstenite::tungstenite::Message;
