//! Host-facing Home Assistant integration.
//!
//! Wraps a [`Supervisor`] with the settings from a [`HassConfig`] so the host
//! only deals with connect, disconnect and pushing colors.

use std::sync::Arc;

use crate::config::{HassConfig, RetryPolicy};
use crate::error::Result;
use crate::targets;
use crate::websocket::{
    Callbacks, Connector, HandlerResult, InboundFrame, RgbColor, SessionHandle, Supervisor,
};

fn log_message(frame: InboundFrame) -> HandlerResult {
    tracing::debug!(
        target: targets::INTEGRATION,
        frame_type = frame.type_name(),
        payload = %frame.payload(),
        "Home Assistant message"
    );
    Ok(())
}

/// A configured link to one Home Assistant instance.
///
/// # Example
///
/// ```ignore
/// let config = HassConfig::from_toml_file("hass.toml")?;
/// let integration = HassIntegration::new(config)
///     .on_ready(|_| {
///         tracing::info!("Home Assistant ready");
///         Ok(())
///     });
///
/// integration.connect()?;
///
/// // Per rendered frame:
/// integration.send_color([255, 0, 80], "living_room")?;
/// ```
pub struct HassIntegration {
    config: HassConfig,
    supervisor: Supervisor,
    callbacks: Callbacks,
}

impl HassIntegration {
    /// Create an integration using the default retry policy.
    pub fn new(config: HassConfig) -> Self {
        Self::with_supervisor(config, Supervisor::new(RetryPolicy::default()))
    }

    /// Create an integration with a custom connector and policy.
    pub fn with_connector(
        config: HassConfig,
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
    ) -> Self {
        Self::with_supervisor(config, Supervisor::with_connector(connector, policy))
    }

    fn with_supervisor(config: HassConfig, supervisor: Supervisor) -> Self {
        Self {
            config,
            supervisor,
            callbacks: Callbacks::new().on_message(log_message),
        }
    }

    /// Set the callback run after each successful handshake.
    pub fn on_ready<F>(mut self, f: F) -> Self
    where
        F: Fn(&SessionHandle) -> HandlerResult + Send + Sync + 'static,
    {
        self.callbacks = self.callbacks.on_ready(f);
        self
    }

    /// Set the callback run for each inbound application frame.
    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(InboundFrame) -> HandlerResult + Send + Sync + 'static,
    {
        self.callbacks = self.callbacks.on_message(f);
        self
    }

    /// Validate the configuration and (re)start the connection loop.
    pub fn connect(&self) -> Result<()> {
        self.config.validate()?;
        let url = self.config.websocket_url()?;

        tracing::info!(
            target: targets::INTEGRATION,
            name = %self.config.name,
            url = %url,
            "Connecting to Home Assistant"
        );
        self.supervisor
            .start(url, self.config.access_token.clone(), self.callbacks.clone());
        Ok(())
    }

    /// Stop reconnecting and close the live session without waiting for it.
    pub fn disconnect(&self) {
        if let Some(session) = self.supervisor.session() {
            session.disconnect();
        }
        self.supervisor.stop();
        tracing::info!(
            target: targets::INTEGRATION,
            name = %self.config.name,
            "Disconnected from Home Assistant"
        );
    }

    /// Push a color to `light.<entity>`.
    ///
    /// Returns `Ok(false)` when no authenticated session is available, so a
    /// render loop can keep calling this while the link is down.
    pub fn send_color(&self, rgb: RgbColor, entity: &str) -> Result<bool> {
        match self.supervisor.session() {
            Some(session) if session.is_ready() => {
                session.send_light_command(rgb, entity)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Check if an authenticated session is live.
    pub fn is_ready(&self) -> bool {
        self.supervisor
            .session()
            .is_some_and(|session| session.is_ready())
    }

    /// The integration's friendly name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The configuration in use.
    pub fn config(&self) -> &HassConfig {
        &self.config
    }

    /// The underlying supervisor.
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }
}

impl std::fmt::Debug for HassIntegration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HassIntegration")
            .field("config", &self.config)
            .field("supervisor", &self.supervisor)
            .finish()
    }
}
