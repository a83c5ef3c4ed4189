//! Connects to Home Assistant and cycles a light through a few colors.
//!
//! Run with: cargo run -p glowline-hass --example connect -- hass.toml desk
//!
//! The config file holds `ip_address`, `access_token` and optionally `port`
//! and `name`. Set `RUST_LOG=glowline_hass=debug` for handshake details.

use std::time::Duration;

use glowline_hass::{HassConfig, HassIntegration, RgbColor};
use tracing_subscriber::EnvFilter;

const PALETTE: [RgbColor; 4] = [[255, 0, 0], [0, 255, 0], [0, 0, 255], [255, 160, 40]];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("glowline_hass=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "hass.toml".to_string());
    let entity = args.next().unwrap_or_else(|| "desk".to_string());

    let config = HassConfig::from_toml_file(&config_path)?;
    let integration = HassIntegration::new(config)
        .on_ready(|_| {
            tracing::info!("Home Assistant ready");
            Ok(())
        })
        .on_message(|frame| {
            tracing::info!(kind = %frame.kind(), payload = %frame.payload(), "message");
            Ok(())
        });

    integration.connect()?;

    for color in PALETTE.iter().cycle().take(20) {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if !integration.send_color(*color, &entity)? {
            tracing::info!("Not connected yet, skipping color");
        }
    }

    integration.disconnect();
    Ok(())
}
