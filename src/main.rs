//! # fleet
//!
//! Device fleet hub: devices connect over TCP, dashboards watch over
//! WebSocket.
//!
//! ```bash
//! # Defaults (devices on :8888, observers on :8889/ws)
//! fleet
//!
//! # Custom settings file and ports
//! fleet --config ./fleet.json --device-port 9000 --observer-port 9001
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_core::DeviceRegistry;
use fleet_settings::FleetSettings;
use fleet_telemetry::{init_telemetry, TelemetryConfig};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fleet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to settings file (defaults to $FLEET_CONFIG or ~/.fleet/settings.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override device listener port
    #[arg(long)]
    device_port: Option<u16>,

    /// Override observer listener port
    #[arg(long)]
    observer_port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Validate settings and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load(&args)?;

    if args.validate {
        println!("Settings are valid");
        return Ok(());
    }

    let level = if args.debug {
        "debug"
    } else {
        settings.logging.level.as_str()
    };
    let telemetry = init_telemetry(&TelemetryConfig::with_level_name(level, settings.logging.json));
    info!(filter = telemetry.filter(), "starting fleet hub");

    let registry = Arc::new(DeviceRegistry::default());
    let handle = fleet_server::start(&settings, registry)
        .await
        .context("failed to start fleet server")?;

    info!(
        device = %handle.device_addr,
        observer = %handle.observer_addr,
        "fleet hub ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    info!("shutting down");
    if !handle.shutdown(None).await {
        warn!("some connections did not close in time");
    }
    Ok(())
}

fn load(args: &Args) -> Result<FleetSettings> {
    let path = args.config.clone().unwrap_or_else(fleet_settings::settings_path);
    let mut settings = fleet_settings::load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;

    if let Some(port) = args.device_port {
        settings.device.port = port;
    }
    if let Some(port) = args.observer_port {
        settings.observer.port = port;
    }

    settings.validate().context("invalid settings")?;
    Ok(settings)
}
