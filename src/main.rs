//! CLI Entry Point for motion-daq
//!
//! Provides command-line interface for:
//! - Running the acquisition loop against real rings (feature `ble`) or the mock radio
//! - Decoding a single telemetry frame
//! - Printing the framed bytes of a ring command
//!
//! # Usage
//!
//! Stream two simulated rings until Ctrl+C:
//! ```bash
//! motion-daq run --mock AA:BB:CC:DD:EE:01 AA:BB:CC:DD:EE:02
//! ```
//!
//! Decode a frame:
//! ```bash
//! motion-daq decode "a1 03 20 00 ff 0f 00 00 00 00"
//! ```
//!
//! Show a command packet:
//! ```bash
//! motion-daq command enable-streaming
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use motion_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};
use motion_daq::connection::LoggingObserver;
use motion_daq::control::{ControlMapper, LoggingControlSink};
use motion_daq::hardware::protocol::{decode_frame, parse_hex, CommandPacket, DeviceCommand};
use motion_daq::hardware::{LinkTransport, MockTransport};
use motion_daq::pipeline::FilterOrchestrator;
use motion_daq::{logging, DeviceRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "motion-daq")]
#[command(about = "Motion-sensor ring acquisition and control mapping", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach rings and stream until Ctrl+C
    Run {
        /// Ring addresses, in addition to the enabled devices in the config file
        devices: Vec<String>,

        /// Use the simulated radio instead of Bluetooth
        #[arg(long)]
        mock: bool,

        /// Interval between simulated telemetry frames (mock only)
        #[arg(long, default_value = "20")]
        sample_interval_ms: u64,
    },

    /// Decode one telemetry frame given as hex
    Decode {
        /// Frame bytes, e.g. "a1 03 20 00 ff 0f 00 00 00 00"
        hex: String,
    },

    /// Print the 16-byte packet for a named command or a raw hex body
    Command {
        /// reboot, blink-twice, enable-streaming, disable-streaming, or hex
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            devices,
            mock,
            sample_interval_ms,
        } => {
            run(
                cli.config,
                devices,
                mock,
                Duration::from_millis(sample_interval_ms),
            )
            .await
        }
        Commands::Decode { hex } => decode(&hex),
        Commands::Command { name } => command(&name),
    }
}

async fn run(
    config_path: PathBuf,
    extra_devices: Vec<String>,
    mock: bool,
    sample_interval: Duration,
) -> Result<()> {
    let config = AppConfig::load_from(&config_path)?;
    config.validate()?;
    logging::init_from_config(&config)?;

    tracing::info!(
        application = %config.application.name,
        config = %config_path.display(),
        filter = ?config.filter.kind,
        "Starting motion-daq"
    );
    if !config.control.routing.is_complete() {
        tracing::warn!(routing = ?config.control.routing, "Not every control slot is routed");
    }

    let mut devices: Vec<(String, String)> = config
        .enabled_devices()
        .map(|d| (d.address.clone(), d.display_name().to_string()))
        .collect();
    for address in extra_devices {
        devices.push((address.clone(), address));
    }
    if devices.is_empty() {
        bail!("No devices to attach. Pass addresses or list them in {}", config_path.display());
    }

    let simulator = mock.then(MockTransport::new);
    let transport: Arc<dyn LinkTransport> = match &simulator {
        Some(mock) => Arc::new(mock.clone()),
        None => ble_transport().await?,
    };

    let mapper = ControlMapper::new(
        config.control.routing.clone(),
        config.control.scale(),
        LoggingControlSink,
    );
    let orchestrator = FilterOrchestrator::spawn(config.filter.blueprint(), mapper);
    let registry = DeviceRegistry::new(
        transport,
        Arc::new(LoggingObserver),
        orchestrator,
        config.link.settings(),
    );

    let stop_simulation = CancellationToken::new();
    let mut simulations = Vec::new();
    for (address, name) in &devices {
        if let Err(e) = registry.add_device(address, name).await {
            tracing::error!(address = %address, error = %e, "Failed to add device");
            continue;
        }
        if let Some(mock) = &simulator {
            simulations.push(mock.spawn_motion_simulator(
                address,
                sample_interval,
                stop_simulation.clone(),
            ));
        }
    }

    tracing::info!(devices = devices.len(), "Running - press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    registry.close().await;
    stop_simulation.cancel();
    for simulation in simulations {
        let _ = simulation.await;
    }
    Ok(())
}

#[cfg(feature = "ble")]
async fn ble_transport() -> Result<Arc<dyn LinkTransport>> {
    let transport = motion_daq::hardware::ble::BleTransport::new().await?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "ble"))]
async fn ble_transport() -> Result<Arc<dyn LinkTransport>> {
    Err(motion_daq::MotionError::FeatureNotEnabled("ble".to_string()).into())
}

fn decode(hex: &str) -> Result<()> {
    let frame = parse_hex(hex)?;
    match decode_frame(&frame) {
        Some(sample) => {
            println!("x = {:>5}", sample.x);
            println!("y = {:>5}", sample.y);
            println!("z = {:>5}", sample.z);
            println!("|a| = {:.1}", sample.magnitude());
        }
        None => println!("Not an accelerometer report"),
    }
    Ok(())
}

fn command(name: &str) -> Result<()> {
    let packet = match DeviceCommand::from_name(name) {
        Some(command) => command.packet(),
        None => CommandPacket::from_hex(name)?,
    };
    println!("{packet}");
    Ok(())
}
