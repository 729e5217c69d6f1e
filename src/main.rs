//! # CRSF Link
//!
//! Stream RC channel frames to an ExpressLRS module over CRSF.
//!
//! This application opens the configured serial port, transmits the safe
//! default channel set at the configured packet rate, logs inbound telemetry,
//! and sends a failsafe frame (throttle 0, disarmed) before exiting.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crsf_link::config::{Config, LoggingConfig};
use crsf_link::link::LinkEngine;
use crsf_link::telemetry::TelemetryLogger;

/// Configuration file used when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Name of the rolling log file inside `[logging] directory`
const LOG_FILE_NAME: &str = "crsf-link.log";

/// Main entry point for CRSF Link
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (`crsf-link [config.toml]`)
///    - Set up logging with tracing subscriber
///    - Open the serial link and start transmitting
///
/// 2. **Main Loop**
///    - The link engine transmits and receives in background tasks
///    - Wait for Ctrl+C or a transport fault
///
/// 3. **Graceful Shutdown**
///    - Send the failsafe frame
///    - Release the serial port
///
/// # Errors
///
/// Returns error if:
/// - The configuration file cannot be loaded or is invalid
/// - The serial port cannot be opened
/// - The link closed because of a transport failure
///
/// # Examples
///
/// Run the application:
/// ```bash
/// cargo run --release -- config/default.toml
/// ```
///
/// Expected output:
/// ```text
/// INFO crsf_link: CRSF Link v0.1.0 starting...
/// INFO crsf_link::serial: Opened serial port /dev/ttyUSB0 at 420000 baud
/// INFO crsf_link::link: Link started on /dev/ttyUSB0 at 420000 baud, 50Hz to 0xC8
/// INFO crsf_link::link: Sent 1000 packets (armed: false, throttle: 0)
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config(std::env::args().nth(1))?;
    let _log_guard = init_logging(&config.logging);

    info!("CRSF Link v{} starting...", env!("CARGO_PKG_VERSION"));

    let engine = LinkEngine::new(config.crsf.clone(), config.link.clone());

    let telemetry_writer = if config.telemetry.enabled {
        let logger = TelemetryLogger::new(&config.telemetry)
            .with_context(|| format!("Failed to create telemetry log dir {}", config.telemetry.log_dir))?;
        let (sink, writer) = logger.spawn();
        engine.add_observer(Arc::new(sink));
        Some(writer)
    } else {
        None
    };

    engine
        .start_link(&config.serial)
        .await
        .with_context(|| format!("Failed to start link on {}", config.serial.port))?;

    info!("Press Ctrl+C to exit");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
        }
        _ = engine.wait_closed() => {
            error!("Link closed unexpectedly");
        }
    }

    let stopped = engine.stop_link().await;
    info!("Total packets sent: {}", engine.counters().frames_sent());

    // Dropping the engine releases the telemetry sink so the writer can finish
    drop(engine);
    if let Some(writer) = telemetry_writer {
        writer.await.context("Telemetry writer task failed")?;
    }

    stopped.context("Link shut down with an error")
}

/// Load the configuration named on the command line, or the default file
///
/// A missing default file falls back to built-in defaults; a missing
/// explicitly named file is an error.
fn load_config(path: Option<String>) -> Result<Config> {
    match path {
        Some(path) => {
            Config::load(&path).with_context(|| format!("Failed to load configuration from {}", path))
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("Failed to load configuration from {}", DEFAULT_CONFIG_PATH)),
        None => Ok(Config::default()),
    }
}

/// Initialize logging: stdout always, plus a daily rolling file if configured
///
/// `RUST_LOG` overrides the configured level. The returned guard must be held
/// for the lifetime of the program so buffered file output is flushed.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match &config.directory {
        Some(directory) => {
            let file_appender = tracing_appender::rolling::daily(directory, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false),
                )
                .init();

            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}
