//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::crsf::protocol::{CRSF_ADDRESS_FLIGHT_CONTROLLER, CRSF_ADDRESS_TRANSMITTER};
use crate::error::{CrsfLinkError, Result};
use crate::serial::CRSF_BAUD_RATE;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub crsf: CrsfConfig,

    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial port configuration (the transport handed to `start_link`)
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Receiver per-read timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// CRSF protocol configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CrsfConfig {
    #[serde(default = "default_packet_rate_hz")]
    pub packet_rate_hz: u32,

    /// Address byte of outgoing RC channel frames
    #[serde(default = "default_destination")]
    pub destination: u8,
}

/// Link session configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    /// Upper bound on waiting for the receiver task at shutdown
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

/// Telemetry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional directory for a daily rolling log file
    #[serde(default)]
    pub directory: Option<String>,
}

// Default value functions
fn default_serial_port() -> String { "/dev/ttyUSB0".to_string() }
fn default_baud_rate() -> u32 { CRSF_BAUD_RATE }
fn default_timeout_ms() -> u64 { 20 }

fn default_packet_rate_hz() -> u32 { 50 }
fn default_destination() -> u8 { CRSF_ADDRESS_FLIGHT_CONTROLLER }

fn default_join_timeout_ms() -> u64 { 1000 }

fn default_log_dir() -> String { "./logs".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }

fn default_log_level() -> String { "info".to_string() }

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for CrsfConfig {
    fn default() -> Self {
        Self {
            packet_rate_hz: default_packet_rate_hz(),
            destination: default_destination(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_log_dir(),
            max_records_per_file: default_max_records_per_file(),
            max_files_to_keep: default_max_files_to_keep(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

impl SerialConfig {
    /// Receiver read timeout as a [`Duration`]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl CrsfConfig {
    /// Transmitter period derived from the packet rate
    pub fn packet_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.packet_rate_hz.max(1)))
    }
}

impl LinkConfig {
    /// Receiver join timeout as a [`Duration`]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

fn invalid(message: impl std::fmt::Display) -> CrsfLinkError {
    CrsfLinkError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use crsf_link::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Validate serial port configuration
        if self.serial.port.is_empty() {
            return Err(invalid("serial port cannot be empty"));
        }

        if ![115200, 400000, 420000, 921600, 1870000, 3750000].contains(&self.serial.baud_rate) {
            return Err(invalid(
                "baud_rate must be one of: 115200, 400000, 420000, 921600, 1870000, 3750000",
            ));
        }

        if self.serial.timeout_ms == 0 || self.serial.timeout_ms > 1000 {
            return Err(invalid("timeout_ms must be between 1 and 1000"));
        }

        // Validate packet rate
        if ![50, 150, 250, 500].contains(&self.crsf.packet_rate_hz) {
            return Err(invalid("packet_rate_hz must be one of: 50, 150, 250, 500"));
        }

        if self.crsf.destination != CRSF_ADDRESS_FLIGHT_CONTROLLER
            && self.crsf.destination != CRSF_ADDRESS_TRANSMITTER
        {
            return Err(invalid(format!(
                "destination 0x{:02X} must be 0xC8 (flight controller) or 0xEE (transmitter)",
                self.crsf.destination
            )));
        }

        if self.link.join_timeout_ms == 0 || self.link.join_timeout_ms > 10000 {
            return Err(invalid("join_timeout_ms must be between 1 and 10000"));
        }

        // Validate telemetry configuration
        if self.telemetry.enabled && self.telemetry.log_dir.is_empty() {
            return Err(invalid("telemetry log_dir cannot be empty when enabled"));
        }

        if self.telemetry.max_records_per_file == 0 {
            return Err(invalid("max_records_per_file must be greater than 0"));
        }

        if self.telemetry.max_files_to_keep == 0 {
            return Err(invalid("max_files_to_keep must be greater than 0"));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("logging level must be one of: trace, debug, info, warn, error"));
        }

        if matches!(&self.logging.directory, Some(dir) if dir.is_empty()) {
            return Err(invalid("logging directory cannot be empty when set"));
        }

        Ok(())
    }
}
