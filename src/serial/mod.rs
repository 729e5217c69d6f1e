//! # Serial Communication Module
//!
//! Handles the byte transport between the host and the CRSF device.
//!
//! This module handles:
//! - Opening the serial port at 420,000 baud, 8N1, no flow control
//! - Splitting it into independent receive and transmit halves
//! - Bounded-timeout reads for the link receiver
//!
//! The link engine only sees the [`TransportOpener`], [`SerialReader`] and
//! [`SerialWriter`] traits, so any byte stream can stand in for the port.

pub mod port_trait;

pub use port_trait::{
    AsyncPortReader, AsyncPortWriter, SerialReader, SerialWriter, TransportHalves, TransportOpener,
};

use async_trait::async_trait;
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

use crate::config::SerialConfig;
use crate::error::{CrsfLinkError, Result};

/// CRSF baud rate for ELRS (420,000 baud)
pub const CRSF_BAUD_RATE: u32 = 420_000;

/// Opens real serial devices through `tokio-serial`
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl SerialOpener {
    /// Open a specific serial port with CRSF settings
    ///
    /// # Arguments
    ///
    /// * `path` - Device path (e.g., "/dev/ttyUSB0")
    /// * `baud_rate` - Line rate, normally [`CRSF_BAUD_RATE`]
    fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| CrsfLinkError::Transport(format!("Failed to open {}: {}", path, e)))?;

        Ok(port)
    }
}

#[async_trait]
impl TransportOpener for SerialOpener {
    async fn open(&self, config: &SerialConfig) -> Result<TransportHalves> {
        let port = Self::open_port(&config.port, config.baud_rate)?;
        info!("Opened serial port {} at {} baud", config.port, config.baud_rate);

        let (reader, writer) = tokio::io::split(port);
        Ok((
            Box::new(AsyncPortReader::new(reader)),
            Box::new(AsyncPortWriter::new(writer)),
        ))
    }
}
