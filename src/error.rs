//! # Error Types
//!
//! Custom error types for CRSF Link using `thiserror`.
//!
//! Only transport and validation failures are surfaced as errors. Checksum
//! mismatches on the inbound stream are absorbed by the frame parser and only
//! show up in counters and logs.

use thiserror::Error;

/// Main error type for CRSF Link
#[derive(Debug, Error)]
pub enum CrsfLinkError {
    /// Transport open/read/write failure. Fatal to the current link session.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A channel set did not contain exactly 16 values
    #[error("Invalid channel count: expected 16, got {0}")]
    InvalidChannelCount(usize),

    /// Channel index outside 0-15
    #[error("Invalid channel index: {0} (must be 0-15)")]
    InvalidChannelIndex(usize),

    /// Channel is owned by the safety policy and cannot be written directly
    #[error("Channel {0} is reserved for the arm switch")]
    ReservedChannel(usize),

    /// Command issued while no link is running
    #[error("Link is not connected")]
    NotConnected,

    /// `start_link` called on a running session
    #[error("Link is already running")]
    AlreadyRunning,

    /// CRSF protocol errors
    #[error("CRSF protocol error: {0}")]
    CrsfProtocol(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Telemetry serialization errors
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] serde_json::Error),
}

/// Result type alias for CRSF Link
pub type Result<T> = std::result::Result<T, CrsfLinkError>;
