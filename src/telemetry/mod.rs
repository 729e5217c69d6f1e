//! # Telemetry Module
//!
//! Handles telemetry logging to JSONL files with rotation.
//!
//! This module handles:
//! - Decoding telemetry frames received from ELRS
//! - Formatting as JSONL (JSON Lines)
//! - Writing to rotating log files
//! - Managing file rotation (max N records per file)
//! - Retaining only last M files
//! - Writing from a blocking task so the link receiver never waits on disk

pub mod logger;
pub mod types;

pub use logger::{TelemetryLogger, TelemetrySink};
pub use types::{decode_telemetry, TelemetryEvent};
