//! # CRSF Link Library
//!
//! Host-side CRSF (Crossfire) remote-control link for ExpressLRS modules.
//!
//! This library provides the core functionality for streaming RC channel
//! frames to a CRSF device at a fixed rate, parsing the telemetry it sends
//! back, and keeping arm/disarm and failsafe state authoritative.

pub mod config;
pub mod error;
pub mod crsf;
pub mod link;
pub mod serial;
pub mod telemetry;
