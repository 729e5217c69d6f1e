//! # CRSF Protocol Module
//!
//! Implementation of the Crossfire (CRSF) protocol for ExpressLRS communication.
//!
//! This module handles:
//! - RC channels packet encoding (16 channels, 11-bit resolution)
//! - Frame building and streaming frame parsing with one-byte resync
//! - Telemetry packet decoding (Link Stats, Battery, GPS)
//! - CRC8-DVB-S2 checksum calculation

pub mod protocol;
pub mod encoder;
pub mod decoder;
pub mod crc;

/// Deterministic xorshift32 source for randomized tests
#[cfg(test)]
pub(crate) fn xorshift32(seed: u32) -> impl FnMut() -> u32 {
    let mut state = seed;
    move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state
    }
}
