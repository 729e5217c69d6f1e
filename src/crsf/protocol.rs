//! # CRSF Protocol Constants and Types
//!
//! Core protocol definitions for CRSF (Crossfire) communication.
//!
//! Wire layout of every frame:
//!
//! ```text
//! [address][length][type][payload ...][crc]
//! ```
//!
//! `length` counts type + payload + crc, `crc` covers type + payload.

use serde::Serialize;

use super::crc::crc8_dvb_s2;
use crate::error::{CrsfLinkError, Result};

/// Flight controller address (also the classic CRSF sync byte)
pub const CRSF_ADDRESS_FLIGHT_CONTROLLER: u8 = 0xC8;

/// Transmitter module address
pub const CRSF_ADDRESS_TRANSMITTER: u8 = 0xEE;

/// GPS packet type
pub const CRSF_FRAMETYPE_GPS: u8 = 0x02;

/// Battery Sensor packet type
pub const CRSF_FRAMETYPE_BATTERY_SENSOR: u8 = 0x08;

/// Link Statistics packet type
pub const CRSF_FRAMETYPE_LINK_STATISTICS: u8 = 0x14;

/// RC Channels packet type
pub const CRSF_FRAMETYPE_RC_CHANNELS_PACKED: u8 = 0x16;

/// ELRS command packet type
pub const CRSF_FRAMETYPE_COMMAND: u8 = 0x21;

/// Bind subcommand carried in a [`CRSF_FRAMETYPE_COMMAND`] frame
pub const CRSF_COMMAND_BIND: u8 = 0x01;

/// Maximum CRSF payload size
/// Frame structure: address(1) + length(1) + type(1) + payload(N) + crc(1)
/// Maximum frame size is 64 bytes, so max payload = 64 - 4 = 60 bytes
pub const CRSF_MAX_PAYLOAD_SIZE: usize = 60;

/// Bytes around the payload: address + length + type + crc
pub const CRSF_FRAME_OVERHEAD: usize = 4;

/// RC channels payload size (22 bytes for 16 channels × 11 bits)
pub const CRSF_RC_CHANNELS_PAYLOAD_SIZE: usize = 22;

/// RC channels frame length (type + payload + crc)
pub const CRSF_RC_CHANNELS_FRAME_LENGTH: u8 = 0x18; // 24 bytes

/// Number of RC channels
pub const CRSF_NUM_CHANNELS: usize = 16;

/// Bits per packed channel value
pub const CRSF_CHANNEL_BITS: usize = 11;

/// Channel value range (11-bit: 0-2047)
pub const CRSF_CHANNEL_VALUE_MIN: u16 = 0;
pub const CRSF_CHANNEL_VALUE_MAX: u16 = 2047;
pub const CRSF_CHANNEL_VALUE_CENTER: u16 = 1024;

/// Link Statistics payload size
pub const CRSF_LINK_STATS_PAYLOAD_SIZE: usize = 10;

/// Battery Sensor payload size
pub const CRSF_BATTERY_SENSOR_PAYLOAD_SIZE: usize = 8;

/// GPS payload size
pub const CRSF_GPS_PAYLOAD_SIZE: usize = 15;

/// RC channels array type (16 channels, 11-bit values)
pub type RcChannels = [u16; CRSF_NUM_CHANNELS];

/// Channel indices for semantic access (AETR + aux).
pub mod channels {
    /// Roll (aileron)
    pub const ROLL: usize = 0;
    /// Pitch (elevator)
    pub const PITCH: usize = 1;
    /// Throttle
    pub const THROTTLE: usize = 2;
    /// Yaw (rudder)
    pub const YAW: usize = 3;
    /// AUX1 - ARM switch. Written only by the safety policy.
    pub const ARM: usize = 4;
}

/// Link statistics telemetry data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkStatistics {
    /// Uplink RSSI (antenna 1) in -dBm
    pub uplink_rssi_1: u8,

    /// Uplink RSSI (antenna 2) in -dBm (diversity)
    pub uplink_rssi_2: u8,

    /// Uplink link quality (0-100%)
    pub uplink_lq: u8,

    /// Uplink SNR in dB
    pub uplink_snr: i8,

    /// Active antenna (0 or 1)
    pub active_antenna: u8,

    /// RF mode / packet rate
    pub rf_mode: u8,

    /// Uplink TX power in mW (encoded)
    pub uplink_tx_power: u8,

    /// Downlink RSSI in -dBm
    pub downlink_rssi: u8,

    /// Downlink link quality (0-100%)
    pub downlink_lq: u8,

    /// Downlink SNR in dB
    pub downlink_snr: i8,
}

/// Battery sensor telemetry data
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatterySensor {
    /// Battery voltage in volts
    pub voltage: f32,

    /// Current draw in amperes
    pub current: f32,

    /// Capacity used in mAh
    pub capacity_used: u32,

    /// Battery remaining percentage (0-100%)
    pub remaining_percent: u8,
}

/// GPS telemetry data
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GpsData {
    /// Latitude in degrees
    pub latitude: f64,

    /// Longitude in degrees
    pub longitude: f64,

    /// Ground speed in km/h
    pub ground_speed: f32,

    /// Heading in degrees
    pub heading: f32,

    /// Altitude in meters
    pub altitude: i16,

    /// Number of satellites
    pub satellites: u8,
}

/// CRSF frame structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrsfFrame {
    /// Destination (or origin) address byte
    pub address: u8,

    /// Frame type
    pub frame_type: u8,

    /// Payload data
    pub payload: Vec<u8>,
}

impl CrsfFrame {
    /// Create a new CRSF frame
    ///
    /// # Arguments
    ///
    /// * `address` - Destination address byte
    /// * `frame_type` - Frame type byte
    /// * `payload` - Payload data (max 60 bytes)
    ///
    /// # Errors
    ///
    /// Returns error if payload exceeds CRSF_MAX_PAYLOAD_SIZE (60 bytes)
    pub fn new(address: u8, frame_type: u8, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > CRSF_MAX_PAYLOAD_SIZE {
            return Err(CrsfLinkError::CrsfProtocol(format!(
                "Payload size {} exceeds maximum {}",
                payload.len(),
                CRSF_MAX_PAYLOAD_SIZE
            )));
        }

        Ok(Self {
            address,
            frame_type,
            payload,
        })
    }

    /// Get frame length byte (type + payload + crc)
    pub fn length(&self) -> u8 {
        (1 + self.payload.len() + 1) as u8
    }

    /// Checksum over type + payload, as carried in the trailing wire byte
    pub fn crc(&self) -> u8 {
        let mut data = Vec::with_capacity(1 + self.payload.len());
        data.push(self.frame_type);
        data.extend_from_slice(&self.payload);
        crc8_dvb_s2(&data)
    }
}
