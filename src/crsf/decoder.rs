//! # CRSF Packet Decoder
//!
//! Streaming frame parser with one-byte resynchronisation, RC channel
//! unpacking, and telemetry payload decoders (Link Statistics, Battery, GPS).

use bytes::{Buf, BytesMut};

use super::crc::crc8_dvb_s2;
use super::protocol::*;
use crate::error::{CrsfLinkError, Result};

/// Result of one scan over the head of a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Not enough bytes buffered; nothing consumed
    Incomplete,

    /// A valid frame starts at the head of the buffer
    Frame {
        /// Decoded frame
        frame: CrsfFrame,
        /// Bytes the frame occupied on the wire
        consumed: usize,
    },

    /// Head of the buffer is not a valid frame; drop one byte and rescan
    ChecksumMismatch,
}

impl ParseOutcome {
    /// Number of bytes the caller must advance its read cursor by
    pub fn consumed(&self) -> usize {
        match self {
            ParseOutcome::Incomplete => 0,
            ParseOutcome::Frame { consumed, .. } => *consumed,
            ParseOutcome::ChecksumMismatch => 1,
        }
    }
}

/// Scan the head of `buffer` for one CRSF frame
///
/// Never blocks and never fails: a bad checksum (or a length byte too small
/// to hold type + crc) consumes exactly one byte so the next call realigns
/// on the following plausible frame start.
///
/// # Examples
///
/// ```
/// use crsf_link::crsf::decoder::{parse_stream, ParseOutcome};
/// use crsf_link::crsf::encoder::build_frame;
///
/// let wire = build_frame(0xC8, 0x14, &[0u8; 10]).unwrap();
/// match parse_stream(&wire) {
///     ParseOutcome::Frame { frame, consumed } => {
///         assert_eq!(frame.frame_type, 0x14);
///         assert_eq!(consumed, wire.len());
///     }
///     other => panic!("unexpected outcome: {:?}", other),
/// }
/// assert_eq!(parse_stream(&wire[..5]), ParseOutcome::Incomplete);
/// ```
pub fn parse_stream(buffer: &[u8]) -> ParseOutcome {
    if buffer.len() < 2 {
        return ParseOutcome::Incomplete;
    }

    let address = buffer[0];
    let length = buffer[1] as usize;

    // Length must at least cover type + crc
    if length < 2 {
        return ParseOutcome::ChecksumMismatch;
    }

    let total_len = length + 2;
    if total_len > buffer.len() {
        return ParseOutcome::Incomplete;
    }

    let frame_type = buffer[2];
    let crc_index = 1 + length;
    let payload = &buffer[3..crc_index];
    let received_crc = buffer[crc_index];

    // CRC over Type + Payload
    let calculated_crc = crc8_dvb_s2(&buffer[2..crc_index]);
    if calculated_crc != received_crc {
        return ParseOutcome::ChecksumMismatch;
    }

    ParseOutcome::Frame {
        frame: CrsfFrame {
            address,
            frame_type,
            payload: payload.to_vec(),
        },
        consumed: total_len,
    }
}

/// Event emitted by [`FrameParser`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// A complete, checksum-valid frame
    Frame(CrsfFrame),

    /// One byte was dropped to resynchronise
    ChecksumMismatch {
        /// The dropped byte
        dropped: u8,
    },
}

/// Accumulating receive buffer driving [`parse_stream`]
///
/// Bytes are appended with [`push`](FrameParser::push) as they arrive and
/// drained with [`next_event`](FrameParser::next_event) until it returns
/// `None` (partial frame, waiting for more bytes).
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: BytesMut,
}

impl FrameParser {
    /// Creates an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next frame or resync event, or `None` if more bytes are needed.
    pub fn next_event(&mut self) -> Option<ParseEvent> {
        match parse_stream(&self.buffer) {
            ParseOutcome::Incomplete => None,
            ParseOutcome::Frame { frame, consumed } => {
                self.buffer.advance(consumed);
                Some(ParseEvent::Frame(frame))
            }
            ParseOutcome::ChecksumMismatch => {
                let dropped = self.buffer.get_u8();
                Some(ParseEvent::ChecksumMismatch { dropped })
            }
        }
    }

    /// Bytes currently waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Unpack a 22-byte RC channels payload into 16 channel values
///
/// Inverse of [`encode_rc_channels_payload`](super::encoder::encode_rc_channels_payload).
pub fn unpack_channels(payload: &[u8; CRSF_RC_CHANNELS_PAYLOAD_SIZE]) -> RcChannels {
    let mut channels = [0u16; CRSF_NUM_CHANNELS];
    let mut bits: u32 = 0;
    let mut pending_bits = 0;
    let mut channel_index = 0;

    for &byte in payload.iter() {
        bits |= u32::from(byte) << pending_bits;
        pending_bits += 8;

        while pending_bits >= CRSF_CHANNEL_BITS {
            channels[channel_index] = (bits as u16) & CRSF_CHANNEL_VALUE_MAX;
            bits >>= CRSF_CHANNEL_BITS;
            pending_bits -= CRSF_CHANNEL_BITS;
            channel_index += 1;
        }
    }

    channels
}

/// Decode the payload of an RC channels frame
///
/// # Errors
///
/// Returns error if the payload is not exactly 22 bytes
pub fn decode_rc_channels(payload: &[u8]) -> Result<RcChannels> {
    let packed: &[u8; CRSF_RC_CHANNELS_PAYLOAD_SIZE] = payload.try_into().map_err(|_| {
        CrsfLinkError::CrsfProtocol(format!(
            "RC channels payload must be {} bytes, got {}",
            CRSF_RC_CHANNELS_PAYLOAD_SIZE,
            payload.len()
        ))
    })?;

    Ok(unpack_channels(packed))
}

/// Decode Link Statistics telemetry packet
///
/// # Arguments
///
/// * `payload` - Link Statistics payload (10 bytes)
pub fn decode_link_statistics(payload: &[u8]) -> Result<LinkStatistics> {
    if payload.len() < CRSF_LINK_STATS_PAYLOAD_SIZE {
        return Err(CrsfLinkError::CrsfProtocol(format!(
            "Link stats payload too short: {} bytes",
            payload.len()
        )));
    }

    Ok(LinkStatistics {
        uplink_rssi_1: payload[0],
        uplink_rssi_2: payload[1],
        uplink_lq: payload[2],
        uplink_snr: payload[3] as i8,
        active_antenna: payload[4],
        rf_mode: payload[5],
        uplink_tx_power: payload[6],
        downlink_rssi: payload[7],
        downlink_lq: payload[8],
        downlink_snr: payload[9] as i8,
    })
}

/// Decode Battery Sensor telemetry packet
///
/// # Arguments
///
/// * `payload` - Battery Sensor payload (8 bytes, big-endian fields)
pub fn decode_battery_sensor(payload: &[u8]) -> Result<BatterySensor> {
    if payload.len() < CRSF_BATTERY_SENSOR_PAYLOAD_SIZE {
        return Err(CrsfLinkError::CrsfProtocol(format!(
            "Battery sensor payload too short: {} bytes",
            payload.len()
        )));
    }

    // Voltage: 2 bytes, in centi-volts
    let voltage_cv = u16::from_be_bytes([payload[0], payload[1]]);

    // Current: 2 bytes, in deci-amps
    let current_da = u16::from_be_bytes([payload[2], payload[3]]);

    // Capacity: 3 bytes, in mAh
    let capacity_used = u32::from_be_bytes([0, payload[4], payload[5], payload[6]]);

    Ok(BatterySensor {
        voltage: voltage_cv as f32 / 100.0,
        current: current_da as f32 / 10.0,
        capacity_used,
        remaining_percent: payload[7],
    })
}

/// Decode GPS telemetry packet
///
/// # Arguments
///
/// * `payload` - GPS payload (15 bytes, big-endian fields)
pub fn decode_gps(payload: &[u8]) -> Result<GpsData> {
    if payload.len() < CRSF_GPS_PAYLOAD_SIZE {
        return Err(CrsfLinkError::CrsfProtocol(format!(
            "GPS payload too short: {} bytes",
            payload.len()
        )));
    }

    // Latitude / longitude: degrees × 10^7
    let lat_raw = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let lon_raw = i32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);

    // Ground speed: km/h × 10
    let speed_raw = u16::from_be_bytes([payload[8], payload[9]]);

    // Heading: degrees × 100
    let heading_raw = u16::from_be_bytes([payload[10], payload[11]]);

    // Altitude: meters + 1000
    let altitude_raw = u16::from_be_bytes([payload[12], payload[13]]);

    Ok(GpsData {
        latitude: lat_raw as f64 / 10_000_000.0,
        longitude: lon_raw as f64 / 10_000_000.0,
        ground_speed: speed_raw as f32 / 10.0,
        heading: heading_raw as f32 / 100.0,
        altitude: (altitude_raw as i32 - 1000) as i16,
        satellites: payload[14],
    })
}
