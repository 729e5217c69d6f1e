//! # CRSF Packet Encoder
//!
//! Encodes RC channels and commands into CRSF protocol frames.

use super::crc::crc8_dvb_s2;
use super::protocol::*;
use crate::error::{CrsfLinkError, Result};

/// Build a complete CRSF frame
///
/// Emits `[address][length][type][payload...][crc]` where
/// `length = payload.len() + 2` and `crc = crc8(type ++ payload)`.
///
/// # Arguments
///
/// * `address` - Destination address (0xC8 flight controller, 0xEE transmitter)
/// * `frame_type` - Frame type byte
/// * `payload` - Payload bytes (max 60)
///
/// # Errors
///
/// Returns error if the payload exceeds CRSF_MAX_PAYLOAD_SIZE
///
/// # Examples
///
/// ```
/// use crsf_link::crsf::encoder::build_frame;
///
/// let frame = build_frame(0xEE, 0x21, &[0x01, 0x00, 0x00]).unwrap();
/// assert_eq!(frame, vec![0xEE, 0x05, 0x21, 0x01, 0x00, 0x00, 0x4F]);
/// ```
pub fn build_frame(address: u8, frame_type: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > CRSF_MAX_PAYLOAD_SIZE {
        return Err(CrsfLinkError::CrsfProtocol(format!(
            "Payload size {} exceeds maximum {}",
            payload.len(),
            CRSF_MAX_PAYLOAD_SIZE
        )));
    }

    Ok(assemble_frame(address, frame_type, payload))
}

/// Frame assembly for payloads already known to fit.
fn assemble_frame(address: u8, frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + CRSF_FRAME_OVERHEAD);
    frame.push(address);
    frame.push((payload.len() + 2) as u8); // type + payload + crc
    frame.push(frame_type);
    frame.extend_from_slice(payload);

    // CRC over Type + Payload
    let crc = crc8_dvb_s2(&frame[2..]);
    frame.push(crc);

    frame
}

/// Encode RC channels into a complete CRSF frame
///
/// # Arguments
///
/// * `address` - Destination address
/// * `channels` - Array of 16 channel values (11-bit: 0-2047)
///
/// # Returns
///
/// * `Vec<u8>` - Complete CRSF frame (26 bytes: address + length + type + 22-byte payload + crc)
///
/// # Examples
///
/// ```
/// use crsf_link::crsf::encoder::encode_rc_channels_frame;
///
/// let channels = [1024u16; 16]; // All channels at center
/// let frame = encode_rc_channels_frame(0xC8, &channels);
/// assert_eq!(frame.len(), 26);
/// ```
pub fn encode_rc_channels_frame(address: u8, channels: &RcChannels) -> Vec<u8> {
    let payload = encode_rc_channels_payload(channels);
    assemble_frame(address, CRSF_FRAMETYPE_RC_CHANNELS_PACKED, &payload)
}

/// Encode the ELRS bind command addressed to the transmitter module
pub fn encode_bind_frame() -> Vec<u8> {
    assemble_frame(
        CRSF_ADDRESS_TRANSMITTER,
        CRSF_FRAMETYPE_COMMAND,
        &[CRSF_COMMAND_BIND, 0x00, 0x00],
    )
}

/// Pack a channel slice into the 22-byte RC channels payload
///
/// # Errors
///
/// Returns `InvalidChannelCount` unless exactly 16 values are given
pub fn pack_channels(channels: &[u16]) -> Result<[u8; CRSF_RC_CHANNELS_PAYLOAD_SIZE]> {
    let channels: &RcChannels = channels
        .try_into()
        .map_err(|_| CrsfLinkError::InvalidChannelCount(channels.len()))?;

    Ok(encode_rc_channels_payload(channels))
}

/// Encode RC channels into payload (22 bytes)
///
/// Packs 16 channels (11 bits each) into 22 bytes using bit packing.
/// Channels are packed as a continuous little-endian bitstream, LSB first.
/// Values are masked to 11 bits, never rejected.
///
/// # Algorithm
///
/// Each channel is 11 bits (0-2047). Channels are packed LSB-first:
/// ```text
/// Byte 0: Ch1[0:7]
/// Byte 1: Ch1[8:10] | Ch2[0:4]
/// Byte 2: Ch2[5:10] | Ch3[0:1]
/// ...
/// ```
pub fn encode_rc_channels_payload(channels: &RcChannels) -> [u8; CRSF_RC_CHANNELS_PAYLOAD_SIZE] {
    let mut payload = [0u8; CRSF_RC_CHANNELS_PAYLOAD_SIZE];
    let mut bits: u32 = 0;
    let mut pending_bits = 0;
    let mut byte_index = 0;

    for &channel in channels.iter() {
        bits |= u32::from(channel & CRSF_CHANNEL_VALUE_MAX) << pending_bits;
        pending_bits += CRSF_CHANNEL_BITS;

        while pending_bits >= 8 {
            payload[byte_index] = bits as u8;
            bits >>= 8;
            pending_bits -= 8;
            byte_index += 1;
        }
    }

    payload
}

/// Clamp a channel value to valid CRSF range (0-2047)
pub fn clamp_channel_value(value: u16) -> u16 {
    value.min(CRSF_CHANNEL_VALUE_MAX)
}
