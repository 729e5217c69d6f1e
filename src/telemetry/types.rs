//! Telemetry events decoded from inbound CRSF frames

use serde::Serialize;

use crate::crsf::decoder::{decode_battery_sensor, decode_gps, decode_link_statistics, decode_rc_channels};
use crate::crsf::protocol::{
    BatterySensor, CrsfFrame, GpsData, LinkStatistics, RcChannels, CRSF_FRAMETYPE_BATTERY_SENSOR,
    CRSF_FRAMETYPE_GPS, CRSF_FRAMETYPE_LINK_STATISTICS, CRSF_FRAMETYPE_RC_CHANNELS_PACKED,
};
use crate::error::Result;

/// One decoded telemetry packet
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    LinkStatistics(LinkStatistics),
    Battery(BatterySensor),
    Gps(GpsData),
    RcChannels { channels: RcChannels },
}

/// Decode a checksum-valid frame into a telemetry event
///
/// # Returns
///
/// `Ok(None)` for frame types that carry no telemetry
///
/// # Errors
///
/// Returns `CrsfProtocol` if a known frame type has a malformed payload
pub fn decode_telemetry(frame: &CrsfFrame) -> Result<Option<TelemetryEvent>> {
    let event = match frame.frame_type {
        CRSF_FRAMETYPE_LINK_STATISTICS => {
            TelemetryEvent::LinkStatistics(decode_link_statistics(&frame.payload)?)
        }
        CRSF_FRAMETYPE_BATTERY_SENSOR => TelemetryEvent::Battery(decode_battery_sensor(&frame.payload)?),
        CRSF_FRAMETYPE_GPS => TelemetryEvent::Gps(decode_gps(&frame.payload)?),
        CRSF_FRAMETYPE_RC_CHANNELS_PACKED => TelemetryEvent::RcChannels {
            channels: decode_rc_channels(&frame.payload)?,
        },
        _ => return Ok(None),
    };

    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crsf::encoder::encode_rc_channels_payload;
    use crate::crsf::protocol::{CRSF_ADDRESS_FLIGHT_CONTROLLER, CRSF_FRAMETYPE_COMMAND};

    fn frame(frame_type: u8, payload: &[u8]) -> CrsfFrame {
        CrsfFrame::new(CRSF_ADDRESS_FLIGHT_CONTROLLER, frame_type, payload.to_vec()).unwrap()
    }

    #[test]
    fn test_decode_link_statistics_event() {
        let event = decode_telemetry(&frame(
            CRSF_FRAMETYPE_LINK_STATISTICS,
            &[100, 95, 80, 10, 0, 0, 20, 90, 85, 12],
        ))
        .unwrap();

        match event {
            Some(TelemetryEvent::LinkStatistics(stats)) => {
                assert_eq!(stats.uplink_lq, 80);
                assert_eq!(stats.downlink_lq, 85);
            }
            other => panic!("Expected link statistics, got: {:?}", other),
        }
    }

    #[test]
    fn test_decode_battery_event() {
        let event = decode_telemetry(&frame(
            CRSF_FRAMETYPE_BATTERY_SENSOR,
            &[0x06, 0x90, 0x00, 0x0F, 0x00, 0x04, 0xB0, 60],
        ))
        .unwrap();

        match event {
            Some(TelemetryEvent::Battery(battery)) => {
                assert!((battery.voltage - 16.8).abs() < 0.01);
                assert_eq!(battery.capacity_used, 1200);
                assert_eq!(battery.remaining_percent, 60);
            }
            other => panic!("Expected battery, got: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rc_channels_event() {
        let mut channels = [1024u16; 16];
        channels[2] = 172;
        let payload = encode_rc_channels_payload(&channels);

        let event = decode_telemetry(&frame(CRSF_FRAMETYPE_RC_CHANNELS_PACKED, &payload)).unwrap();
        assert_eq!(event, Some(TelemetryEvent::RcChannels { channels }));
    }

    #[test]
    fn test_unknown_frame_type_is_ignored() {
        let event = decode_telemetry(&frame(CRSF_FRAMETYPE_COMMAND, &[0x01, 0x00, 0x00])).unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn test_malformed_payload_is_error() {
        assert!(decode_telemetry(&frame(CRSF_FRAMETYPE_GPS, &[0u8; 4])).is_err());
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = TelemetryEvent::RcChannels { channels: [1024; 16] };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "rc_channels");
        assert_eq!(json["channels"][0], 1024);
    }
}
