// Runtime command channel codec.
//
// The hub and the client exchange single JSON documents: requests flow
// client -> hub as `{"cmd": ..., "rssi": ...}`, everything flowing back is
// tagged by a `"type"` field. Parsing happens once, here, at the wire
// boundary - the rest of the crate only sees these typed values.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::CommandError;

/// Command that asks the hub to run a device scan.
pub const DISCOVERY_COMMAND: &str = "PING";

// ============================================================================
// RSSI threshold
// ============================================================================

/// Signal-strength filter for discovery. On the wire this is either the
/// literal `"all"` or an integer carried as a string (e.g. `"-60"`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RssiThreshold {
    All,
    Min(i32),
}

impl RssiThreshold {
    /// Whether a device at the given signal strength passes the filter.
    pub fn accepts(&self, rssi: i32) -> bool {
        match self {
            RssiThreshold::All => true,
            RssiThreshold::Min(min) => rssi >= *min,
        }
    }
}

impl Default for RssiThreshold {
    fn default() -> Self {
        RssiThreshold::All
    }
}

impl fmt::Display for RssiThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RssiThreshold::All => write!(f, "all"),
            RssiThreshold::Min(v) => write!(f, "{}", v),
        }
    }
}

impl Serialize for RssiThreshold {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

struct RssiThresholdVisitor;

impl<'de> Visitor<'de> for RssiThresholdVisitor {
    type Value = RssiThreshold;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"all\" or an integer threshold")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<RssiThreshold, E> {
        if v.eq_ignore_ascii_case("all") {
            return Ok(RssiThreshold::All);
        }
        v.parse::<i32>()
            .map(RssiThreshold::Min)
            .map_err(|_| E::custom(format!("invalid rssi threshold: {v:?}")))
    }

    // Some firmware builds send the threshold as a bare number.
    fn visit_i64<E: de::Error>(self, v: i64) -> Result<RssiThreshold, E> {
        Ok(RssiThreshold::Min(v as i32))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<RssiThreshold, E> {
        Ok(RssiThreshold::Min(v as i32))
    }
}

impl<'de> Deserialize<'de> for RssiThreshold {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(RssiThresholdVisitor)
    }
}

// ============================================================================
// Message types
// ============================================================================

/// A discovered peripheral as reported in a `devices` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    /// Colon-separated hex MAC string.
    pub mac: String,
    pub rssi: i32,
    /// Battery percentage, 0-100.
    #[serde(default)]
    pub battery: u8,
    /// Device kind (e.g. "plushie"). Named `type` on the wire.
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Client -> hub request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HubRequest {
    pub cmd: String,
    #[serde(default)]
    pub rssi: RssiThreshold,
}

/// Whether a forwarded command made it onto the radio.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Sent,
    Failed,
}

/// Hub -> client message, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HubMessage {
    Ack {
        command: String,
        status: AckStatus,
        /// Echo of the request's threshold.
        #[serde(default)]
        rssi: RssiThreshold,
    },
    Devices {
        list: Vec<DeviceRecord>,
    },
    Error {
        message: String,
    },
    /// Sent once by the hub after it brings its radio up.
    Ready {
        mode: String,
        mac: String,
    },
}

// ============================================================================
// Parse / encode
// ============================================================================

/// Parse one hub -> client JSON document.
pub fn parse_hub_message(line: &str) -> Result<HubMessage, CommandError> {
    serde_json::from_str(line.trim()).map_err(|e| CommandError {
        detail: format!("unparseable hub message: {e}"),
    })
}

/// Parse one client -> hub JSON document.
pub fn parse_request(line: &str) -> Result<HubRequest, CommandError> {
    serde_json::from_str(line.trim()).map_err(|e| CommandError {
        detail: format!("unparseable request: {e}"),
    })
}

/// Encode a hub message as a single JSON document (no trailing newline).
pub fn encode_hub_message(msg: &HubMessage) -> String {
    serde_json::to_string(msg).expect("HubMessage serialization cannot fail")
}

/// Encode a request as a single JSON document (no trailing newline).
pub fn encode_request(req: &HubRequest) -> String {
    serde_json::to_string(req).expect("HubRequest serialization cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let req = HubRequest {
            cmd: "PING".into(),
            rssi: RssiThreshold::All,
        };
        let json = encode_request(&req);
        assert_eq!(json, r#"{"cmd":"PING","rssi":"all"}"#);
        assert_eq!(parse_request(&json).unwrap(), req);
    }

    #[test]
    fn test_rssi_threshold_forms() {
        // String integer
        let req = parse_request(r#"{"cmd":"PING","rssi":"-60"}"#).unwrap();
        assert_eq!(req.rssi, RssiThreshold::Min(-60));
        // Bare number
        let req = parse_request(r#"{"cmd":"PING","rssi":-45}"#).unwrap();
        assert_eq!(req.rssi, RssiThreshold::Min(-45));
        // Missing defaults to all
        let req = parse_request(r#"{"cmd":"Notes"}"#).unwrap();
        assert_eq!(req.rssi, RssiThreshold::All);
        // Garbage rejected
        assert!(parse_request(r#"{"cmd":"PING","rssi":"weak"}"#).is_err());
    }

    #[test]
    fn test_threshold_filter() {
        assert!(RssiThreshold::All.accepts(-100));
        assert!(RssiThreshold::Min(-60).accepts(-60));
        assert!(RssiThreshold::Min(-60).accepts(-40));
        assert!(!RssiThreshold::Min(-60).accepts(-61));
    }

    #[test]
    fn test_ack_roundtrip() {
        let msg = HubMessage::Ack {
            command: "Notes".into(),
            status: AckStatus::Sent,
            rssi: RssiThreshold::All,
        };
        let json = encode_hub_message(&msg);
        assert_eq!(
            json,
            r#"{"type":"ack","command":"Notes","status":"sent","rssi":"all"}"#
        );
        assert_eq!(parse_hub_message(&json).unwrap(), msg);
    }

    #[test]
    fn test_devices_message_wire_shape() {
        let json = r#"{"type":"devices","list":[{"id":"plush-1","mac":"aa:bb:cc:dd:ee:ff","rssi":-55,"battery":87,"type":"plushie"}]}"#;
        let msg = parse_hub_message(json).unwrap();
        match msg {
            HubMessage::Devices { list } => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].kind, "plushie");
                assert_eq!(list[0].rssi, -55);
            }
            other => panic!("expected devices, got {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_line_is_error_not_panic() {
        assert!(parse_hub_message("not json at all").is_err());
        assert!(parse_hub_message(r#"{"type":"mystery"}"#).is_err());
    }
}
