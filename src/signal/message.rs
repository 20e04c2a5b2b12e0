//! Signaling envelope
//!
//! Wire shape (field names are part of the protocol, camelCase where the
//! browser clients expect it):
//!
//! ```json
//! {"type":"sdp","sdp":"v=0...","sdpType":"offer"}
//! {"type":"ice","candidate":"candidate:...","sdpMid":"0","sdpMLineIndex":0}
//! {"type":"telemetry","latitude":51.5,"longitude":-0.1,"source":"gps"}
//! {"type":"gcs_command","payload":{"action":"takeoff"}}
//! ```

use serde::{Deserialize, Serialize};

/// Message discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Sdp,
    Ice,
    Telemetry,
    GcsCommand,
    RawStream,
    GcsCommandAck,
    RawStreamAck,
    /// Legacy registration handshake, accepted and ignored
    Register,
    /// Anything this relay does not understand
    #[serde(other)]
    Unknown,
}

impl SignalKind {
    /// Protocol name, used in error messages
    pub fn name(&self) -> &'static str {
        match self {
            SignalKind::Sdp => "sdp",
            SignalKind::Ice => "ice",
            SignalKind::Telemetry => "telemetry",
            SignalKind::GcsCommand => "gcs_command",
            SignalKind::RawStream => "raw_stream",
            SignalKind::GcsCommandAck => "gcs_command_ack",
            SignalKind::RawStreamAck => "raw_stream_ack",
            SignalKind::Register => "register",
            SignalKind::Unknown => "unknown",
        }
    }
}

/// One signaling message
///
/// A flat union: every field except `type` is optional and omitted from the
/// wire when absent, so each message kind only carries its own fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,

    #[serde(default, rename = "sdpType", skip_serializing_if = "Option::is_none")]
    pub sdp_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,

    #[serde(default, rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Opaque command payload, forwarded without interpretation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl SignalMessage {
    fn empty(kind: SignalKind) -> Self {
        Self {
            kind,
            sdp: None,
            sdp_type: None,
            candidate: None,
            sdp_mid: None,
            sdp_mline_index: None,
            latitude: None,
            longitude: None,
            altitude: None,
            accuracy: None,
            timestamp: None,
            source: None,
            payload: None,
        }
    }

    /// Build an `sdp` message
    pub fn sdp(sdp: impl Into<String>, sdp_type: impl Into<String>) -> Self {
        Self {
            sdp: Some(sdp.into()),
            sdp_type: Some(sdp_type.into()),
            ..Self::empty(SignalKind::Sdp)
        }
    }

    /// Build an `ice` message
    pub fn ice(candidate: String, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) -> Self {
        Self {
            candidate: Some(candidate),
            sdp_mid,
            sdp_mline_index,
            ..Self::empty(SignalKind::Ice)
        }
    }

    /// Build a `telemetry` message
    pub fn telemetry() -> Self {
        Self::empty(SignalKind::Telemetry)
    }
}

/// Error frame sent to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: String,
    pub code: String,
}

impl ErrorMessage {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdp_round_trip() {
        let msg = SignalMessage::sdp("v=0", "offer");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"sdp\""));
        assert!(json.contains("\"sdpType\":\"offer\""));
        // Unused fields stay off the wire
        assert!(!json.contains("latitude"));
        assert!(!json.contains("payload"));

        let parsed: SignalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, SignalKind::Sdp);
        assert_eq!(parsed.sdp.as_deref(), Some("v=0"));
    }

    #[test]
    fn test_ice_field_names() {
        let msg = SignalMessage::ice("candidate:1".into(), Some("0".into()), Some(0));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"sdpMid\":\"0\""));
        assert!(json.contains("\"sdpMLineIndex\":0"));
    }

    #[test]
    fn test_unknown_type() {
        let parsed: SignalMessage =
            serde_json::from_str(r#"{"type":"handshake_v2","payload":{}}"#).unwrap();
        assert_eq!(parsed.kind, SignalKind::Unknown);
    }

    #[test]
    fn test_command_payload_preserved() {
        let parsed: SignalMessage =
            serde_json::from_str(r#"{"type":"gcs_command","payload":{"action":"takeoff"}}"#)
                .unwrap();
        assert_eq!(parsed.kind, SignalKind::GcsCommand);
        let payload = parsed.payload.unwrap();
        assert_eq!(payload["action"], "takeoff");
    }

    #[test]
    fn test_error_message_shape() {
        let err = ErrorMessage::new("publisher not connected", "SIGNALING_ERROR");
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(
            json,
            r#"{"error":"publisher not connected","code":"SIGNALING_ERROR"}"#
        );
    }
}
