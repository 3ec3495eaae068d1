//! Wire protocol shared by the coordinator and device agents.
//!
//! Every realtime-channel frame is a single JSON object tagged with a
//! `"type"` field.  Both directions are closed enums; anything that does
//! not decode into one of the variants is rejected with a
//! [`ProtocolError`] and dropped by the receiver.
//!
//! The HTTP side (health, storage listing, uploaded segment metadata) lives
//! here too so the agent and the coordinator agree on one schema.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a connected device within the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Conductor,
    Participant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conductor => "conductor",
            Self::Participant => "participant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single broadcast instructing every device to mark and save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEvent {
    /// Coordinator wall-clock instant in Unix milliseconds, shared verbatim.
    pub logical_timestamp: i64,
    pub session_id: String,
    pub folder_id: String,
}

/// Entry of the aux-light capable list sent to the conductor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuxCapableDevice {
    pub device_id: String,
    pub role: Role,
}

// ── coordinator → device ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent at join and again on promotion.
    RoleAssigned {
        device_id: String,
        role: Role,
        session_id: String,
        sync_started: bool,
    },
    DeviceCount {
        total_connected: usize,
        session_id: String,
    },
    /// Conductor only.
    AuxCapableList { devices: Vec<AuxCapableDevice> },
    AuxSelected { is_selected: bool },
    CountdownTick { remaining: u32 },
    Go,
    Capture(CaptureEvent),
    /// Race rejection, sent to the originator only.
    Busy { request: String },
}

// ── device → coordinator ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    RegisterAuxCapability { has_capability: bool },
    /// `None` clears the selection.
    SelectAuxDevice {
        #[serde(default)]
        target_id: Option<String>,
    },
    RequestSynchronizedStart,
    TriggerCapture,
    NotifyUploaded { filename: String },
}

impl ClientMessage {
    /// Short name used in logs and in `busy` replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::RegisterAuxCapability { .. } => "register-aux-capability",
            Self::SelectAuxDevice { .. } => "select-aux-device",
            Self::RequestSynchronizedStart => "request-synchronized-start",
            Self::TriggerCapture => "trigger-capture",
            Self::NotifyUploaded { .. } => "notify-uploaded",
        }
    }
}

/// A channel frame that could not be decoded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("unknown or malformed message: {0}")]
    Schema(#[source] serde_json::Error),
    #[error("frame exceeds {max} bytes ({len})")]
    TooLarge { len: usize, max: usize },
}

/// Upper bound for a single control frame.  Control traffic is tiny; a
/// larger frame is a misbehaving client.
pub const MAX_FRAME_BYTES: usize = 16 * 1024;

fn decode<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::TooLarge {
            len: text.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    let value: serde_json::Value = serde_json::from_str(text).map_err(ProtocolError::Json)?;
    serde_json::from_value(value).map_err(ProtocolError::Schema)
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        decode(text)
    }
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        decode(text)
    }
}

// ── HTTP types ───────────────────────────────────────────────────────────

/// Sibling metadata object written next to every uploaded segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMetadata {
    pub filename: String,
    pub folder_id: String,
    pub session_id: String,
    pub device_id: String,
    pub capture_logical_timestamp: i64,
    /// Agent wall-clock (Unix ms) when the capture event was received.
    pub received_at: i64,
    pub nominal_duration_ms: u64,
    pub byte_size: u64,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub connected_devices: usize,
    pub session_id: String,
    pub sync_started: bool,
    pub next_counter: u32,
}

/// One stored object in a capture folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
    /// ISO-8601 modification timestamp.
    pub modified: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_wire_shape() {
        let msg = ServerMessage::RoleAssigned {
            device_id: "d1".into(),
            role: Role::Conductor,
            session_id: "s1".into(),
            sync_started: false,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "role-assigned");
        assert_eq!(json["role"], "conductor");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["syncStarted"], false);
    }

    #[test]
    fn test_capture_event_is_flattened_into_frame() {
        let msg = ServerMessage::Capture(CaptureEvent {
            logical_timestamp: 1_700_000_000_123,
            session_id: "s".into(),
            folder_id: "00_20231114_221320_1700000000123".into(),
        });
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains(r#""type":"capture""#));
        assert!(text.contains(r#""logicalTimestamp":1700000000123"#));
        assert_eq!(ServerMessage::parse(&text).unwrap(), msg);
    }

    #[test]
    fn test_unit_variants() {
        assert_eq!(
            serde_json::to_string(&ServerMessage::Go).unwrap(),
            r#"{"type":"go"}"#
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"trigger-capture"}"#).unwrap(),
            ClientMessage::TriggerCapture
        );
    }

    #[test]
    fn test_parse_client_messages() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"register-aux-capability","hasCapability":true}"#)
                .unwrap(),
            ClientMessage::RegisterAuxCapability {
                has_capability: true
            }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"select-aux-device","targetId":null}"#).unwrap(),
            ClientMessage::SelectAuxDevice { target_id: None }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"join"}"#).unwrap(),
            ClientMessage::Join { label: None }
        );
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"launch-missiles"}"#),
            Err(ProtocolError::Schema(_))
        ));
        // missing required field
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"notify-uploaded"}"#),
            Err(ProtocolError::Schema(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"register-aux-capability","hasCapability":"yes"}"#),
            Err(ProtocolError::Schema(_))
        ));
        let huge = format!(r#"{{"type":"join","label":"{}"}}"#, "x".repeat(MAX_FRAME_BYTES));
        assert!(matches!(
            ClientMessage::parse(&huge),
            Err(ProtocolError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_metadata_field_names() {
        let meta = SegmentMetadata {
            filename: "f.mp4".into(),
            folder_id: "00_x".into(),
            session_id: "s".into(),
            device_id: "d".into(),
            capture_logical_timestamp: 5,
            received_at: 6,
            nominal_duration_ms: 10_000,
            byte_size: 42,
            role: Role::Participant,
            label: None,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["captureLogicalTimestamp"], 5);
        assert_eq!(json["byteSize"], 42);
        assert_eq!(json["role"], "participant");
        assert!(json.get("label").is_none());
    }
}
