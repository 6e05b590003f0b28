//! Wire Protocol
//!
//! One NDJSON frame per line over the local stream socket. The control
//! vocabulary is tiny: handshake/heartbeat plumbing, sensor event
//! frames, and request/response for consumers. Version mismatches are
//! answered with an `error` frame and the connection closes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version spoken by this daemon
pub const PROTOCOL_VERSION: u32 = vidurai_core::PROTOCOL_VERSION;

// ============================================================================
// FRAME
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Ping,
    Pong,
    Heartbeat,
    Handshake,
    FileEdit,
    Terminal,
    Diagnostic,
    Focus,
    Pin,
    Unpin,
    Request,
    Response,
    Ack,
    Error,
}

impl FrameType {
    /// Sensor event frames carry a full normalized Event in `data`
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            FrameType::FileEdit | FrameType::Terminal | FrameType::Diagnostic | FrameType::Focus
        )
    }
}

/// One frame on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Frame {
    pub v: u32,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Frame {
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            frame_type,
            ts: Utc::now(),
            id: None,
            data: None,
        }
    }

    pub fn pong(id: Option<String>) -> Self {
        Self {
            id,
            ..Self::new(FrameType::Pong)
        }
    }

    pub fn ack(id: Option<String>) -> Self {
        Self {
            id,
            ..Self::new(FrameType::Ack)
        }
    }

    pub fn handshake() -> Self {
        Self {
            data: Some(serde_json::json!({ "version": PROTOCOL_VERSION })),
            ..Self::new(FrameType::Handshake)
        }
    }

    pub fn response(id: Option<String>, data: Value) -> Self {
        Self {
            id,
            data: Some(data),
            ..Self::new(FrameType::Response)
        }
    }

    pub fn error(id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            data: Some(serde_json::json!({
                "code": code.as_str(),
                "message": message.into(),
            })),
            ..Self::new(FrameType::Error)
        }
    }
}

// ============================================================================
// ERROR CODES
// ============================================================================

/// Stable error codes surfaced to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadEvent,
    Busy,
    BadRequest,
    UnsupportedVersion,
    StoreUnavailable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadEvent => "bad_event",
            ErrorCode::Busy => "busy",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::UnsupportedVersion => "unsupported_version",
            ErrorCode::StoreUnavailable => "store_unavailable",
            ErrorCode::Internal => "internal",
        }
    }
}

// ============================================================================
// REQUEST BODIES
// ============================================================================

/// `request` frame payload: a method plus method-specific params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestBody {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// `pin` / `unpin` frame payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PinBody {
    /// A memory id (numeric string) or a file path
    pub target: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub pinned_by: Option<String>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let frame = Frame::response(
            Some("r1".into()),
            serde_json::json!({"hello": "world"}),
        );
        let line = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&line).unwrap();
        assert_eq!(back.frame_type, FrameType::Response);
        assert_eq!(back.id.as_deref(), Some("r1"));
        assert_eq!(back.v, PROTOCOL_VERSION);
    }

    #[test]
    fn test_frame_type_names_are_snake_case() {
        let frame = Frame::new(FrameType::FileEdit);
        let line = serde_json::to_string(&frame).unwrap();
        assert!(line.contains("\"type\":\"file_edit\""));
    }

    #[test]
    fn test_error_frame_carries_stable_code() {
        let frame = Frame::error(None, ErrorCode::Busy, "intake queue full");
        let data = frame.data.unwrap();
        assert_eq!(data["code"], "busy");
    }

    #[test]
    fn test_event_frame_classification() {
        assert!(FrameType::Diagnostic.is_event());
        assert!(FrameType::Focus.is_event());
        assert!(!FrameType::Request.is_event());
        assert!(!FrameType::Ping.is_event());
    }

    #[test]
    fn test_unknown_frame_field_rejected() {
        let raw = r#"{"v":1,"type":"ping","ts":"2026-01-05T10:00:00Z","extra":true}"#;
        assert!(serde_json::from_str::<Frame>(raw).is_err());
    }
}
