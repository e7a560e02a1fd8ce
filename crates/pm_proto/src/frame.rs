//! Wire framing
//!
//! One JSON object per WebSocket text message, both directions:
//!   { "type": ..., "requestId": ..., "payload": ..., "timestamp": ... }
//!
//! `type` is drawn from the closed `FrameType` set; `requestId` is an opaque
//! string chosen by the sender and echoed in the reply. A frame missing any
//! of type/requestId/payload is invalid and answered with
//! `error/INVALID_REQUEST`.

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Closed registry of frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameType {
    Authenticate,
    Message,
    MessageAck,
    KeyExchange,
    KeyExchangeResponse,
    Presence,
    Typing,
    Invitation,
    InvitationAccept,
    BurnRequest,
    SyncRequest,
    SyncResponse,
    MediaUpload,
    MediaUploadAck,
    MediaDownload,
    MediaDownloadResponse,
    Ping,
    Pong,
    Error,
}

/// Wire error codes. The serialised strings are a fixed contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RateLimited,
    NotSupported,
    FileTooLarge,
    UploadFailed,
    DownloadFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl Frame {
    pub fn new(frame_type: FrameType, request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            frame_type,
            request_id: request_id.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Reply frame: same type unless overridden, echoed request id.
    pub fn reply(&self, frame_type: FrameType, payload: serde_json::Value) -> Self {
        Self::new(frame_type, self.request_id.clone(), payload)
    }

    pub fn error(request_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            FrameType::Error,
            request_id,
            serde_json::json!({ "code": code, "message": message.into() }),
        )
    }

    /// Parse one inbound text message. Any shape violation (bad JSON, an
    /// unknown type, a missing required key) is `ProtoError::Invalid`.
    pub fn parse(text: &str) -> Result<Self, ProtoError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtoError::Invalid(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| ProtoError::Invalid("frame is not an object".into()))?;
        for key in ["type", "requestId", "payload"] {
            if !obj.contains_key(key) {
                return Err(ProtoError::Invalid(format!("missing key {key}")));
            }
        }
        serde_json::from_value(value).map_err(|e| ProtoError::Invalid(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("frames contain only serialisable values")
    }
}
