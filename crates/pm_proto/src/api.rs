//! Request/response payload shapes shared between client and server.
//! These map directly to the JSON `payload` field of a wire frame; all byte
//! fields are base64 strings.

use serde::{Deserialize, Serialize};

// ── Authentication ───────────────────────────────────────────────────────────

/// Server → client on the first (empty) authenticate request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengePayload {
    /// base64 of 32 random bytes
    pub challenge: String,
    pub timestamp: i64,
}

/// Client → server on the second authenticate request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatePayload {
    /// Ed25519 signing public key identifying this user
    pub public_key: String,
    /// Ed25519 signature over the decoded challenge bytes
    pub signed_challenge: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_bundle: Option<KeyBundle>,
}

/// Published pre-key material accompanying authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBundle {
    pub identity_key: String,
    pub signed_pre_key: String,
    pub signed_pre_key_signature: String,
    #[serde(default)]
    pub one_time_pre_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSuccessPayload {
    pub success: bool,
}

// ── Messaging ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub recipient_key: String,
    /// Opaque ciphertext blob; the server never looks inside.
    pub encrypted_content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAckPayload {
    pub message_id: String,
    pub delivered: bool,
    pub timestamp: i64,
}

/// Server → recipient devices (and, with `is_sent_by_me`, the sender's
/// other devices).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessagePayload {
    pub message_id: String,
    pub sender_key: String,
    pub recipient_key: String,
    pub encrypted_content: serde_json::Value,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_sent_by_me: Option<bool>,
}

// ── Key exchange rendezvous ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangePayload {
    pub recipient_key: String,
    pub key_bundle: serde_json::Value,
}

/// Forwarded to the recipient with the initiator's key attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangeForwardPayload {
    pub initiator_key: String,
    pub key_bundle: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangeResponsePayload {
    pub initiator_key: String,
    pub key_bundle: serde_json::Value,
    /// Set by the server when forwarding to the initiator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveredPayload {
    pub delivered: bool,
}

// ── Presence / typing / burn ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_key: Option<String>,
    /// "online" | "offline"
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub recipient_key: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurnRequestPayload {
    pub recipient_key: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationAcceptPayload {
    pub inviter_key: String,
    pub accepter_key: String,
}

// ── Sync ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_with: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub id: String,
    pub sender_key: String,
    pub recipient_key: String,
    pub encrypted_content: serde_json::Value,
    pub timestamp: i64,
    pub delivered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponsePayload {
    pub messages: Vec<SyncMessage>,
    pub has_more: bool,
}

// ── Media ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaUploadPayload {
    pub recipient_key: String,
    pub encrypted_data: String,
    pub encrypted_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub file_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaUploadAckPayload {
    pub media_id: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDownloadPayload {
    pub media_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDownloadResponsePayload {
    pub media_id: String,
    pub encrypted_data: String,
    pub encrypted_key: String,
    pub mime_type: String,
    pub file_size: u64,
}
