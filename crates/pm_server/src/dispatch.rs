//! Request dispatcher
//!
//! One inbound frame → one handler invocation. The authorization matrix:
//!
//! | type                     | authenticated? | rate-limited?   |
//! |--------------------------|----------------|-----------------|
//! | ping                     | no             | no              |
//! | authenticate             | no             | yes (auth)      |
//! | message                  | yes            | yes (message)   |
//! | key-exchange(-response)  | yes            | no              |
//! | presence/typing/burn     | yes (silent)   | no              |
//! | invitation(-accept)      | yes            | no              |
//! | sync-request             | yes            | no              |
//! | media-upload/-download   | yes + backend  | no              |
//!
//! Handler failures are logged without payload contents and answered with
//! `error/INVALID_REQUEST`.

use std::sync::Arc;

use pm_proto::{
    api::{
        AuthenticatePayload, ChallengePayload, IncomingMessagePayload,
        KeyExchangeForwardPayload, KeyExchangePayload, KeyExchangeResponsePayload,
        MediaDownloadPayload, MediaUploadAckPayload, MediaUploadPayload, MessageAckPayload,
        MessagePayload, SyncRequestPayload, SyncResponsePayload,
    },
    ErrorCode, Frame, FrameType,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    config::ServerConfig,
    connection::{ConnectionManager, PendingKeyExchange},
    media::{MediaStore, MAX_FILE_SIZE},
    rate_limit::{RateAction, RateLimiter, AUTH_MAX_PER_WINDOW, MESSAGE_MAX_PER_WINDOW, WINDOW_MS},
    store::{MessageStore, CONVERSATION_DEFAULT_LIMIT, SYNC_DEFAULT_LIMIT},
};

pub struct Dispatcher {
    manager: Arc<ConnectionManager>,
    store: Arc<MessageStore>,
    rate_limiter: Arc<RateLimiter>,
    media: Option<Arc<MediaStore>>,
    config: ServerConfig,
}

impl Dispatcher {
    pub fn new(
        manager: Arc<ConnectionManager>,
        store: Arc<MessageStore>,
        rate_limiter: Arc<RateLimiter>,
        media: Option<Arc<MediaStore>>,
        config: ServerConfig,
    ) -> Self {
        Self { manager, store, rate_limiter, media, config }
    }

    /// Entry point for one inbound text message from `client_id`.
    pub fn handle_text(&self, client_id: &str, text: &str) {
        self.manager.touch(client_id);

        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(client_id, %err, "unparseable frame");
                // Salvage the request id if the JSON got that far.
                let request_id = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("requestId").and_then(|r| r.as_str()).map(String::from))
                    .unwrap_or_default();
                self.send_error(client_id, &request_id, ErrorCode::InvalidRequest, "malformed frame");
                return;
            }
        };

        match frame.frame_type {
            FrameType::Ping => {
                self.reply(client_id, &frame, FrameType::Pong, json!({}));
            }
            FrameType::Pong | FrameType::Error => {
                // Keepalive answers and client-side error reports only
                // update activity, which already happened above.
            }
            FrameType::Authenticate => self.handle_authenticate(client_id, &frame),
            FrameType::Message => self.handle_message(client_id, &frame),
            FrameType::MessageAck => self.handle_message_ack(client_id, &frame),
            FrameType::KeyExchange => self.handle_key_exchange(client_id, &frame),
            FrameType::KeyExchangeResponse => self.handle_key_exchange_response(client_id, &frame),
            FrameType::Presence | FrameType::Typing | FrameType::BurnRequest => {
                self.handle_forward_only(client_id, &frame)
            }
            FrameType::Invitation | FrameType::InvitationAccept => {
                self.handle_invitation(client_id, &frame)
            }
            FrameType::SyncRequest => self.handle_sync(client_id, &frame),
            FrameType::MediaUpload => self.handle_media_upload(client_id, &frame),
            FrameType::MediaDownload => self.handle_media_download(client_id, &frame),
            FrameType::SyncResponse
            | FrameType::MediaUploadAck
            | FrameType::MediaDownloadResponse => {
                // Server-emitted types have no inbound meaning.
                self.send_error(
                    client_id,
                    &frame.request_id,
                    ErrorCode::InvalidRequest,
                    "unexpected frame type",
                );
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn reply(&self, client_id: &str, inbound: &Frame, frame_type: FrameType, payload: serde_json::Value) {
        self.manager
            .send_to_client(client_id, &inbound.reply(frame_type, payload));
    }

    fn send_error(&self, client_id: &str, request_id: &str, code: ErrorCode, message: &str) {
        self.manager
            .send_to_client(client_id, &Frame::error(request_id, code, message));
    }

    /// Authenticated sender key, or answer UNAUTHORIZED and yield None.
    fn require_auth(&self, client_id: &str, frame: &Frame) -> Option<String> {
        if let Some(key) = self.manager.public_key_of(client_id) {
            if self.manager.is_authenticated(client_id) {
                return Some(key);
            }
        }
        self.send_error(client_id, &frame.request_id, ErrorCode::Unauthorized, "authenticate first");
        None
    }

    fn payload<T: serde::de::DeserializeOwned>(&self, client_id: &str, frame: &Frame) -> Option<T> {
        match serde_json::from_value(frame.payload.clone()) {
            Ok(payload) => Some(payload),
            Err(err) => {
                debug!(client_id, frame_type = ?frame.frame_type, %err, "bad payload shape");
                self.send_error(
                    client_id,
                    &frame.request_id,
                    ErrorCode::InvalidRequest,
                    "bad payload",
                );
                None
            }
        }
    }

    /// Inject the sender's key into a forwarded payload so the recipient
    /// knows who it came from without trusting the payload itself.
    fn with_sender(payload: &serde_json::Value, sender_key: &str) -> serde_json::Value {
        let mut forwarded = payload.clone();
        if let Some(object) = forwarded.as_object_mut() {
            object.insert("senderKey".into(), json!(sender_key));
        }
        forwarded
    }

    fn fresh_forward(frame_type: FrameType, payload: serde_json::Value) -> Frame {
        Frame::new(frame_type, uuid::Uuid::new_v4().to_string(), payload)
    }

    // ── Authenticate ─────────────────────────────────────────────────────

    fn handle_authenticate(&self, client_id: &str, frame: &Frame) {
        let ip_hash = self.manager.ip_hash_of(client_id).unwrap_or_default();
        if self
            .rate_limiter
            .is_rate_limited(&ip_hash, RateAction::Auth, AUTH_MAX_PER_WINDOW, WINDOW_MS)
        {
            self.send_error(client_id, &frame.request_id, ErrorCode::RateLimited, "too many attempts");
            return;
        }

        if !self.manager.has_pending_challenge(client_id) {
            let Some(challenge) = self.manager.generate_challenge(client_id) else {
                return;
            };
            let payload = ChallengePayload {
                challenge: challenge.nonce,
                timestamp: challenge.timestamp,
            };
            self.reply(
                client_id,
                frame,
                FrameType::Authenticate,
                serde_json::to_value(payload).expect("serialisable"),
            );
            return;
        }

        let Some(payload) = self.payload::<AuthenticatePayload>(client_id, frame) else {
            return;
        };
        if self
            .manager
            .authenticate(client_id, &payload.public_key, &payload.signed_challenge)
        {
            self.rate_limiter.reset_for_ip(&ip_hash, RateAction::Auth);
            self.reply(client_id, frame, FrameType::Authenticate, json!({ "success": true }));
        } else {
            self.send_error(client_id, &frame.request_id, ErrorCode::Unauthorized, "challenge rejected");
        }
    }

    // ── Message ──────────────────────────────────────────────────────────

    fn handle_message(&self, client_id: &str, frame: &Frame) {
        let Some(sender_key) = self.require_auth(client_id, frame) else {
            return;
        };
        let ip_hash = self.manager.ip_hash_of(client_id).unwrap_or_default();
        if self.rate_limiter.is_rate_limited(
            &ip_hash,
            RateAction::Message,
            MESSAGE_MAX_PER_WINDOW,
            WINDOW_MS,
        ) {
            self.send_error(client_id, &frame.request_id, ErrorCode::RateLimited, "message rate exceeded");
            return;
        }
        let Some(payload) = self.payload::<MessagePayload>(client_id, frame) else {
            return;
        };

        let timestamp = chrono::Utc::now().timestamp_millis();
        let message_id = self.store.store(
            &sender_key,
            &payload.recipient_key,
            payload.encrypted_content.clone(),
        );

        let incoming = IncomingMessagePayload {
            message_id: message_id.clone(),
            sender_key: sender_key.clone(),
            recipient_key: payload.recipient_key.clone(),
            encrypted_content: payload.encrypted_content.clone(),
            timestamp,
            is_sent_by_me: None,
        };
        let delivered_to = self.manager.route_message(
            &payload.recipient_key,
            &Self::fresh_forward(
                FrameType::Message,
                serde_json::to_value(&incoming).expect("serialisable"),
            ),
        );
        for device in &delivered_to {
            self.store.mark_delivered(&message_id, device);
        }

        // Mirror to the sender's other devices so every screen shows the
        // conversation moving.
        let mirrored = IncomingMessagePayload {
            is_sent_by_me: Some(true),
            ..incoming
        };
        self.manager.route_to_other_devices(
            &sender_key,
            client_id,
            &Self::fresh_forward(
                FrameType::Message,
                serde_json::to_value(&mirrored).expect("serialisable"),
            ),
        );

        let ack = MessageAckPayload {
            message_id,
            delivered: !delivered_to.is_empty(),
            timestamp,
        };
        self.reply(
            client_id,
            frame,
            FrameType::MessageAck,
            serde_json::to_value(ack).expect("serialisable"),
        );
    }

    /// Inbound message-ack: a device confirming receipt of a routed message.
    fn handle_message_ack(&self, client_id: &str, frame: &Frame) {
        if !self.manager.is_authenticated(client_id) {
            return;
        }
        if let Some(id) = frame.payload.get("messageId").and_then(|v| v.as_str()) {
            self.store.mark_delivered(id, client_id);
        }
    }

    // ── Key exchange rendezvous ──────────────────────────────────────────

    fn handle_key_exchange(&self, client_id: &str, frame: &Frame) {
        let Some(initiator_key) = self.require_auth(client_id, frame) else {
            return;
        };
        let Some(payload) = self.payload::<KeyExchangePayload>(client_id, frame) else {
            return;
        };

        self.manager.store_pending_key_exchange(PendingKeyExchange {
            initiator_key: initiator_key.clone(),
            recipient_key: payload.recipient_key.clone(),
            bundle: payload.key_bundle.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        });

        let forward = KeyExchangeForwardPayload {
            initiator_key,
            key_bundle: payload.key_bundle,
        };
        let delivered = !self
            .manager
            .route_message(
                &payload.recipient_key,
                &Self::fresh_forward(
                    FrameType::KeyExchange,
                    serde_json::to_value(&forward).expect("serialisable"),
                ),
            )
            .is_empty();

        self.reply(client_id, frame, FrameType::KeyExchange, json!({ "delivered": delivered }));
    }

    fn handle_key_exchange_response(&self, client_id: &str, frame: &Frame) {
        let Some(responder_key) = self.require_auth(client_id, frame) else {
            return;
        };
        let Some(mut payload) = self.payload::<KeyExchangeResponsePayload>(client_id, frame) else {
            return;
        };

        // The rendezvous entry served its purpose once the responder answers.
        self.manager
            .consume_pending_key_exchange(&payload.initiator_key, &responder_key);

        payload.responder_key = Some(responder_key);
        let initiator_key = payload.initiator_key.clone();
        let delivered = !self
            .manager
            .route_message(
                &initiator_key,
                &Self::fresh_forward(
                    FrameType::KeyExchangeResponse,
                    serde_json::to_value(&payload).expect("serialisable"),
                ),
            )
            .is_empty();

        self.reply(
            client_id,
            frame,
            FrameType::KeyExchangeResponse,
            json!({ "delivered": delivered }),
        );
    }

    // ── Presence / typing / burn-request: forward, never store ───────────

    fn handle_forward_only(&self, client_id: &str, frame: &Frame) {
        // Silent drop for unauthenticated senders: no error oracle.
        if !self.manager.is_authenticated(client_id) {
            return;
        }
        let Some(sender_key) = self.manager.public_key_of(client_id) else {
            return;
        };

        let recipient = frame.payload.get("recipientKey").and_then(|v| v.as_str());
        let Some(recipient) = recipient else {
            // Presence without a recipient is a broadcast concern for a
            // contact-graph layer the server does not have.
            return;
        };

        self.manager.route_message(
            recipient,
            &Self::fresh_forward(frame.frame_type, Self::with_sender(&frame.payload, &sender_key)),
        );
    }

    // ── Invitations ──────────────────────────────────────────────────────

    fn handle_invitation(&self, client_id: &str, frame: &Frame) {
        let Some(sender_key) = self.require_auth(client_id, frame) else {
            return;
        };

        // `invitation` targets recipientKey; `invitation-accept` targets the
        // inviter. Both are opaque forwards from the server's perspective.
        let target = match frame.frame_type {
            FrameType::InvitationAccept => frame.payload.get("inviterKey"),
            _ => frame.payload.get("recipientKey"),
        }
        .and_then(|v| v.as_str());

        let Some(target) = target else {
            self.send_error(client_id, &frame.request_id, ErrorCode::InvalidRequest, "missing target key");
            return;
        };

        let delivered = !self
            .manager
            .route_message(
                target,
                &Self::fresh_forward(frame.frame_type, Self::with_sender(&frame.payload, &sender_key)),
            )
            .is_empty();
        self.reply(client_id, frame, frame.frame_type, json!({ "delivered": delivered }));
    }

    // ── Sync ─────────────────────────────────────────────────────────────

    fn handle_sync(&self, client_id: &str, frame: &Frame) {
        let Some(user_key) = self.require_auth(client_id, frame) else {
            return;
        };
        let Some(payload) = self.payload::<SyncRequestPayload>(client_id, frame) else {
            return;
        };

        let since = payload.since_timestamp;
        let limit = payload.limit.unwrap_or(match payload.conversation_with {
            Some(_) => CONVERSATION_DEFAULT_LIMIT,
            None => SYNC_DEFAULT_LIMIT,
        });
        let messages = match payload.conversation_with.as_deref() {
            Some(other) => self.store.get_conversation(&user_key, other, since, limit),
            None => self.store.get_for_user(&user_key, since, limit),
        };

        let response = SyncResponsePayload {
            has_more: messages.len() == limit,
            messages: messages.iter().map(|m| m.to_sync_message()).collect(),
        };
        self.reply(
            client_id,
            frame,
            FrameType::SyncResponse,
            serde_json::to_value(response).expect("serialisable"),
        );
    }

    // ── Media ────────────────────────────────────────────────────────────

    fn handle_media_upload(&self, client_id: &str, frame: &Frame) {
        if self.require_auth(client_id, frame).is_none() {
            return;
        }
        let Some(media) = self.media.as_ref() else {
            self.send_error(client_id, &frame.request_id, ErrorCode::NotSupported, "no media backend");
            return;
        };
        let Some(payload) = self.payload::<MediaUploadPayload>(client_id, frame) else {
            return;
        };

        if payload.file_size > MAX_FILE_SIZE {
            self.send_error(client_id, &frame.request_id, ErrorCode::FileTooLarge, "max 50 MiB");
            return;
        }
        if let Some(mime) = payload.mime_type.as_deref() {
            if !self.config.allowed_mime_types.iter().any(|m| m == mime) {
                warn!(client_id, "upload with disallowed mime type");
                self.send_error(client_id, &frame.request_id, ErrorCode::UploadFailed, "mime type not allowed");
                return;
            }
        }

        let (media_id, expires_at) = media.store(&payload.recipient_key, &payload);
        let ack = MediaUploadAckPayload { media_id, expires_at };
        self.reply(
            client_id,
            frame,
            FrameType::MediaUploadAck,
            serde_json::to_value(ack).expect("serialisable"),
        );
    }

    fn handle_media_download(&self, client_id: &str, frame: &Frame) {
        if self.require_auth(client_id, frame).is_none() {
            return;
        }
        let Some(media) = self.media.as_ref() else {
            self.send_error(client_id, &frame.request_id, ErrorCode::NotSupported, "no media backend");
            return;
        };
        let Some(payload) = self.payload::<MediaDownloadPayload>(client_id, frame) else {
            return;
        };

        match media.fetch(&payload.media_id) {
            Some(stored) => {
                self.reply(
                    client_id,
                    frame,
                    FrameType::MediaDownloadResponse,
                    serde_json::to_value(stored.to_download_response()).expect("serialisable"),
                );
            }
            None => {
                self.send_error(client_id, &frame.request_id, ErrorCode::NotFound, "unknown media id");
            }
        }
    }
}
