//! Client transport
//!
//! A thin request/response layer over the WebSocket: every outgoing request
//! gets a fresh `requestId` and a one-shot waiter in the correlation table;
//! the read loop resolves waiters by echoed id and forwards everything else
//! (incoming messages, key exchanges, typing indicators) to the events
//! channel. Pending requests time out after 10 s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pm_crypto::{b64d, b64e, identity::Identity};
use pm_proto::{
    api::{
        AuthenticatePayload, ChallengePayload, KeyBundle, MessageAckPayload, MessagePayload,
        SyncRequestPayload, SyncResponsePayload,
    },
    Frame, FrameType,
};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::debug;

use crate::error::ClientError;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Frame>>>>;

pub struct Transport {
    out_tx: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
}

impl Transport {
    /// Connect and start the read/write tasks. The returned receiver yields
    /// every unsolicited frame the server pushes at us.
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Frame>), ClientError> {
        let (websocket, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        let (mut ws_sink, mut ws_stream) = websocket.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<Frame>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if ws_sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_out = out_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = ws_stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let Ok(frame) = Frame::parse(&text) else {
                            debug!("dropping unparseable frame");
                            continue;
                        };
                        // Server keepalives are answered inline.
                        if frame.frame_type == FrameType::Ping {
                            let pong = frame.reply(FrameType::Pong, serde_json::json!({}));
                            let _ = reader_out.send(Message::Text(pong.to_json()));
                            continue;
                        }
                        let waiter = reader_pending.lock().remove(&frame.request_id);
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(frame);
                            }
                            None => {
                                let _ = events_tx.send(frame);
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            // Dropping events_tx tells the consumer the connection is gone.
        });

        Ok((Self { out_tx, pending }, events_rx))
    }

    /// Fire-and-forget send (typing indicators, presence).
    pub fn send(&self, frame_type: FrameType, payload: serde_json::Value) -> Result<(), ClientError> {
        let frame = Frame::new(frame_type, uuid::Uuid::new_v4().to_string(), payload);
        self.out_tx
            .send(Message::Text(frame.to_json()))
            .map_err(|_| ClientError::Closed)
    }

    /// Send a request and await its correlated response. An `error` frame
    /// becomes `ClientError::Server`.
    pub async fn request(
        &self,
        frame_type: FrameType,
        payload: serde_json::Value,
    ) -> Result<Frame, ClientError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = Frame::new(frame_type, request_id.clone(), payload);

        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), waiter_tx);

        if self
            .out_tx
            .send(Message::Text(frame.to_json()))
            .is_err()
        {
            self.pending.lock().remove(&request_id);
            return Err(ClientError::Closed);
        }

        let response = match tokio::time::timeout(REQUEST_TIMEOUT, waiter_rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => return Err(ClientError::Closed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                return Err(ClientError::Timeout);
            }
        };

        if response.frame_type == FrameType::Error {
            let code = response.payload["code"].as_str().unwrap_or("UNKNOWN").to_string();
            let message = response.payload["message"].as_str().unwrap_or("").to_string();
            return Err(ClientError::Server { code, message });
        }
        Ok(response)
    }

    // ── Typed operations ─────────────────────────────────────────────────

    /// Two-step challenge authentication, publishing our pre-key bundle.
    pub async fn authenticate(&self, identity: &Identity) -> Result<(), ClientError> {
        let first = self
            .request(FrameType::Authenticate, serde_json::json!({}))
            .await?;
        let challenge: ChallengePayload = serde_json::from_value(first.payload)?;
        let nonce = b64d(&challenge.challenge)?;
        let signature = identity.signing_keys()?.sign(&nonce);

        let bundle = identity.public_bundle()?;
        let payload = AuthenticatePayload {
            public_key: b64e(&identity.signing_keys()?.public),
            signed_challenge: b64e(&signature),
            key_bundle: Some(KeyBundle {
                identity_key: bundle.identity_key,
                signed_pre_key: bundle.signed_pre_key.public_key,
                signed_pre_key_signature: bundle.signed_pre_key.signature,
                one_time_pre_keys: bundle
                    .one_time_pre_keys
                    .iter()
                    .map(|k| k.public_key.clone())
                    .collect(),
            }),
        };
        let second = self
            .request(FrameType::Authenticate, serde_json::to_value(payload)?)
            .await?;
        if second.payload["success"] == true {
            Ok(())
        } else {
            Err(ClientError::Server {
                code: "UNAUTHORIZED".into(),
                message: "authentication refused".into(),
            })
        }
    }

    pub async fn send_message(
        &self,
        recipient_key: &str,
        encrypted_content: serde_json::Value,
    ) -> Result<MessageAckPayload, ClientError> {
        let payload = MessagePayload {
            recipient_key: recipient_key.to_string(),
            encrypted_content,
            media_id: None,
        };
        let response = self
            .request(FrameType::Message, serde_json::to_value(payload)?)
            .await?;
        Ok(serde_json::from_value(response.payload)?)
    }

    pub async fn send_key_exchange(
        &self,
        recipient_key: &str,
        key_bundle: serde_json::Value,
    ) -> Result<bool, ClientError> {
        let response = self
            .request(
                FrameType::KeyExchange,
                serde_json::json!({ "recipientKey": recipient_key, "keyBundle": key_bundle }),
            )
            .await?;
        Ok(response.payload["delivered"].as_bool().unwrap_or(false))
    }

    pub async fn sync(
        &self,
        request: SyncRequestPayload,
    ) -> Result<SyncResponsePayload, ClientError> {
        let response = self
            .request(FrameType::SyncRequest, serde_json::to_value(request)?)
            .await?;
        Ok(serde_json::from_value(response.payload)?)
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        let response = self.request(FrameType::Ping, serde_json::json!({})).await?;
        if response.frame_type == FrameType::Pong {
            Ok(())
        } else {
            Err(ClientError::Protocol(format!(
                "expected pong, got {:?}",
                response.frame_type
            )))
        }
    }
}
