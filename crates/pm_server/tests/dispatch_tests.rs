//! End-to-end dispatcher tests: frames in, frames out, no sockets.
//!
//! Each "device" is a recording sink registered with the connection
//! manager; authentication drives the real challenge-response flow through
//! the dispatcher.

use std::sync::Arc;

use pm_crypto::{b64d, b64e, identity::Identity};
use pm_proto::{Frame, FrameType};
use pm_server::config::ServerConfig;
use pm_server::connection::ConnectionManager;
use pm_server::dispatch::Dispatcher;
use pm_server::media::{MediaStore, MAX_FILE_SIZE};
use pm_server::rate_limit::RateLimiter;
use pm_server::sink::RecordingSink;
use pm_server::store::MessageStore;
use serde_json::json;

struct Harness {
    manager: Arc<ConnectionManager>,
    store: Arc<MessageStore>,
    dispatcher: Dispatcher,
}

fn harness() -> Harness {
    harness_with(ServerConfig {
        enable_rate_limiting: false,
        ..ServerConfig::default()
    })
}

fn harness_with(config: ServerConfig) -> Harness {
    let manager = Arc::new(ConnectionManager::new(config.verify_challenge_signatures));
    let store = Arc::new(MessageStore::new());
    let rate_limiter = Arc::new(RateLimiter::new(config.enable_rate_limiting));
    let media = config
        .enable_media_storage
        .then(|| Arc::new(MediaStore::new()));
    let dispatcher = Dispatcher::new(
        manager.clone(),
        store.clone(),
        rate_limiter,
        media,
        config.clone(),
    );
    Harness { manager, store, dispatcher }
}

impl Harness {
    fn connect(&self, ip: &str) -> (String, Arc<RecordingSink>) {
        let sink = RecordingSink::new();
        let client_id = self.manager.add_connection(sink.clone(), ip.into());
        (client_id, sink)
    }

    fn send(&self, client_id: &str, frame_type: FrameType, request_id: &str, payload: serde_json::Value) {
        let frame = Frame::new(frame_type, request_id, payload);
        self.dispatcher.handle_text(client_id, &frame.to_json());
    }

    /// Drive the two-step challenge flow to completion.
    fn authenticate(&self, client_id: &str, sink: &RecordingSink, identity: &Identity) {
        self.send(client_id, FrameType::Authenticate, "auth-1", json!({}));
        let challenge = last_frame(sink);
        assert_eq!(challenge.frame_type, FrameType::Authenticate);
        let nonce = b64d(challenge.payload["challenge"].as_str().unwrap()).unwrap();

        let signature = identity.signing_keys().unwrap().sign(&nonce);
        self.send(
            client_id,
            FrameType::Authenticate,
            "auth-2",
            json!({
                "publicKey": b64e(&identity.signing_keys().unwrap().public),
                "signedChallenge": b64e(&signature),
            }),
        );
        let success = last_frame(sink);
        assert_eq!(success.payload["success"], true, "authentication should succeed");
    }
}

fn frames(sink: &RecordingSink) -> Vec<Frame> {
    sink.drain()
        .iter()
        .map(|text| Frame::parse(text).expect("server emits valid frames"))
        .collect()
}

fn last_frame(sink: &RecordingSink) -> Frame {
    frames(sink).pop().expect("expected at least one frame")
}

fn user_key(identity: &Identity) -> String {
    b64e(&identity.signing_keys().unwrap().public)
}

// ── Basic plumbing ───────────────────────────────────────────────────────────

#[test]
fn ping_answers_pong_without_auth() {
    let harness = harness();
    let (client, sink) = harness.connect("ip");

    harness.send(&client, FrameType::Ping, "p1", json!({}));
    let pong = last_frame(&sink);
    assert_eq!(pong.frame_type, FrameType::Pong);
    assert_eq!(pong.request_id, "p1");
}

#[test]
fn malformed_frames_get_invalid_request() {
    let harness = harness();
    let (client, sink) = harness.connect("ip");

    harness.dispatcher.handle_text(&client, "{not json");
    harness
        .dispatcher
        .handle_text(&client, r#"{"requestId":"r7","payload":{}}"#);

    let answers = frames(&sink);
    assert_eq!(answers.len(), 2);
    for frame in &answers {
        assert_eq!(frame.frame_type, FrameType::Error);
        assert_eq!(frame.payload["code"], "INVALID_REQUEST");
    }
    // The request id is echoed when the JSON carried one.
    assert_eq!(answers[1].request_id, "r7");
}

#[test]
fn unauthenticated_message_is_unauthorized() {
    let harness = harness();
    let (client, sink) = harness.connect("ip");

    harness.send(
        &client,
        FrameType::Message,
        "m1",
        json!({"recipientKey": "k", "encryptedContent": {"e": "x"}}),
    );
    let answer = last_frame(&sink);
    assert_eq!(answer.frame_type, FrameType::Error);
    assert_eq!(answer.payload["code"], "UNAUTHORIZED");
}

#[test]
fn unauthenticated_typing_is_silently_dropped() {
    let harness = harness();
    let (client, sink) = harness.connect("ip");

    harness.send(
        &client,
        FrameType::Typing,
        "t1",
        json!({"recipientKey": "k", "isTyping": true}),
    );
    assert!(frames(&sink).is_empty(), "no response and no error");
}

// ── Scenario: two-device fan-out ─────────────────────────────────────────────

#[test]
fn sent_message_is_mirrored_to_other_devices() {
    let harness = harness();
    let user = Identity::generate();
    let peer = Identity::generate();

    let (device1, sink1) = harness.connect("ip-u");
    let (device2, sink2) = harness.connect("ip-u");
    harness.authenticate(&device1, &sink1, &user);
    harness.authenticate(&device2, &sink2, &user);
    sink1.drain();
    sink2.drain();

    harness.send(
        &device1,
        FrameType::Message,
        "m1",
        json!({"recipientKey": user_key(&peer), "encryptedContent": {"e": "x"}}),
    );

    // The sending device gets only the ack (recipient is offline).
    let ack = last_frame(&sink1);
    assert_eq!(ack.frame_type, FrameType::MessageAck);
    assert_eq!(ack.payload["delivered"], false);
    assert!(ack.payload["messageId"].as_str().unwrap().starts_with("msg_"));

    // The second device sees the mirrored copy.
    let mirrored = last_frame(&sink2);
    assert_eq!(mirrored.frame_type, FrameType::Message);
    assert_eq!(mirrored.payload["isSentByMe"], true);
    assert_eq!(mirrored.payload["senderKey"], user_key(&user));
    assert_eq!(mirrored.payload["recipientKey"], user_key(&peer));
    assert_eq!(mirrored.payload["encryptedContent"]["e"], "x");
}

#[test]
fn online_recipient_gets_message_and_delivery_is_tracked() {
    let harness = harness();
    let alice = Identity::generate();
    let bob = Identity::generate();

    let (alice_client, alice_sink) = harness.connect("ip-a");
    let (bob_client, bob_sink) = harness.connect("ip-b");
    harness.authenticate(&alice_client, &alice_sink, &alice);
    harness.authenticate(&bob_client, &bob_sink, &bob);
    alice_sink.drain();
    bob_sink.drain();

    harness.send(
        &alice_client,
        FrameType::Message,
        "m1",
        json!({"recipientKey": user_key(&bob), "encryptedContent": {"e": "hi"}}),
    );

    let delivered = last_frame(&bob_sink);
    assert_eq!(delivered.frame_type, FrameType::Message);
    assert_eq!(delivered.payload["senderKey"], user_key(&alice));
    assert!(delivered.payload.get("isSentByMe").is_none());

    let ack = last_frame(&alice_sink);
    assert_eq!(ack.payload["delivered"], true);

    assert!(harness.store.get_undelivered(&user_key(&bob)).is_empty());
}

// ── Scenario: offline sync ───────────────────────────────────────────────────

#[test]
fn offline_messages_arrive_in_order_on_sync() {
    let harness = harness();
    let alice = Identity::generate();
    let bob = Identity::generate();

    let (alice_client, alice_sink) = harness.connect("ip-a");
    harness.authenticate(&alice_client, &alice_sink, &alice);

    for i in 1..=3 {
        harness.send(
            &alice_client,
            FrameType::Message,
            &format!("m{i}"),
            json!({"recipientKey": user_key(&bob), "encryptedContent": {"e": format!("t{i}")}}),
        );
        // Distinct millisecond timestamps, so ordering is observable.
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    // Bob comes online and syncs.
    let (bob_client, bob_sink) = harness.connect("ip-b");
    harness.authenticate(&bob_client, &bob_sink, &bob);
    bob_sink.drain();

    harness.send(&bob_client, FrameType::SyncRequest, "s1", json!({}));
    let response = last_frame(&bob_sink);
    assert_eq!(response.frame_type, FrameType::SyncResponse);
    assert_eq!(response.payload["hasMore"], false);

    let messages = response.payload["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    let mut previous = 0;
    for (i, message) in messages.iter().enumerate() {
        assert_eq!(message["senderKey"], user_key(&alice));
        assert_eq!(message["recipientKey"], user_key(&bob));
        assert_eq!(message["encryptedContent"]["e"], format!("t{}", i + 1));
        let timestamp = message["timestamp"].as_i64().unwrap();
        assert!(timestamp >= previous);
        previous = timestamp;
    }
}

#[test]
fn sync_since_now_is_empty() {
    let harness = harness();
    let alice = Identity::generate();
    let bob = Identity::generate();

    let (alice_client, alice_sink) = harness.connect("ip-a");
    harness.authenticate(&alice_client, &alice_sink, &alice);
    harness.send(
        &alice_client,
        FrameType::Message,
        "m1",
        json!({"recipientKey": user_key(&bob), "encryptedContent": {"e": "x"}}),
    );

    let (bob_client, bob_sink) = harness.connect("ip-b");
    harness.authenticate(&bob_client, &bob_sink, &bob);
    bob_sink.drain();

    let now = chrono::Utc::now().timestamp_millis();
    harness.send(
        &bob_client,
        FrameType::SyncRequest,
        "s1",
        json!({"sinceTimestamp": now}),
    );
    let response = last_frame(&bob_sink);
    assert_eq!(response.payload["messages"].as_array().unwrap().len(), 0);
    assert_eq!(response.payload["hasMore"], false);
}

// ── Scenario: conversation filter ────────────────────────────────────────────

#[test]
fn sync_filters_by_conversation_partner() {
    let harness = harness();
    let a = Identity::generate();
    let b = Identity::generate();
    let c = Identity::generate();

    let clients: Vec<(String, Arc<RecordingSink>, &Identity)> = [&a, &b, &c]
        .iter()
        .enumerate()
        .map(|(i, identity)| {
            let (client, sink) = harness.connect(&format!("ip-{i}"));
            harness.authenticate(&client, &sink, identity);
            (client, sink, *identity)
        })
        .collect();

    let send = |from: usize, to: &Identity, tag: &str| {
        harness.send(
            &clients[from].0,
            FrameType::Message,
            tag,
            json!({"recipientKey": user_key(to), "encryptedContent": {"e": tag}}),
        );
        std::thread::sleep(std::time::Duration::from_millis(2));
    };
    send(0, &b, "ab");
    send(1, &a, "ba");
    send(0, &c, "ac");
    send(2, &a, "ca");

    clients[0].1.drain();
    harness.send(
        &clients[0].0,
        FrameType::SyncRequest,
        "s1",
        json!({"conversationWith": user_key(&b)}),
    );
    let response = last_frame(&clients[0].1);
    let messages = response.payload["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["encryptedContent"]["e"], "ab");
    assert_eq!(messages[1]["encryptedContent"]["e"], "ba");
}

// ── Rate limiting ────────────────────────────────────────────────────────────

#[test]
fn sixth_auth_frame_is_rate_limited() {
    let harness = harness_with(ServerConfig::default());
    let (client, sink) = harness.connect("ip-limited");

    // Five authenticate frames are allowed (challenges and bad answers
    // both count)...
    for i in 0..5 {
        harness.send(&client, FrameType::Authenticate, &format!("a{i}"), json!({}));
    }
    let mut answers = frames(&sink);
    assert!(answers
        .iter()
        .all(|f| f.frame_type != FrameType::Error || f.payload["code"] != "RATE_LIMITED"));

    // ...the sixth is not.
    harness.send(&client, FrameType::Authenticate, "a5", json!({}));
    answers = frames(&sink);
    let last = answers.last().unwrap();
    assert_eq!(last.frame_type, FrameType::Error);
    assert_eq!(last.payload["code"], "RATE_LIMITED");
}

#[test]
fn successful_auth_resets_the_auth_bucket() {
    let harness = harness_with(ServerConfig::default());
    let identity = Identity::generate();
    let (client, sink) = harness.connect("ip-reset");

    // Two auth frames (challenge + good answer) out of the five allowed.
    harness.authenticate(&client, &sink, &identity);
    sink.drain();

    // The bucket was dropped on success: five more auth frames fit.
    for i in 0..5 {
        harness.send(&client, FrameType::Authenticate, &format!("r{i}"), json!({}));
    }
    let answers = frames(&sink);
    assert!(answers
        .iter()
        .all(|f| f.frame_type != FrameType::Error || f.payload["code"] != "RATE_LIMITED"));

    // And the message bucket is untouched by auth traffic.
    harness.send(
        &client,
        FrameType::Message,
        "m1",
        json!({"recipientKey": "k", "encryptedContent": {"e": "x"}}),
    );
    let ack = last_frame(&sink);
    assert_eq!(ack.frame_type, FrameType::MessageAck);
}

#[test]
fn sixty_first_message_is_rate_limited() {
    let harness = harness_with(ServerConfig::default());
    let identity = Identity::generate();
    let (client, sink) = harness.connect("ip-msg");
    harness.authenticate(&client, &sink, &identity);
    sink.drain();

    for i in 0..60 {
        harness.send(
            &client,
            FrameType::Message,
            &format!("m{i}"),
            json!({"recipientKey": "k", "encryptedContent": {"e": "x"}}),
        );
        let ack = last_frame(&sink);
        assert_eq!(ack.frame_type, FrameType::MessageAck, "message {i} should be acked");
    }

    harness.send(
        &client,
        FrameType::Message,
        "m60",
        json!({"recipientKey": "k", "encryptedContent": {"e": "x"}}),
    );
    let answer = last_frame(&sink);
    assert_eq!(answer.frame_type, FrameType::Error);
    assert_eq!(answer.payload["code"], "RATE_LIMITED");
}

// ── Key exchange rendezvous ──────────────────────────────────────────────────

#[test]
fn key_exchange_is_forwarded_and_answered() {
    let harness = harness();
    let alice = Identity::generate();
    let bob = Identity::generate();

    let (alice_client, alice_sink) = harness.connect("ip-a");
    let (bob_client, bob_sink) = harness.connect("ip-b");
    harness.authenticate(&alice_client, &alice_sink, &alice);
    harness.authenticate(&bob_client, &bob_sink, &bob);
    alice_sink.drain();
    bob_sink.drain();

    let bundle = json!({"signedPreKey": "c3Br", "identityKey": "aWs"});
    harness.send(
        &alice_client,
        FrameType::KeyExchange,
        "kx1",
        json!({"recipientKey": user_key(&bob), "keyBundle": bundle}),
    );

    let forwarded = last_frame(&bob_sink);
    assert_eq!(forwarded.frame_type, FrameType::KeyExchange);
    assert_eq!(forwarded.payload["initiatorKey"], user_key(&alice));
    assert_eq!(forwarded.payload["keyBundle"]["identityKey"], "aWs");

    let ack = last_frame(&alice_sink);
    assert_eq!(ack.payload["delivered"], true);

    // Bob answers; the response lands on Alice's devices.
    harness.send(
        &bob_client,
        FrameType::KeyExchangeResponse,
        "kx2",
        json!({"initiatorKey": user_key(&alice), "keyBundle": {"spk": "x"}}),
    );
    let response = last_frame(&alice_sink);
    assert_eq!(response.frame_type, FrameType::KeyExchangeResponse);
    assert_eq!(response.payload["responderKey"], user_key(&bob));
}

// ── Forward-only frames ──────────────────────────────────────────────────────

#[test]
fn typing_and_presence_are_forwarded_with_sender() {
    let harness = harness();
    let alice = Identity::generate();
    let bob = Identity::generate();

    let (alice_client, alice_sink) = harness.connect("ip-a");
    let (bob_client, bob_sink) = harness.connect("ip-b");
    harness.authenticate(&alice_client, &alice_sink, &alice);
    harness.authenticate(&bob_client, &bob_sink, &bob);
    alice_sink.drain();
    bob_sink.drain();

    harness.send(
        &alice_client,
        FrameType::Typing,
        "t1",
        json!({"recipientKey": user_key(&bob), "isTyping": true}),
    );
    let typing = last_frame(&bob_sink);
    assert_eq!(typing.frame_type, FrameType::Typing);
    assert_eq!(typing.payload["senderKey"], user_key(&alice));
    assert_eq!(typing.payload["isTyping"], true);

    harness.send(
        &alice_client,
        FrameType::Presence,
        "p1",
        json!({"recipientKey": user_key(&bob), "status": "online"}),
    );
    let presence = last_frame(&bob_sink);
    assert_eq!(presence.payload["status"], "online");

    // Nothing was stored for either frame.
    assert!(harness.store.get_for_user(&user_key(&bob), None, 100).is_empty());
    // And no ack went back to the sender.
    assert!(frames(&alice_sink).is_empty());
}

// ── Media ────────────────────────────────────────────────────────────────────

#[test]
fn media_without_backend_is_not_supported() {
    let harness = harness();
    let identity = Identity::generate();
    let (client, sink) = harness.connect("ip");
    harness.authenticate(&client, &sink, &identity);
    sink.drain();

    harness.send(
        &client,
        FrameType::MediaUpload,
        "u1",
        json!({"recipientKey": "k", "encryptedData": "ZGF0YQ", "encryptedKey": "a2V5", "fileSize": 10}),
    );
    let answer = last_frame(&sink);
    assert_eq!(answer.payload["code"], "NOT_SUPPORTED");
}

#[test]
fn media_upload_boundaries_and_download() {
    let harness = harness_with(ServerConfig {
        enable_rate_limiting: false,
        enable_media_storage: true,
        ..ServerConfig::default()
    });
    let identity = Identity::generate();
    let (client, sink) = harness.connect("ip");
    harness.authenticate(&client, &sink, &identity);
    sink.drain();

    // Exactly 50 MiB is accepted.
    harness.send(
        &client,
        FrameType::MediaUpload,
        "u1",
        json!({
            "recipientKey": "k",
            "encryptedData": "ZGF0YQ==",
            "encryptedKey": "a2V5",
            "mimeType": "image/png",
            "fileSize": MAX_FILE_SIZE,
        }),
    );
    let ack = last_frame(&sink);
    assert_eq!(ack.frame_type, FrameType::MediaUploadAck);
    let media_id = ack.payload["mediaId"].as_str().unwrap().to_string();
    assert!(ack.payload["expiresAt"].as_i64().unwrap() > 0);

    // One byte over is not.
    harness.send(
        &client,
        FrameType::MediaUpload,
        "u2",
        json!({
            "recipientKey": "k",
            "encryptedData": "ZGF0YQ==",
            "encryptedKey": "a2V5",
            "fileSize": MAX_FILE_SIZE + 1,
        }),
    );
    assert_eq!(last_frame(&sink).payload["code"], "FILE_TOO_LARGE");

    // Unknown MIME types are refused.
    harness.send(
        &client,
        FrameType::MediaUpload,
        "u3",
        json!({
            "recipientKey": "k",
            "encryptedData": "ZGF0YQ==",
            "encryptedKey": "a2V5",
            "mimeType": "application/x-msdownload",
            "fileSize": 10,
        }),
    );
    assert_eq!(last_frame(&sink).payload["code"], "UPLOAD_FAILED");

    // Download returns the stored blob.
    harness.send(
        &client,
        FrameType::MediaDownload,
        "d1",
        json!({"mediaId": media_id}),
    );
    let download = last_frame(&sink);
    assert_eq!(download.frame_type, FrameType::MediaDownloadResponse);
    assert_eq!(download.payload["encryptedData"], "ZGF0YQ==");
    assert_eq!(download.payload["mimeType"], "image/png");

    harness.send(
        &client,
        FrameType::MediaDownload,
        "d2",
        json!({"mediaId": "media_missing"}),
    );
    assert_eq!(last_frame(&sink).payload["code"], "NOT_FOUND");
}
