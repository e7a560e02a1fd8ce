//! Connection and session management
//!
//! Per-client state machine:
//!
//! ```text
//! NEW ──add_connection──▶ UNAUTH
//! UNAUTH ──generate_challenge──▶ AWAITING_RESPONSE
//! AWAITING_RESPONSE ──authenticate ok (≤60 s)──▶ AUTHENTICATED
//! AWAITING_RESPONSE ──timeout / bad response──▶ UNAUTH
//! AUTHENTICATED ──socket close / stop──▶ CLOSED
//! ```
//!
//! The authoritative map is `connections: client_id → ClientConnection`;
//! `by_public_key` holds only client ids, so multi-device fan-out is an
//! index lookup, never a second owner. Both live under one lock so no
//! handler observes a half-applied update.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use pm_crypto::{b64d, b64e, keys};
use pm_proto::Frame;
use tracing::{debug, warn};

use crate::sink::{FrameSink, CLOSE_GOING_AWAY};

pub const CHALLENGE_TTL_MS: i64 = 60_000;
pub const PENDING_KEY_EXCHANGE_TTL_MS: i64 = 5 * 60_000;

#[derive(Debug, Clone)]
pub struct Challenge {
    /// base64 of 32 random bytes
    pub nonce: String,
    pub timestamp: i64,
    pub expires_at: i64,
}

pub struct ClientConnection {
    pub client_id: String,
    pub sink: Arc<dyn FrameSink>,
    pub public_key: Option<String>,
    pub authenticated: bool,
    pub connected_at: i64,
    pub last_activity: i64,
    pub ip_hash: String,
    pub pending_challenge: Option<Challenge>,
}

#[derive(Debug, Clone)]
pub struct PendingKeyExchange {
    pub initiator_key: String,
    pub recipient_key: String,
    pub bundle: serde_json::Value,
    pub timestamp: i64,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<String, ClientConnection>,
    by_public_key: HashMap<String, HashSet<String>>,
}

pub struct ConnectionManager {
    registry: Mutex<Registry>,
    pending_key_exchanges: Mutex<HashMap<String, PendingKeyExchange>>,
    verify_signatures: bool,
}

impl ConnectionManager {
    pub fn new(verify_signatures: bool) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            pending_key_exchanges: Mutex::new(HashMap::new()),
            verify_signatures,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    pub fn add_connection(&self, sink: Arc<dyn FrameSink>, ip_hash: String) -> String {
        let client_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let connection = ClientConnection {
            client_id: client_id.clone(),
            sink,
            public_key: None,
            authenticated: false,
            connected_at: now,
            last_activity: now,
            ip_hash,
            pending_challenge: None,
        };
        self.registry.lock().connections.insert(client_id.clone(), connection);
        debug!(client_id, "connection registered");
        client_id
    }

    pub fn remove_connection(&self, client_id: &str) {
        let registry = &mut *self.registry.lock();
        if let Some(connection) = registry.connections.remove(client_id) {
            if let Some(key) = connection.public_key {
                if let Some(ids) = registry.by_public_key.get_mut(&key) {
                    ids.remove(client_id);
                    if ids.is_empty() {
                        registry.by_public_key.remove(&key);
                    }
                }
            }
        }
    }

    pub fn touch(&self, client_id: &str) {
        if let Some(connection) = self.registry.lock().connections.get_mut(client_id) {
            connection.last_activity = chrono::Utc::now().timestamp_millis();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().connections.len()
    }

    pub fn connections_for_ip(&self, ip_hash: &str) -> usize {
        self.registry
            .lock()
            .connections
            .values()
            .filter(|c| c.ip_hash == ip_hash)
            .count()
    }

    pub fn is_authenticated(&self, client_id: &str) -> bool {
        self.registry
            .lock()
            .connections
            .get(client_id)
            .map(|c| c.authenticated)
            .unwrap_or(false)
    }

    pub fn public_key_of(&self, client_id: &str) -> Option<String> {
        self.registry
            .lock()
            .connections
            .get(client_id)
            .and_then(|c| c.public_key.clone())
    }

    pub fn ip_hash_of(&self, client_id: &str) -> Option<String> {
        self.registry
            .lock()
            .connections
            .get(client_id)
            .map(|c| c.ip_hash.clone())
    }

    /// Last inbound activity (ms since epoch). The keepalive task compares
    /// this against the ping timeout to drop unresponsive sockets.
    pub fn last_activity_of(&self, client_id: &str) -> Option<i64> {
        self.registry
            .lock()
            .connections
            .get(client_id)
            .map(|c| c.last_activity)
    }

    // ── Challenge–response ───────────────────────────────────────────────

    /// Issue (and store) a fresh challenge for the client.
    pub fn generate_challenge(&self, client_id: &str) -> Option<Challenge> {
        self.generate_challenge_at(client_id, chrono::Utc::now().timestamp_millis())
    }

    pub(crate) fn generate_challenge_at(&self, client_id: &str, now: i64) -> Option<Challenge> {
        let mut registry = self.registry.lock();
        let connection = registry.connections.get_mut(client_id)?;
        let challenge = Challenge {
            nonce: b64e(&keys::random_bytes(32)),
            timestamp: now,
            expires_at: now + CHALLENGE_TTL_MS,
        };
        connection.pending_challenge = Some(challenge.clone());
        Some(challenge)
    }

    pub fn has_pending_challenge(&self, client_id: &str) -> bool {
        self.registry
            .lock()
            .connections
            .get(client_id)
            .map(|c| c.pending_challenge.is_some())
            .unwrap_or(false)
    }

    /// Verify a challenge response and promote the connection. Any failure
    /// (no challenge, expiry, malformed fields, bad signature) drops the
    /// pending challenge and leaves the connection unauthenticated.
    pub fn authenticate(
        &self,
        client_id: &str,
        public_key_b64: &str,
        signed_challenge_b64: &str,
    ) -> bool {
        self.authenticate_at(
            client_id,
            public_key_b64,
            signed_challenge_b64,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    pub(crate) fn authenticate_at(
        &self,
        client_id: &str,
        public_key_b64: &str,
        signed_challenge_b64: &str,
        now: i64,
    ) -> bool {
        let registry = &mut *self.registry.lock();
        let Some(connection) = registry.connections.get_mut(client_id) else {
            return false;
        };
        let Some(challenge) = connection.pending_challenge.take() else {
            return false;
        };
        if now > challenge.expires_at {
            debug!(client_id, "challenge expired");
            return false;
        }

        if self.verify_signatures {
            let valid = match (
                b64d(&challenge.nonce),
                b64d(signed_challenge_b64),
                b64d(public_key_b64),
            ) {
                (Ok(nonce), Ok(signature), Ok(public_key)) => {
                    keys::verify(&public_key, &nonce, &signature)
                }
                _ => false,
            };
            if !valid {
                warn!(client_id, "challenge signature rejected");
                return false;
            }
        }

        connection.authenticated = true;
        connection.public_key = Some(public_key_b64.to_string());
        registry
            .by_public_key
            .entry(public_key_b64.to_string())
            .or_default()
            .insert(client_id.to_string());
        debug!(client_id, "authenticated");
        true
    }

    // ── Routing ──────────────────────────────────────────────────────────

    /// Fan a frame out to every live device of `recipient_key`. Returns the
    /// client ids that accepted the frame; a dead device never aborts the
    /// rest of the fan-out.
    pub fn route_message(&self, recipient_key: &str, frame: &Frame) -> Vec<String> {
        self.route_internal(recipient_key, None, frame)
    }

    /// Mirror a frame to a user's other devices, skipping the originator.
    pub fn route_to_other_devices(
        &self,
        public_key: &str,
        exclude_client_id: &str,
        frame: &Frame,
    ) -> Vec<String> {
        self.route_internal(public_key, Some(exclude_client_id), frame)
    }

    fn route_internal(
        &self,
        public_key: &str,
        exclude: Option<&str>,
        frame: &Frame,
    ) -> Vec<String> {
        // Snapshot sinks under the lock, send outside it.
        let targets: Vec<(String, Arc<dyn FrameSink>)> = {
            let registry = self.registry.lock();
            registry
                .by_public_key
                .get(public_key)
                .into_iter()
                .flatten()
                .filter(|id| exclude.map_or(true, |ex| ex != id.as_str()))
                .filter_map(|id| {
                    registry
                        .connections
                        .get(id)
                        .map(|c| (id.clone(), c.sink.clone()))
                })
                .collect()
        };

        let text = frame.to_json();
        targets
            .into_iter()
            .filter(|(_, sink)| sink.is_open() && sink.send_text(text.clone()))
            .map(|(id, _)| id)
            .collect()
    }

    /// Send to one specific connection (request/response replies).
    pub fn send_to_client(&self, client_id: &str, frame: &Frame) -> bool {
        let sink = self
            .registry
            .lock()
            .connections
            .get(client_id)
            .map(|c| c.sink.clone());
        match sink {
            Some(sink) => sink.send_text(frame.to_json()),
            None => false,
        }
    }

    // ── Key-exchange rendezvous ──────────────────────────────────────────

    pub fn store_pending_key_exchange(&self, pending: PendingKeyExchange) {
        let key = format!("{}:{}", pending.initiator_key, pending.recipient_key);
        self.pending_key_exchanges.lock().insert(key, pending);
    }

    /// Delete-and-return; entries past their TTL are treated as absent.
    pub fn consume_pending_key_exchange(
        &self,
        initiator_key: &str,
        recipient_key: &str,
    ) -> Option<PendingKeyExchange> {
        self.consume_pending_key_exchange_at(
            initiator_key,
            recipient_key,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    pub(crate) fn consume_pending_key_exchange_at(
        &self,
        initiator_key: &str,
        recipient_key: &str,
        now: i64,
    ) -> Option<PendingKeyExchange> {
        let key = format!("{initiator_key}:{recipient_key}");
        let pending = self.pending_key_exchanges.lock().remove(&key)?;
        (now - pending.timestamp <= PENDING_KEY_EXCHANGE_TTL_MS).then_some(pending)
    }

    // ── Housekeeping ─────────────────────────────────────────────────────

    /// Five-minute tick: expire stale challenges and rendezvous entries.
    pub fn housekeeping(&self) {
        self.housekeeping_at(chrono::Utc::now().timestamp_millis());
    }

    pub(crate) fn housekeeping_at(&self, now: i64) {
        {
            let mut registry = self.registry.lock();
            for connection in registry.connections.values_mut() {
                if connection
                    .pending_challenge
                    .as_ref()
                    .is_some_and(|c| now > c.expires_at)
                {
                    connection.pending_challenge = None;
                }
            }
        }
        self.pending_key_exchanges
            .lock()
            .retain(|_, pending| now - pending.timestamp <= PENDING_KEY_EXCHANGE_TTL_MS);
    }

    /// Close every socket (1001) and clear all state.
    pub fn stop(&self) {
        let registry = &mut *self.registry.lock();
        for connection in registry.connections.values() {
            connection.sink.close(CLOSE_GOING_AWAY);
        }
        registry.connections.clear();
        registry.by_public_key.clear();
        self.pending_key_exchanges.lock().clear();
    }
}
