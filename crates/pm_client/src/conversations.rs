//! Local conversation state
//!
//! Plain owned collections: peer public key → ordered message list. The UI
//! binding layer (whatever renders this) subscribes on top; nothing here is
//! reactive or persistent.

use std::collections::HashMap;

use pm_proto::api::{IncomingMessagePayload, SyncMessage};

#[derive(Debug, Clone, PartialEq)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone)]
pub struct ConversationEntry {
    pub message_id: String,
    pub direction: Direction,
    /// Still encrypted; decryption is the session engine's job.
    pub encrypted_content: serde_json::Value,
    pub timestamp: i64,
}

#[derive(Debug, Default)]
pub struct ConversationLog {
    conversations: HashMap<String, Vec<ConversationEntry>>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame pushed by the server. The peer is the sender unless
    /// the frame is a mirror of our own send, in which case it is the
    /// recipient.
    pub fn record_incoming(&mut self, payload: &IncomingMessagePayload) {
        let sent_by_me = payload.is_sent_by_me.unwrap_or(false);
        let (peer, direction) = if sent_by_me {
            (payload.recipient_key.clone(), Direction::Sent)
        } else {
            (payload.sender_key.clone(), Direction::Received)
        };
        self.push(
            peer,
            ConversationEntry {
                message_id: payload.message_id.clone(),
                direction,
                encrypted_content: payload.encrypted_content.clone(),
                timestamp: payload.timestamp,
            },
        );
    }

    /// Record an entry from a sync response; `our_key` disambiguates
    /// direction.
    pub fn record_synced(&mut self, message: &SyncMessage, our_key: &str) {
        let (peer, direction) = if message.sender_key == our_key {
            (message.recipient_key.clone(), Direction::Sent)
        } else {
            (message.sender_key.clone(), Direction::Received)
        };
        self.push(
            peer,
            ConversationEntry {
                message_id: message.id.clone(),
                direction,
                encrypted_content: message.encrypted_content.clone(),
                timestamp: message.timestamp,
            },
        );
    }

    fn push(&mut self, peer: String, entry: ConversationEntry) {
        let list = self.conversations.entry(peer).or_default();
        // Sync responses can overlap live deliveries; keep one copy per id.
        if list.iter().any(|e| e.message_id == entry.message_id) {
            return;
        }
        let position = list
            .iter()
            .rposition(|e| e.timestamp <= entry.timestamp)
            .map(|p| p + 1)
            .unwrap_or(0);
        list.insert(position, entry);
    }

    /// Drop a single message, e.g. after a burn-after-read was displayed.
    pub fn forget_message(&mut self, peer: &str, message_id: &str) -> bool {
        let Some(list) = self.conversations.get_mut(peer) else {
            return false;
        };
        let before = list.len();
        list.retain(|e| e.message_id != message_id);
        before != list.len()
    }

    pub fn entries(&self, peer: &str) -> &[ConversationEntry] {
        self.conversations
            .get(peer)
            .map(|list| list.as_slice())
            .unwrap_or(&[])
    }

    pub fn peers(&self) -> impl Iterator<Item = &String> {
        self.conversations.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synced(id: &str, from: &str, to: &str, timestamp: i64) -> SyncMessage {
        SyncMessage {
            id: id.into(),
            sender_key: from.into(),
            recipient_key: to.into(),
            encrypted_content: serde_json::json!({"e": id}),
            timestamp,
            delivered: true,
        }
    }

    #[test]
    fn direction_follows_our_key() {
        let mut log = ConversationLog::new();
        log.record_synced(&synced("m1", "me", "bob", 1), "me");
        log.record_synced(&synced("m2", "bob", "me", 2), "me");

        let entries = log.entries("bob");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].direction, Direction::Sent);
        assert_eq!(entries[1].direction, Direction::Received);
        assert!(log.entries("carol").is_empty());
    }

    #[test]
    fn duplicates_by_id_are_ignored() {
        let mut log = ConversationLog::new();
        log.record_synced(&synced("m1", "bob", "me", 1), "me");
        log.record_synced(&synced("m1", "bob", "me", 1), "me");
        assert_eq!(log.entries("bob").len(), 1);
    }

    #[test]
    fn entries_stay_ordered_by_timestamp() {
        let mut log = ConversationLog::new();
        log.record_synced(&synced("m3", "bob", "me", 30), "me");
        log.record_synced(&synced("m1", "bob", "me", 10), "me");
        log.record_synced(&synced("m2", "bob", "me", 20), "me");

        let stamps: Vec<i64> = log.entries("bob").iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![10, 20, 30]);
    }

    #[test]
    fn forget_removes_burned_messages() {
        let mut log = ConversationLog::new();
        log.record_synced(&synced("m1", "bob", "me", 1), "me");
        assert!(log.forget_message("bob", "m1"));
        assert!(!log.forget_message("bob", "m1"));
        assert!(log.entries("bob").is_empty());
    }
}
