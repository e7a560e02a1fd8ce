//! In-memory message buffering for offline sync
//!
//! The server stores only opaque ciphertext blobs keyed by public identity.
//! Every message is inserted into two append-only indexes (by recipient and
//! by sender) as cheap value copies; delivery state is updated in both.
//!
//! Retention: per-key lists cap at 10 000 entries (oldest dropped), and
//! entries older than 30 days are pruned by the hourly housekeeping tick.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use pm_proto::api::SyncMessage;

pub const MAX_MESSAGES_PER_KEY: usize = 10_000;
pub const RETENTION_MS: i64 = 30 * 24 * 60 * 60 * 1000;
pub const SYNC_DEFAULT_LIMIT: usize = 1_000;
pub const CONVERSATION_DEFAULT_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub sender_key: String,
    pub recipient_key: String,
    /// Opaque to the server; routed and stored verbatim.
    pub encrypted_content: serde_json::Value,
    pub timestamp: i64,
    pub delivered: bool,
    pub delivered_to: HashSet<String>,
}

impl StoredMessage {
    pub fn to_sync_message(&self) -> SyncMessage {
        SyncMessage {
            id: self.id.clone(),
            sender_key: self.sender_key.clone(),
            recipient_key: self.recipient_key.clone(),
            encrypted_content: self.encrypted_content.clone(),
            timestamp: self.timestamp,
            delivered: self.delivered,
        }
    }
}

#[derive(Default)]
struct Indexes {
    by_recipient: HashMap<String, Vec<StoredMessage>>,
    by_sender: HashMap<String, Vec<StoredMessage>>,
    counter: u64,
}

#[derive(Default)]
pub struct MessageStore {
    inner: Mutex<Indexes>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one message under both indexes; returns the new message id.
    pub fn store(
        &self,
        sender_key: &str,
        recipient_key: &str,
        encrypted_content: serde_json::Value,
    ) -> String {
        self.store_at(
            sender_key,
            recipient_key,
            encrypted_content,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    pub(crate) fn store_at(
        &self,
        sender_key: &str,
        recipient_key: &str,
        encrypted_content: serde_json::Value,
        now: i64,
    ) -> String {
        let inner = &mut *self.inner.lock();
        inner.counter += 1;
        let id = format!("msg_{now}_{}", inner.counter);

        let message = StoredMessage {
            id: id.clone(),
            sender_key: sender_key.to_string(),
            recipient_key: recipient_key.to_string(),
            encrypted_content,
            timestamp: now,
            delivered: false,
            delivered_to: HashSet::new(),
        };

        for (index_key, index) in [
            (recipient_key, &mut inner.by_recipient),
            (sender_key, &mut inner.by_sender),
        ] {
            let list = index.entry(index_key.to_string()).or_default();
            list.push(message.clone());
            if list.len() > MAX_MESSAGES_PER_KEY {
                list.remove(0);
            }
        }
        id
    }

    /// Everything sent or received by `key` after `since`, ascending by
    /// timestamp, truncated to the newest `limit` entries.
    pub fn get_for_user(&self, key: &str, since: Option<i64>, limit: usize) -> Vec<StoredMessage> {
        let inner = self.inner.lock();
        let mut seen = HashSet::new();
        let mut merged: Vec<StoredMessage> = inner
            .by_recipient
            .get(key)
            .into_iter()
            .chain(inner.by_sender.get(key))
            .flatten()
            .filter(|m| since.map_or(true, |s| m.timestamp > s))
            .filter(|m| seen.insert(m.id.clone()))
            .cloned()
            .collect();
        merged.sort_by_key(|m| m.timestamp);
        if merged.len() > limit {
            merged.drain(..merged.len() - limit);
        }
        merged
    }

    /// The two-party slice of `get_for_user`.
    pub fn get_conversation(
        &self,
        a: &str,
        b: &str,
        since: Option<i64>,
        limit: usize,
    ) -> Vec<StoredMessage> {
        let mut merged = self.get_for_user(a, since, usize::MAX);
        merged.retain(|m| {
            (m.sender_key == a && m.recipient_key == b)
                || (m.sender_key == b && m.recipient_key == a)
        });
        if merged.len() > limit {
            merged.drain(..merged.len() - limit);
        }
        merged
    }

    pub fn get_undelivered(&self, recipient_key: &str) -> Vec<StoredMessage> {
        let inner = self.inner.lock();
        inner
            .by_recipient
            .get(recipient_key)
            .map(|list| list.iter().filter(|m| !m.delivered).cloned().collect())
            .unwrap_or_default()
    }

    /// Record delivery of `id` to one device. Both index copies are updated
    /// so later reads agree.
    pub fn mark_delivered(&self, id: &str, client_id: &str) -> bool {
        let inner = &mut *self.inner.lock();
        let mut found = false;
        for index in [&mut inner.by_recipient, &mut inner.by_sender] {
            for list in index.values_mut() {
                for message in list.iter_mut().filter(|m| m.id == id) {
                    message.delivered = true;
                    message.delivered_to.insert(client_id.to_string());
                    found = true;
                }
            }
        }
        found
    }

    /// Remove every message sent or received by `key`; returns the count of
    /// distinct messages removed.
    pub fn delete_all_for_user(&self, key: &str) -> usize {
        let inner = &mut *self.inner.lock();
        let mut removed = HashSet::new();
        for list in [inner.by_recipient.remove(key), inner.by_sender.remove(key)]
            .into_iter()
            .flatten()
        {
            for message in list {
                removed.insert(message.id);
            }
        }
        // The counterpart indexes still hold copies; drop those too.
        for index in [&mut inner.by_recipient, &mut inner.by_sender] {
            for list in index.values_mut() {
                list.retain(|m| !removed.contains(&m.id));
            }
        }
        removed.len()
    }

    pub fn delete_conversation(&self, a: &str, b: &str) -> usize {
        let inner = &mut *self.inner.lock();
        let mut removed = HashSet::new();
        for index in [&mut inner.by_recipient, &mut inner.by_sender] {
            for list in index.values_mut() {
                list.retain(|m| {
                    let in_conversation = (m.sender_key == a && m.recipient_key == b)
                        || (m.sender_key == b && m.recipient_key == a);
                    if in_conversation {
                        removed.insert(m.id.clone());
                    }
                    !in_conversation
                });
            }
        }
        removed.len()
    }

    /// Hourly retention pass: drop everything older than 30 days.
    pub fn prune_expired(&self) -> usize {
        self.prune_expired_at(chrono::Utc::now().timestamp_millis())
    }

    pub(crate) fn prune_expired_at(&self, now: i64) -> usize {
        let cutoff = now - RETENTION_MS;
        let inner = &mut *self.inner.lock();
        let mut removed = HashSet::new();
        for index in [&mut inner.by_recipient, &mut inner.by_sender] {
            for list in index.values_mut() {
                list.retain(|m| {
                    if m.timestamp < cutoff {
                        removed.insert(m.id.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            index.retain(|_, list| !list.is_empty());
        }
        removed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(tag: &str) -> serde_json::Value {
        serde_json::json!({ "e": tag })
    }

    #[test]
    fn ids_carry_timestamp_and_counter() {
        let store = MessageStore::new();
        let id1 = store.store_at("a", "b", blob("1"), 1700);
        let id2 = store.store_at("a", "b", blob("2"), 1700);
        assert_eq!(id1, "msg_1700_1");
        assert_eq!(id2, "msg_1700_2");
    }

    #[test]
    fn get_for_user_merges_and_orders() {
        let store = MessageStore::new();
        store.store_at("a", "b", blob("1"), 30);
        store.store_at("b", "a", blob("2"), 10);
        store.store_at("a", "c", blob("3"), 20);

        let messages = store.get_for_user("a", None, SYNC_DEFAULT_LIMIT);
        assert_eq!(messages.len(), 3);
        let stamps: Vec<i64> = messages.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![10, 20, 30]);
    }

    #[test]
    fn since_filter_is_strictly_greater() {
        let store = MessageStore::new();
        store.store_at("a", "b", blob("1"), 100);
        store.store_at("a", "b", blob("2"), 200);

        let messages = store.get_for_user("a", Some(100), SYNC_DEFAULT_LIMIT);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].timestamp, 200);
        assert!(store.get_for_user("a", Some(200), SYNC_DEFAULT_LIMIT).is_empty());
    }

    #[test]
    fn limit_keeps_the_newest() {
        let store = MessageStore::new();
        for i in 0..10 {
            store.store_at("a", "b", blob(&i.to_string()), i);
        }
        let messages = store.get_for_user("a", None, 3);
        let stamps: Vec<i64> = messages.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![7, 8, 9]);
    }

    #[test]
    fn conversation_filters_both_directions() {
        let store = MessageStore::new();
        store.store_at("a", "b", blob("ab"), 1);
        store.store_at("b", "a", blob("ba"), 2);
        store.store_at("a", "c", blob("ac"), 3);
        store.store_at("c", "a", blob("ca"), 4);

        let conversation = store.get_conversation("a", "b", None, CONVERSATION_DEFAULT_LIMIT);
        assert_eq!(conversation.len(), 2);
        assert!(conversation.iter().all(|m| {
            (m.sender_key == "a" && m.recipient_key == "b")
                || (m.sender_key == "b" && m.recipient_key == "a")
        }));
    }

    #[test]
    fn delivery_updates_both_indexes() {
        let store = MessageStore::new();
        let id = store.store_at("a", "b", blob("x"), 1);
        assert_eq!(store.get_undelivered("b").len(), 1);

        assert!(store.mark_delivered(&id, "client-1"));
        assert!(store.get_undelivered("b").is_empty());

        let from_sender = store.get_for_user("a", None, 10);
        assert!(from_sender[0].delivered);
        assert!(from_sender[0].delivered_to.contains("client-1"));
        assert!(!store.mark_delivered("msg_nope_0", "client-1"));
    }

    #[test]
    fn per_key_cap_drops_oldest() {
        let store = MessageStore::new();
        for i in 0..(MAX_MESSAGES_PER_KEY as i64 + 5) {
            store.store_at("a", "b", blob("x"), i);
        }
        let messages = store.get_for_user("b", None, usize::MAX);
        assert_eq!(messages.len(), MAX_MESSAGES_PER_KEY);
        assert_eq!(messages[0].timestamp, 5);
    }

    #[test]
    fn deletes_report_distinct_counts() {
        let store = MessageStore::new();
        store.store_at("a", "b", blob("1"), 1);
        store.store_at("b", "a", blob("2"), 2);
        store.store_at("a", "c", blob("3"), 3);

        assert_eq!(store.delete_conversation("a", "b"), 2);
        assert_eq!(store.get_for_user("a", None, 10).len(), 1);
        assert_eq!(store.delete_all_for_user("a"), 1);
        assert!(store.get_for_user("c", None, 10).is_empty());
    }

    #[test]
    fn retention_prunes_old_messages() {
        let store = MessageStore::new();
        let now = RETENTION_MS + 1_000_000;
        store.store_at("a", "b", blob("old"), 500);
        store.store_at("a", "b", blob("new"), now - 1000);

        assert_eq!(store.prune_expired_at(now), 1);
        let remaining = store.get_for_user("a", None, 10);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].timestamp, now - 1000);
    }
}
