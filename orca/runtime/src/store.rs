//! Latest-value message store shared by every module in a run.

use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::json;
use shared_audit::{AuditSink, NullAuditSink};

use crate::{
    error::StoreError,
    message::{Inputs, Message, Snapshot},
};

/// Holds the single most recent [`Message`] per topic.
///
/// Publishing replaces, never mutates. Subscriber lists are bookkeeping for
/// inspection only and are never consulted when routing.
pub struct MessageStore {
    latest: RwLock<IndexMap<String, Arc<Message>>>,
    subscribers: RwLock<IndexMap<String, Vec<String>>>,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStore")
            .field("topics", &self.latest.read().keys().collect::<Vec<_>>())
            .field("subscribers", &*self.subscribers.read())
            .finish()
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(Arc::new(NullAuditSink))
    }
}

impl MessageStore {
    /// Creates an empty store reporting publishes to `audit`.
    #[must_use]
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            latest: RwLock::new(IndexMap::new()),
            subscribers: RwLock::new(IndexMap::new()),
            audit,
        }
    }

    /// Stores `message` as the latest value of its topic (last write wins).
    pub fn publish(&self, message: Message) -> Result<Arc<Message>, StoreError> {
        if message.topic().is_empty() {
            return Err(StoreError::InvalidTopic);
        }
        let message = Arc::new(message);
        self.latest
            .write()
            .insert(message.topic().to_string(), Arc::clone(&message));
        self.audit.record(
            "message_sent",
            json!({ "topic": message.topic(), "sender": message.sender() }),
        );
        Ok(message)
    }

    /// Whether anything was published on `topic` since the last reset.
    #[must_use]
    pub fn has_topic(&self, topic: &str) -> bool {
        self.latest.read().contains_key(topic)
    }

    /// Whether every topic in `topics` is present, judged under one read lock.
    #[must_use]
    pub fn has_all(&self, topics: &[String]) -> bool {
        let latest = self.latest.read();
        topics.iter().all(|topic| latest.contains_key(topic))
    }

    /// Most recent message on `topic`.
    pub fn get_latest(&self, topic: &str) -> Result<Arc<Message>, StoreError> {
        self.latest
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(topic.to_string()))
    }

    /// Current messages for the requested topics; absent topics are omitted.
    #[must_use]
    pub fn collect(&self, topics: &[String]) -> Inputs {
        let latest = self.latest.read();
        topics
            .iter()
            .filter_map(|topic| latest.get(topic).map(|msg| (topic.clone(), Arc::clone(msg))))
            .collect()
    }

    /// Defensive copy of the whole store.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.latest.read().clone()
    }

    /// Number of topics currently holding a message.
    #[must_use]
    pub fn len(&self) -> usize {
        self.latest.read().len()
    }

    /// Whether no topic holds a message.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.latest.read().is_empty()
    }

    /// Registers `module_id` as a subscriber of `topic`. Idempotent.
    pub fn subscribe(&self, topic: &str, module_id: &str) -> Result<(), StoreError> {
        if topic.is_empty() || module_id.is_empty() {
            return Err(StoreError::InvalidArgument);
        }
        let mut subscribers = self.subscribers.write();
        let entry = subscribers.entry(topic.to_string()).or_default();
        if !entry.iter().any(|id| id == module_id) {
            entry.push(module_id.to_string());
        }
        Ok(())
    }

    /// Modules subscribed to `topic`, in registration order.
    #[must_use]
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.subscribers
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Full subscription table.
    #[must_use]
    pub fn subscriptions(&self) -> IndexMap<String, Vec<String>> {
        self.subscribers.read().clone()
    }

    /// Drops every stored message. Subscriptions survive.
    pub fn reset(&self) {
        self.latest.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_audit::MemoryAuditBus;
    use std::thread;

    fn msg(topic: &str, value: i64, sender: &str) -> Message {
        Message::new(topic, json!(value), sender)
    }

    #[test]
    fn last_write_wins() {
        let store = MessageStore::default();
        assert!(!store.has_topic("x"));
        store.publish(msg("x", 1, "a")).unwrap();
        let second = store.publish(msg("x", 2, "b")).unwrap();
        let latest = store.get_latest("x").unwrap();
        assert_eq!(latest.id(), second.id());
        assert_eq!(latest.sender(), "b");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn empty_topic_is_rejected() {
        let store = MessageStore::default();
        assert_eq!(
            store.publish(msg("", 1, "a")).unwrap_err(),
            StoreError::InvalidTopic
        );
        assert!(store.is_empty());
    }

    #[test]
    fn missing_topic_is_not_found() {
        let store = MessageStore::default();
        assert_eq!(
            store.get_latest("ghost").unwrap_err(),
            StoreError::NotFound("ghost".into())
        );
    }

    #[test]
    fn publish_emits_audit_event() {
        let bus = Arc::new(MemoryAuditBus::new(8));
        let store = MessageStore::new(bus.clone());
        store.publish(msg("x", 1, "sensor")).unwrap();
        let events = bus.events_of("message_sent");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fields, json!({ "topic": "x", "sender": "sensor" }));
    }

    #[test]
    fn subscribe_is_idempotent_and_validated() {
        let store = MessageStore::default();
        store.subscribe("x", "b").unwrap();
        store.subscribe("x", "b").unwrap();
        store.subscribe("x", "c").unwrap();
        assert_eq!(store.subscribers("x"), vec!["b", "c"]);
        assert_eq!(store.subscribe("", "b"), Err(StoreError::InvalidArgument));
        assert_eq!(store.subscribe("x", ""), Err(StoreError::InvalidArgument));
    }

    #[test]
    fn reset_clears_messages_and_keeps_subscriptions() {
        let store = MessageStore::default();
        store.subscribe("x", "b").unwrap();
        store.publish(msg("x", 1, "a")).unwrap();
        let before = store.subscriptions();
        store.reset();
        assert!(store.is_empty());
        store.reset();
        assert!(store.is_empty());
        assert_eq!(store.subscriptions(), before);
    }

    #[test]
    fn collect_omits_absent_topics() {
        let store = MessageStore::default();
        store.publish(msg("x", 1, "a")).unwrap();
        let topics = vec!["x".to_string(), "y".to_string()];
        assert!(!store.has_all(&topics));
        let inputs = store.collect(&topics);
        assert_eq!(inputs.keys().collect::<Vec<_>>(), vec!["x"]);
    }

    #[test]
    fn snapshot_is_isolated_from_later_publishes() {
        let store = MessageStore::default();
        store.publish(msg("x", 1, "a")).unwrap();
        let snapshot = store.snapshot();
        store.publish(msg("x", 2, "a")).unwrap();
        store.publish(msg("y", 3, "a")).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["x"].payload().as_reward(), Some(1.0));
    }

    #[test]
    fn concurrent_publishes_on_disjoint_topics_are_not_lost() {
        let store = Arc::new(MessageStore::default());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for round in 0..50 {
                        store
                            .publish(msg(&format!("t{worker}"), round, "w"))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 8);
        for worker in 0..8 {
            let latest = store.get_latest(&format!("t{worker}")).unwrap();
            assert_eq!(latest.payload().as_reward(), Some(49.0));
        }
    }
}
