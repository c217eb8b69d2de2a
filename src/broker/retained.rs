//! Retained message store
//!
//! At most one message per topic. Storing a retained message with an empty
//! payload deletes the entry instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::message::ApplicationMessage;
use crate::topic::matches;

#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub message: ApplicationMessage,
    pub stored_at: Instant,
}

impl RetainedMessage {
    fn is_expired(&self, now: Instant) -> bool {
        match self.message.properties().message_expiry_interval {
            Some(secs) => now.saturating_duration_since(self.stored_at) >= Duration::from_secs(secs as u64),
            None => false,
        }
    }
}

/// What a publish did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainedUpdate {
    Stored,
    Deleted,
    /// The message was not marked retained
    Ignored,
}

#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: DashMap<Arc<str>, RetainedMessage>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a published message
    pub fn publish(&self, message: &ApplicationMessage) -> RetainedUpdate {
        if !message.retain() {
            return RetainedUpdate::Ignored;
        }
        if message.payload().is_empty() {
            self.messages.remove(message.topic());
            return RetainedUpdate::Deleted;
        }
        self.messages.insert(
            message.topic_arc().clone(),
            RetainedMessage {
                message: message.clone(),
                stored_at: Instant::now(),
            },
        );
        RetainedUpdate::Stored
    }

    /// One message per stored topic matching any of `filters`
    ///
    /// Expired messages are skipped and removed.
    pub fn get(&self, filters: &[&str]) -> Vec<ApplicationMessage> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut found = Vec::new();

        for entry in self.messages.iter() {
            if !filters.iter().any(|f| matches(f, entry.key())) {
                continue;
            }
            if entry.value().is_expired(now) {
                expired.push(entry.key().clone());
            } else {
                found.push(entry.value().message.clone());
            }
        }

        for topic in expired {
            self.messages
                .remove_if(&topic, |_, retained| retained.is_expired(now));
        }
        found
    }

    pub fn get_topic(&self, topic: &str) -> Option<ApplicationMessage> {
        self.messages.get(topic).map(|e| e.message.clone())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageOptions;
    use crate::protocol::QoS;

    fn retained(topic: &str, payload: &'static str) -> ApplicationMessage {
        ApplicationMessage::new(topic, payload, QoS::AtLeastOnce, true).unwrap()
    }

    fn topics(mut msgs: Vec<ApplicationMessage>) -> Vec<String> {
        msgs.sort_by(|a, b| a.topic().cmp(b.topic()));
        msgs.iter().map(|m| m.topic().to_string()).collect()
    }

    #[test]
    fn test_store_replace_delete() {
        let store = RetainedStore::new();
        assert_eq!(store.publish(&retained("a/b", "1")), RetainedUpdate::Stored);
        assert_eq!(store.publish(&retained("a/b", "2")), RetainedUpdate::Stored);
        assert_eq!(store.len(), 1);
        assert_eq!(&store.get_topic("a/b").unwrap().payload()[..], b"2");

        assert_eq!(store.publish(&retained("a/b", "")), RetainedUpdate::Deleted);
        assert!(store.is_empty());
    }

    #[test]
    fn test_non_retained_ignored() {
        let store = RetainedStore::new();
        let msg = ApplicationMessage::new("a", "x", QoS::AtMostOnce, false).unwrap();
        assert_eq!(store.publish(&msg), RetainedUpdate::Ignored);
        assert!(store.is_empty());
    }

    #[test]
    fn test_get_one_per_topic() {
        let store = RetainedStore::new();
        store.publish(&retained("x/y", "1"));
        store.publish(&retained("x/z", "2"));
        store.publish(&retained("q", "3"));
        store.publish(&retained("$SYS/up", "4"));

        assert_eq!(topics(store.get(&["x/+", "x/#", "x/y"])), vec!["x/y", "x/z"]);
        assert_eq!(topics(store.get(&["#"])), vec!["q", "x/y", "x/z"]);
        assert_eq!(topics(store.get(&["$SYS/#"])), vec!["$SYS/up"]);
        assert!(store.get(&[]).is_empty());
    }

    #[test]
    fn test_expired_removed() {
        let store = RetainedStore::new();
        let msg = MessageOptions {
            payload: "v".into(),
            retain: true,
            message_expiry_interval: Some(0),
            ..MessageOptions::new("e")
        }
        .build()
        .unwrap();
        store.publish(&msg);
        assert_eq!(store.len(), 1);
        assert!(store.get(&["e"]).is_empty());
        assert!(store.is_empty());
    }
}
