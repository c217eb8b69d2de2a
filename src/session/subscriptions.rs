//! Subscriptions held by one session

use crate::protocol::{QoS, SubscriptionOptions};
use crate::topic::TopicTrie;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub options: SubscriptionOptions,
    /// v5 subscription identifier from the SUBSCRIBE properties
    pub identifier: Option<u32>,
}

/// Combined result of every subscription matching one topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionMatch {
    /// Highest granted QoS among the matches
    pub qos: QoS,
    pub retain_as_published: bool,
    pub identifiers: Vec<u32>,
}

/// A session's subscriptions, indexed by filter
///
/// Subscribing to a filter that is already present replaces its options.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    index: TopicTrie<SubscriptionEntry>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `filter` was not subscribed before
    pub fn insert(&mut self, filter: &str, entry: SubscriptionEntry) -> bool {
        self.index.insert(filter, entry).is_none()
    }

    pub fn remove(&mut self, filter: &str) -> bool {
        self.index.remove(filter).is_some()
    }

    pub fn get(&self, filter: &str) -> Option<&SubscriptionEntry> {
        self.index.get(filter)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Match `topic` against every filter
    ///
    /// `from_self` skips subscriptions with `no_local` set.
    pub fn match_topic(&self, topic: &str, from_self: bool) -> Option<SubscriptionMatch> {
        let mut result: Option<SubscriptionMatch> = None;
        self.index.matches(topic, |entry| {
            if from_self && entry.options.no_local {
                return;
            }
            let m = result.get_or_insert_with(|| SubscriptionMatch {
                qos: entry.options.qos,
                retain_as_published: false,
                identifiers: Vec::new(),
            });
            m.qos = m.qos.max(entry.options.qos);
            m.retain_as_published |= entry.options.retain_as_published;
            if let Some(id) = entry.identifier {
                m.identifiers.push(id);
            }
        });
        if let Some(m) = result.as_mut() {
            m.identifiers.sort_unstable();
        }
        result
    }
}
