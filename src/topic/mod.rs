//! Topic names, topic filters and subscription matching
//!
//! [`matches`] is the reference level-by-level algorithm. [`TopicTrie`] is an
//! index over many filters that returns the same results without scanning
//! every filter on each publish.

mod trie;
mod validation;

pub use trie::TopicTrie;
pub use validation::{matches, validate_topic_filter, validate_topic_name};

use crate::protocol::QoS;

/// QoS at which a message published on `topic` reaches a subscriber
///
/// `subscriptions` are `(filter, maximum QoS)` pairs. Returns `None` when no
/// filter matches; otherwise the lower of `published` and the highest
/// matching subscription QoS.
pub fn effective_qos<'a, I>(subscriptions: I, topic: &str, published: QoS) -> Option<QoS>
where
    I: IntoIterator<Item = (&'a str, QoS)>,
{
    subscriptions
        .into_iter()
        .filter(|(filter, _)| matches(filter, topic))
        .map(|(_, qos)| qos)
        .max()
        .map(|granted| granted.min(published))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_qos_takes_highest_subscription() {
        let subs = [("a/+", QoS::AtMostOnce), ("a/#", QoS::AtLeastOnce)];
        assert_eq!(
            effective_qos(subs, "a/b", QoS::ExactlyOnce),
            Some(QoS::AtLeastOnce)
        );
        assert_eq!(
            effective_qos(subs, "a/b", QoS::AtMostOnce),
            Some(QoS::AtMostOnce)
        );
    }

    #[test]
    fn test_effective_qos_not_subscribed() {
        let subs = [("x/y", QoS::ExactlyOnce)];
        assert_eq!(effective_qos(subs, "x/z", QoS::AtLeastOnce), None);
        assert_eq!(effective_qos(Vec::<(&str, QoS)>::new(), "x/y", QoS::AtLeastOnce), None);
    }

    #[test]
    fn test_effective_qos_capped_by_message() {
        let subs = [("x/+", QoS::ExactlyOnce)];
        assert_eq!(
            effective_qos(subs, "x/y", QoS::AtLeastOnce),
            Some(QoS::AtLeastOnce)
        );
    }
}
