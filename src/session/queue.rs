//! Per-session outbound message queue

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::message::ApplicationMessage;
use crate::protocol::{Publish, QoS};

/// What to do when a message arrives at a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued delivery to make room
    #[default]
    DropOldest,
    /// Keep the queue as is and discard the new delivery
    RejectNewest,
}

/// A message waiting to be sent to one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedDelivery {
    pub message: ApplicationMessage,
    /// Client that published the message, `None` for broker-originated ones
    pub sender_client_id: Option<Arc<str>>,
    /// QoS the subscriber receives the message at
    pub qos: QoS,
    /// Sent with the RETAIN flag set
    pub is_retained: bool,
    /// Assigned when the delivery leaves the queue, only for QoS > 0
    pub packet_id: Option<u16>,
    /// Matching subscription identifiers (v5)
    pub subscription_identifiers: Vec<u32>,
    pub enqueued_at: Instant,
}

impl QueuedDelivery {
    pub fn new(
        message: ApplicationMessage,
        sender_client_id: Option<Arc<str>>,
        qos: QoS,
        is_retained: bool,
    ) -> Self {
        Self {
            message,
            sender_client_id,
            qos,
            is_retained,
            packet_id: None,
            subscription_identifiers: Vec::new(),
            enqueued_at: Instant::now(),
        }
    }

    /// Remaining message expiry, `Some(0)` once expired, `None` if the
    /// message never expires
    pub fn remaining_expiry(&self, now: Instant) -> Option<u32> {
        let interval = self.message.properties().message_expiry_interval?;
        let elapsed = now.saturating_duration_since(self.enqueued_at);
        Some(
            Duration::from_secs(interval as u64)
                .saturating_sub(elapsed)
                .as_secs() as u32,
        )
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.remaining_expiry(now) == Some(0)
    }

    /// Outbound PUBLISH for this delivery
    pub fn to_publish(&self) -> Publish {
        let mut publish = self
            .message
            .to_publish(self.qos, self.is_retained, self.packet_id);
        publish.properties.subscription_identifiers = self.subscription_identifiers.clone();
        if let Some(remaining) = self.remaining_expiry(Instant::now()) {
            publish.properties.message_expiry_interval = Some(remaining.max(1));
        }
        publish
    }
}

/// Result of [`ApplicationMessageQueue::enqueue`]
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queued after evicting the oldest delivery
    DroppedOldest(Box<QueuedDelivery>),
    /// Queue full, the new delivery was discarded
    Rejected,
}

impl EnqueueOutcome {
    pub fn is_overflow(&self) -> bool {
        !matches!(self, EnqueueOutcome::Queued)
    }
}

/// Bounded FIFO of deliveries for one session
///
/// Order is preserved across QoS levels.
#[derive(Debug)]
pub struct ApplicationMessageQueue {
    items: VecDeque<QueuedDelivery>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl ApplicationMessageQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    pub fn enqueue(&mut self, delivery: QueuedDelivery) -> EnqueueOutcome {
        if self.items.len() < self.capacity {
            self.items.push_back(delivery);
            return EnqueueOutcome::Queued;
        }

        match self.policy {
            OverflowPolicy::RejectNewest => EnqueueOutcome::Rejected,
            OverflowPolicy::DropOldest => {
                let dropped = self.items.pop_front();
                self.items.push_back(delivery);
                match dropped {
                    Some(d) => EnqueueOutcome::DroppedOldest(Box::new(d)),
                    None => EnqueueOutcome::Queued,
                }
            }
        }
    }

    /// Put a delivery back at the head, used when it cannot be sent yet
    pub(crate) fn requeue_front(&mut self, delivery: QueuedDelivery) {
        self.items.push_front(delivery);
    }

    pub fn dequeue_next(&mut self) -> Option<QueuedDelivery> {
        self.items.pop_front()
    }

    pub fn peek(&self) -> Option<&QueuedDelivery> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(n: u8, qos: QoS) -> QueuedDelivery {
        let msg = ApplicationMessage::new("t", vec![n], qos, false).unwrap();
        QueuedDelivery::new(msg, None, qos, false)
    }

    fn payload(d: &QueuedDelivery) -> u8 {
        d.message.payload()[0]
    }

    #[test]
    fn test_fifo_across_qos() {
        let mut queue = ApplicationMessageQueue::new(10, OverflowPolicy::DropOldest);
        queue.enqueue(delivery(1, QoS::ExactlyOnce));
        queue.enqueue(delivery(2, QoS::AtMostOnce));
        queue.enqueue(delivery(3, QoS::AtLeastOnce));

        let order: Vec<u8> = std::iter::from_fn(|| queue.dequeue_next())
            .map(|d| payload(&d))
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_drop_oldest() {
        let mut queue = ApplicationMessageQueue::new(2, OverflowPolicy::DropOldest);
        assert_eq!(queue.enqueue(delivery(1, QoS::AtMostOnce)), EnqueueOutcome::Queued);
        queue.enqueue(delivery(2, QoS::AtMostOnce));

        match queue.enqueue(delivery(3, QoS::AtMostOnce)) {
            EnqueueOutcome::DroppedOldest(d) => assert_eq!(payload(&d), 1),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(payload(queue.peek().unwrap()), 2);
    }

    #[test]
    fn test_reject_newest() {
        let mut queue = ApplicationMessageQueue::new(1, OverflowPolicy::RejectNewest);
        queue.enqueue(delivery(1, QoS::AtMostOnce));
        let outcome = queue.enqueue(delivery(2, QoS::AtMostOnce));
        assert_eq!(outcome, EnqueueOutcome::Rejected);
        assert!(outcome.is_overflow());
        assert_eq!(payload(&queue.dequeue_next().unwrap()), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_expiry() {
        let msg = crate::message::MessageOptions {
            message_expiry_interval: Some(5),
            ..crate::message::MessageOptions::new("t")
        }
        .build()
        .unwrap();
        let d = QueuedDelivery::new(msg, None, QoS::AtMostOnce, false);

        assert_eq!(d.remaining_expiry(d.enqueued_at), Some(5));
        assert!(!d.is_expired(d.enqueued_at + Duration::from_secs(4)));
        assert!(d.is_expired(d.enqueued_at + Duration::from_secs(5)));
        assert_eq!(delivery(1, QoS::AtMostOnce).remaining_expiry(Instant::now()), None);
    }
}
