//! Packet identifiers and in-flight QoS 1/2 tracking

use std::time::{Duration, Instant};

use ahash::AHashMap;

use super::queue::QueuedDelivery;
use crate::message::ApplicationMessage;
use crate::protocol::{Packet, PubRel, QoS};

/// Hands out packet identifiers in 1..=65535, wrapping back to 1
#[derive(Debug)]
pub struct PacketIdAllocator {
    next: u16,
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    #[cfg(test)]
    pub(crate) fn starting_at(next: u16) -> Self {
        Self { next: next.max(1) }
    }

    /// Next identifier for which `in_use` is false
    ///
    /// Returns `None` only when every identifier is taken.
    pub fn allocate(&mut self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next;
            self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
            if !in_use(id) {
                return Some(id);
            }
        }
        None
    }
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Where an outbound QoS 1/2 delivery is in its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    AwaitingPubAck,
    AwaitingPubRec,
    AwaitingPubComp,
}

#[derive(Debug, Clone)]
pub struct OutboundFlight {
    pub delivery: QueuedDelivery,
    pub state: OutboundState,
    pub sent_at: Instant,
    pub retries: u32,
    seq: u64,
}

impl OutboundFlight {
    fn packet_id(&self) -> u16 {
        self.delivery.packet_id.unwrap_or_default()
    }

    /// Packet to send again for this flight
    pub fn resend_packet(&self) -> Packet {
        match self.state {
            OutboundState::AwaitingPubComp => Packet::PubRel(PubRel::new(self.packet_id())),
            _ => {
                let mut publish = self.delivery.to_publish();
                publish.dup = true;
                Packet::Publish(publish)
            }
        }
    }
}

/// Result of acknowledging an outbound packet id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Delivery finished, the id is free again
    Completed,
    /// PUBREC accepted, send PUBREL
    Released,
    /// No flight for this id, or the flight is in another state
    Unknown,
}

/// A delivery that gave up after too many retries
#[derive(Debug, Clone)]
pub struct FailedDelivery {
    pub packet_id: u16,
    pub delivery: QueuedDelivery,
    pub retries: u32,
}

/// Output of a retransmission pass
#[derive(Debug, Default)]
pub struct Retransmissions {
    pub packets: Vec<Packet>,
    pub failed: Vec<FailedDelivery>,
}

/// Outbound flights keyed by packet id and inbound QoS 2 messages awaiting
/// PUBREL
#[derive(Debug, Default)]
pub struct InflightWindow {
    outbound: AHashMap<u16, OutboundFlight>,
    inbound: AHashMap<u16, ApplicationMessage>,
    next_seq: u64,
}

impl InflightWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.outbound.contains_key(&packet_id)
    }

    pub fn get(&self, packet_id: u16) -> Option<&OutboundFlight> {
        self.outbound.get(&packet_id)
    }

    /// Register a freshly sent QoS 1/2 delivery
    pub fn track(&mut self, delivery: QueuedDelivery, now: Instant) {
        let Some(packet_id) = delivery.packet_id else {
            return;
        };
        let state = if delivery.qos == QoS::ExactlyOnce {
            OutboundState::AwaitingPubRec
        } else {
            OutboundState::AwaitingPubAck
        };
        self.next_seq += 1;
        self.outbound.insert(
            packet_id,
            OutboundFlight {
                delivery,
                state,
                sent_at: now,
                retries: 0,
                seq: self.next_seq,
            },
        );
    }

    pub fn puback(&mut self, packet_id: u16) -> AckOutcome {
        self.complete_if(packet_id, OutboundState::AwaitingPubAck)
    }

    /// `accepted` is false for a v5 PUBREC carrying an error reason, which
    /// ends the exchange
    pub fn pubrec(&mut self, packet_id: u16, accepted: bool, now: Instant) -> AckOutcome {
        match self.outbound.get_mut(&packet_id) {
            Some(flight) if flight.state == OutboundState::AwaitingPubRec => {
                if !accepted {
                    self.outbound.remove(&packet_id);
                    return AckOutcome::Completed;
                }
                flight.state = OutboundState::AwaitingPubComp;
                flight.sent_at = now;
                flight.retries = 0;
                AckOutcome::Released
            }
            // duplicate PUBREC after our PUBREL was lost
            Some(flight) if flight.state == OutboundState::AwaitingPubComp => AckOutcome::Released,
            _ => AckOutcome::Unknown,
        }
    }

    pub fn pubcomp(&mut self, packet_id: u16) -> AckOutcome {
        self.complete_if(packet_id, OutboundState::AwaitingPubComp)
    }

    fn complete_if(&mut self, packet_id: u16, expected: OutboundState) -> AckOutcome {
        match self.outbound.get(&packet_id) {
            Some(flight) if flight.state == expected => {
                self.outbound.remove(&packet_id);
                AckOutcome::Completed
            }
            _ => AckOutcome::Unknown,
        }
    }

    /// Resend or give up on flights not acknowledged within `ack_timeout`
    pub fn collect_retransmissions(
        &mut self,
        now: Instant,
        ack_timeout: Duration,
        max_retries: u32,
    ) -> Retransmissions {
        let mut due: Vec<(u64, u16)> = self
            .outbound
            .iter()
            .filter(|(_, f)| now.saturating_duration_since(f.sent_at) >= ack_timeout)
            .map(|(id, f)| (f.seq, *id))
            .collect();
        due.sort_unstable();

        let mut out = Retransmissions::default();
        for (_, packet_id) in due {
            let Some(flight) = self.outbound.get_mut(&packet_id) else {
                continue;
            };
            if flight.retries >= max_retries {
                if let Some(flight) = self.outbound.remove(&packet_id) {
                    out.failed.push(FailedDelivery {
                        packet_id,
                        retries: flight.retries,
                        delivery: flight.delivery,
                    });
                }
                continue;
            }
            flight.retries += 1;
            flight.sent_at = now;
            out.packets.push(flight.resend_packet());
        }
        out
    }

    /// Every outbound flight in send order, restarting their timers
    ///
    /// Used when a persistent session is resumed on a new connection.
    pub fn resend_all(&mut self, now: Instant) -> Vec<Packet> {
        let mut flights: Vec<&mut OutboundFlight> = self.outbound.values_mut().collect();
        flights.sort_unstable_by_key(|f| f.seq);
        flights
            .into_iter()
            .map(|f| {
                f.sent_at = now;
                f.resend_packet()
            })
            .collect()
    }

    /// Store an inbound QoS 2 message until its PUBREL arrives
    ///
    /// Returns false when the id is already awaiting release; the stored
    /// message is kept and the duplicate is ignored.
    pub fn store_inbound(&mut self, packet_id: u16, message: ApplicationMessage) -> bool {
        if self.inbound.contains_key(&packet_id) {
            return false;
        }
        self.inbound.insert(packet_id, message);
        true
    }

    pub fn awaiting_release(&self, packet_id: u16) -> bool {
        self.inbound.contains_key(&packet_id)
    }

    pub fn release_inbound(&mut self, packet_id: u16) -> Option<ApplicationMessage> {
        self.inbound.remove(&packet_id)
    }

    pub fn clear(&mut self) {
        self.outbound.clear();
        self.inbound.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn delivery(id: u16, qos: QoS) -> QueuedDelivery {
        let msg = ApplicationMessage::new("t", "p", qos, false).unwrap();
        let mut d = QueuedDelivery::new(msg, None, qos, false);
        d.packet_id = Some(id);
        d
    }

    #[test]
    fn test_allocator_wraps_and_skips_zero() {
        let mut ids = PacketIdAllocator { next: 65534 };
        assert_eq!(ids.allocate(|_| false), Some(65534));
        assert_eq!(ids.allocate(|_| false), Some(65535));
        assert_eq!(ids.allocate(|_| false), Some(1));
    }

    #[test]
    fn test_allocator_skips_in_use() {
        let mut ids = PacketIdAllocator::new();
        assert_eq!(ids.allocate(|id| id < 4), Some(4));
        assert_eq!(ids.allocate(|_| true), None);
    }

    #[test]
    fn test_qos1_flow() {
        let mut window = InflightWindow::new();
        window.track(delivery(1, QoS::AtLeastOnce), Instant::now());
        assert_eq!(window.pubcomp(1), AckOutcome::Unknown);
        assert_eq!(window.puback(1), AckOutcome::Completed);
        assert_eq!(window.puback(1), AckOutcome::Unknown);
        assert_eq!(window.outbound_len(), 0);
    }

    #[test]
    fn test_qos2_flow() {
        let now = Instant::now();
        let mut window = InflightWindow::new();
        window.track(delivery(9, QoS::ExactlyOnce), now);

        assert_eq!(window.puback(9), AckOutcome::Unknown);
        assert_eq!(window.pubrec(9, true, now), AckOutcome::Released);
        assert_eq!(window.get(9).unwrap().state, OutboundState::AwaitingPubComp);
        assert_eq!(window.pubrec(9, true, now), AckOutcome::Released);
        assert_eq!(window.pubcomp(9), AckOutcome::Completed);
        assert!(!window.contains(9));
    }

    #[test]
    fn test_pubrec_error_ends_flow() {
        let now = Instant::now();
        let mut window = InflightWindow::new();
        window.track(delivery(3, QoS::ExactlyOnce), now);
        assert_eq!(window.pubrec(3, false, now), AckOutcome::Completed);
        assert!(!window.contains(3));
    }

    #[test]
    fn test_retransmit_then_fail() {
        let start = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut window = InflightWindow::new();
        window.track(delivery(1, QoS::AtLeastOnce), start);
        window.track(delivery(2, QoS::ExactlyOnce), start);
        window.pubrec(2, true, start);

        assert!(window
            .collect_retransmissions(start + Duration::from_secs(5), timeout, 1)
            .packets
            .is_empty());

        let first = window.collect_retransmissions(start + timeout, timeout, 1);
        assert!(first.failed.is_empty());
        assert_eq!(first.packets.len(), 2);
        match &first.packets[0] {
            Packet::Publish(p) => {
                assert!(p.dup);
                assert_eq!(p.packet_id, Some(1));
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        }
        assert_eq!(first.packets[1], Packet::PubRel(PubRel::new(2)));

        let second = window.collect_retransmissions(start + timeout * 2, timeout, 1);
        assert!(second.packets.is_empty());
        let mut failed: Vec<u16> = second.failed.iter().map(|f| f.packet_id).collect();
        failed.sort_unstable();
        assert_eq!(failed, vec![1, 2]);
        assert_eq!(window.outbound_len(), 0);
    }

    #[test]
    fn test_resend_all_in_send_order() {
        let now = Instant::now();
        let mut window = InflightWindow::new();
        for id in [7, 3, 5] {
            window.track(delivery(id, QoS::AtLeastOnce), now);
        }
        let ids: Vec<Option<u16>> = window
            .resend_all(now)
            .into_iter()
            .map(|p| match p {
                Packet::Publish(p) => p.packet_id,
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![Some(7), Some(3), Some(5)]);
    }

    #[test]
    fn test_inbound_dedupe() {
        let mut window = InflightWindow::new();
        let msg = ApplicationMessage::new("t", "first", QoS::ExactlyOnce, false).unwrap();
        let dup = ApplicationMessage::new("t", "second", QoS::ExactlyOnce, false).unwrap();

        assert!(window.store_inbound(4, msg));
        assert!(!window.store_inbound(4, dup));
        assert!(window.awaiting_release(4));
        assert_eq!(&window.release_inbound(4).unwrap().payload()[..], b"first");
        assert!(window.release_inbound(4).is_none());
    }
}
