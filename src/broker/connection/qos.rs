//! QoS acknowledgment handling (PUBACK, PUBREC, PUBREL, PUBCOMP) and
//! retransmission

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use super::{Connection, ConnectionError};
use crate::broker::BrokerEvent;
use crate::channel::ChannelAdapter;
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel, ReasonCode};
use crate::session::{AckOutcome, Session};

impl<C: ChannelAdapter> Connection<C> {
    /// Handle PUBACK packet
    pub(crate) fn handle_puback(&mut self, session: &Arc<Session>, puback: PubAck) -> Result<(), ConnectionError> {
        if session.acknowledge_puback(puback.packet_id) == AckOutcome::Unknown {
            trace!("PUBACK for unknown packet {} from {}", puback.packet_id, session.client_id());
        }
        Ok(())
    }

    /// Handle PUBREC packet
    pub(crate) async fn handle_pubrec(
        &mut self,
        session: &Arc<Session>,
        pubrec: PubRec,
    ) -> Result<(), ConnectionError> {
        let accepted = pubrec.reason_code.is_success();
        match session.acknowledge_pubrec(pubrec.packet_id, accepted) {
            AckOutcome::Released => {
                self.send(Packet::PubRel(PubRel::new(pubrec.packet_id))).await?;
            }
            AckOutcome::Completed => {
                debug!(
                    "{} refused QoS 2 delivery {} ({})",
                    session.client_id(),
                    pubrec.packet_id,
                    pubrec.reason_code
                );
            }
            AckOutcome::Unknown => {
                let pubrel = if self.is_v5() {
                    PubRel::with_reason(pubrec.packet_id, ReasonCode::PacketIdNotFound)
                } else {
                    PubRel::new(pubrec.packet_id)
                };
                self.send(Packet::PubRel(pubrel)).await?;
            }
        }
        Ok(())
    }

    /// Handle PUBREL packet, routing the held QoS 2 message
    pub(crate) async fn handle_pubrel(
        &mut self,
        session: &Arc<Session>,
        pubrel: PubRel,
    ) -> Result<(), ConnectionError> {
        let mut pubcomp = PubComp::new(pubrel.packet_id);
        match session.release_qos2(pubrel.packet_id) {
            Some(message) => {
                self.broker.publish(&message, Some(session.client_id()));
            }
            None => {
                trace!("PUBREL for unknown packet {} from {}", pubrel.packet_id, session.client_id());
                if self.is_v5() {
                    pubcomp.reason_code = ReasonCode::PacketIdNotFound;
                }
            }
        }
        self.send(Packet::PubComp(pubcomp)).await
    }

    /// Handle PUBCOMP packet
    pub(crate) fn handle_pubcomp(&mut self, session: &Arc<Session>, pubcomp: PubComp) -> Result<(), ConnectionError> {
        if session.acknowledge_pubcomp(pubcomp.packet_id) == AckOutcome::Unknown {
            trace!("PUBCOMP for unknown packet {} from {}", pubcomp.packet_id, session.client_id());
        }
        Ok(())
    }

    /// Resend timed out deliveries and report the ones that gave up
    pub(crate) async fn retransmit(&mut self, session: &Arc<Session>) -> Result<(), ConnectionError> {
        let ack_timeout = self.broker.config().ack_timeout;
        let max_retries = self.broker.config().max_retries;
        let out = session.collect_retransmissions(Instant::now(), ack_timeout, max_retries);

        for failed in &out.failed {
            warn!(
                "Delivery of packet {} to {} failed after {} retries",
                failed.packet_id,
                session.client_id(),
                failed.retries
            );
            self.broker.emit(BrokerEvent::DeliveryFailed {
                client_id: session.client_id().clone(),
                packet_id: failed.packet_id,
                topic: failed.delivery.message.topic_arc().clone(),
            });
        }

        if !out.packets.is_empty() {
            debug!("Resending {} packets to {}", out.packets.len(), session.client_id());
            self.send_batch(&out.packets).await?;
        }
        Ok(())
    }
}
