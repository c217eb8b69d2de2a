//! PUBLISH packet handling

use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::{Connection, ConnectionError};
use crate::channel::ChannelAdapter;
use crate::message::ApplicationMessage;
use crate::protocol::{Packet, ProtocolError, PubAck, PubRec, Publish, QoS, ReasonCode};
use crate::session::Session;

impl<C: ChannelAdapter> Connection<C> {
    /// Handle PUBLISH packet
    pub(crate) async fn handle_publish(
        &mut self,
        session: &Arc<Session>,
        mut publish: Publish,
    ) -> Result<(), ConnectionError> {
        let client_id = session.client_id();
        trace!(
            "PUBLISH from {} to {} (qos: {:?}, retain: {}, {} bytes)",
            client_id,
            publish.topic,
            publish.qos,
            publish.retain,
            publish.payload.len()
        );

        if self.is_v5() {
            self.resolve_topic_alias(&mut publish)?;
        }

        let max_qos = self.broker.config().max_qos();
        if publish.qos > max_qos {
            warn!("{} published at {:?} above maximum {:?}", client_id, publish.qos, max_qos);
            return Err(ConnectionError::Rejected(ReasonCode::QoSNotSupported));
        }
        if publish.retain && !self.broker.config().retain_available && self.is_v5() {
            return Err(ConnectionError::Rejected(ReasonCode::RetainNotSupported));
        }

        let qos = publish.qos;
        let packet_id = publish.packet_id;
        let message = ApplicationMessage::from_publish(publish).map_err(|e| {
            warn!("Invalid PUBLISH from {}: {}", client_id, e);
            ConnectionError::Rejected(ReasonCode::TopicNameInvalid)
        })?;

        match qos {
            QoS::AtMostOnce => {
                self.broker.publish(&message, Some(client_id));
            }
            QoS::AtLeastOnce => {
                let packet_id = require_packet_id(packet_id)?;
                let recipients = self.broker.publish(&message, Some(client_id));
                let puback = if recipients == 0 && self.is_v5() {
                    PubAck::with_reason(packet_id, ReasonCode::NoMatchingSubscribers)
                } else {
                    PubAck::new(packet_id)
                };
                self.send(Packet::PubAck(puback)).await?;
            }
            QoS::ExactlyOnce => {
                let packet_id = require_packet_id(packet_id)?;
                match session.receive_qos2(packet_id, message) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("Duplicate QoS 2 PUBLISH {} from {}", packet_id, client_id);
                    }
                    Err(reason) => {
                        warn!(
                            "{} exceeded the QoS 2 receive limit at packet {}",
                            client_id, packet_id
                        );
                        return Err(ConnectionError::Rejected(reason));
                    }
                }
                self.send(Packet::PubRec(PubRec::new(packet_id))).await?;
            }
        }
        Ok(())
    }

    /// Replace an empty topic by its alias and remember new aliases
    fn resolve_topic_alias(&mut self, publish: &mut Publish) -> Result<(), ConnectionError> {
        let Some(alias) = publish.properties.topic_alias.take() else {
            return Ok(());
        };
        if alias == 0 || alias > self.broker.config().max_topic_alias {
            return Err(ConnectionError::Rejected(ReasonCode::TopicAliasInvalid));
        }

        if publish.topic.is_empty() {
            let topic = self
                .topic_aliases
                .get(&alias)
                .ok_or(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "unknown topic alias",
                )))?;
            publish.topic = topic.clone();
        } else {
            self.topic_aliases.insert(alias, publish.topic.clone());
        }
        Ok(())
    }
}

fn require_packet_id(packet_id: Option<u16>) -> Result<u16, ConnectionError> {
    packet_id.ok_or(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
        "missing packet identifier",
    )))
}
