//! MQTT Connection Handler
//!
//! One [`Connection`] drives one client from CONNECT to teardown. It reads
//! packets from its channel, applies them to the client's session and
//! writes whatever the session has ready to send. Publishes from other
//! clients reach it through the session queue and a wakeup, never directly.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use self::disconnect::Exit;
use crate::broker::{Broker, SessionAttachment};
use crate::channel::{ChannelAdapter, ChannelError};
use crate::protocol::{Packet, ProtocolError, ProtocolVersion, ReasonCode};
use crate::session::Session;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Channel(ChannelError),
    Protocol(ProtocolError),
    /// Refused with a specific reason code (CONNACK or DISCONNECT)
    Rejected(ReasonCode),
    /// No CONNECT within the connect timeout
    Timeout,
}

impl ConnectionError {
    /// Reason code to report in a v5 DISCONNECT, if any
    pub(crate) fn disconnect_reason(&self) -> Option<ReasonCode> {
        match self {
            ConnectionError::Channel(ChannelError::Protocol(e)) | ConnectionError::Protocol(e) => {
                Some(e.reason_code())
            }
            ConnectionError::Rejected(reason) => Some(*reason),
            ConnectionError::Channel(_) | ConnectionError::Timeout => None,
        }
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Channel(e) => write!(f, "Channel error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Rejected(reason) => write!(f, "Rejected: {}", reason),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<ChannelError> for ConnectionError {
    fn from(e: ChannelError) -> Self {
        ConnectionError::Channel(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

/// Connection handler - generic over the channel type
pub struct Connection<C> {
    pub(crate) channel: C,
    pub(crate) broker: Broker,
    pub(crate) protocol_version: ProtocolVersion,
    /// 1.5 x the negotiated keep alive, `None` when disabled
    pub(crate) keep_alive: Option<Duration>,
    /// Inbound topic aliases (v5)
    pub(crate) topic_aliases: AHashMap<u16, Arc<str>>,
}

impl<C: ChannelAdapter> Connection<C> {
    pub fn new(channel: C, broker: Broker) -> Self {
        Self {
            channel,
            broker,
            protocol_version: ProtocolVersion::V311,
            keep_alive: None,
            topic_aliases: AHashMap::new(),
        }
    }

    /// Run the connection handler to completion
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let attachment = match self.read_connect().await {
            Ok(attachment) => attachment,
            Err(e) => {
                let _ = self.channel.disconnect().await;
                return Err(e);
            }
        };

        let result = self.run_connected(&attachment).await;
        self.finish(&attachment, result).await
    }

    /// Main loop once the session is attached
    async fn run_connected(&mut self, attachment: &SessionAttachment) -> Result<Exit, ConnectionError> {
        let session = attachment.session.clone();
        let client_id = session.client_id().clone();

        if attachment.session_present {
            let resend = session.resume_inflight();
            if !resend.is_empty() {
                debug!(client_id = %client_id, count = resend.len(), "resending in-flight messages");
                self.send_batch(&resend).await?;
            }
        }
        self.flush_outbound(&session).await?;

        let mut retry_ticker = tokio::time::interval(retry_interval(self.broker.config().ack_timeout));
        retry_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        retry_ticker.tick().await;

        let mut shutdown = self.broker.shutdown_signal();
        let keep_alive = self.keep_alive;
        let mut keep_alive_deadline = keep_alive.map(|k| Instant::now() + k);

        loop {
            // created before the check so a takeover in between still wakes it
            let notified = session.notified();
            if !session.is_current(attachment.generation) {
                session.wake();
                return Ok(Exit::TakenOver);
            }

            let keep_alive_expired = async move {
                match keep_alive_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                result = self.channel.receive_packet(None) => {
                    let Some(packet) = result? else {
                        debug!("Connection closed by {}", client_id);
                        return Ok(Exit::PeerClosed);
                    };
                    if let Some(k) = keep_alive {
                        keep_alive_deadline = Some(Instant::now() + k);
                    }
                    if let Some(exit) = self.handle_packet(&session, packet).await? {
                        return Ok(exit);
                    }
                }

                _ = notified => {
                    if !session.is_current(attachment.generation) {
                        // pass the wakeup on to the connection that replaced us
                        session.wake();
                        return Ok(Exit::TakenOver);
                    }
                    self.flush_outbound(&session).await?;
                }

                _ = retry_ticker.tick() => {
                    self.retransmit(&session).await?;
                }

                _ = keep_alive_expired => {
                    info!("Keep alive timeout for {} - disconnecting", client_id);
                    return Ok(Exit::KeepAliveTimeout);
                }

                _ = shutdown.recv() => {
                    return Ok(Exit::ServerShutdown);
                }
            }
        }
    }

    /// Handle an incoming packet; `Some` ends the connection
    async fn handle_packet(
        &mut self,
        session: &Arc<Session>,
        packet: Packet,
    ) -> Result<Option<Exit>, ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ProtocolError::ProtocolViolation("duplicate CONNECT").into()),
            Packet::Publish(publish) => self.handle_publish(session, publish).await.map(|_| None),
            Packet::PubAck(puback) => self.handle_puback(session, puback).map(|_| None),
            Packet::PubRec(pubrec) => self.handle_pubrec(session, pubrec).await.map(|_| None),
            Packet::PubRel(pubrel) => self.handle_pubrel(session, pubrel).await.map(|_| None),
            Packet::PubComp(pubcomp) => self.handle_pubcomp(session, pubcomp).map(|_| None),
            Packet::Subscribe(subscribe) => self.handle_subscribe(session, subscribe).await.map(|_| None),
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(session, unsubscribe).await.map(|_| None)
            }
            Packet::PingReq => {
                self.send(Packet::PingResp).await?;
                Ok(None)
            }
            Packet::Disconnect(disconnect) => {
                debug!(
                    "DISCONNECT from {} (reason: {:?})",
                    session.client_id(),
                    disconnect.reason_code
                );
                Ok(Some(Exit::ClientDisconnect {
                    publish_will: disconnect.reason_code == ReasonCode::DisconnectWithWill,
                }))
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                warn!(
                    "Unexpected {} from {}",
                    packet.name(),
                    session.client_id()
                );
                Err(ProtocolError::ProtocolViolation("server-to-client packet sent by client").into())
            }
        }
    }

    /// Send everything the session has ready
    pub(crate) async fn flush_outbound(&mut self, session: &Session) -> Result<(), ConnectionError> {
        let packets = session.drain_ready();
        if !packets.is_empty() {
            self.send_batch(&packets).await?;
        }
        Ok(())
    }

    pub(crate) async fn send(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        self.send_batch(std::slice::from_ref(&packet)).await
    }

    pub(crate) async fn send_batch(&mut self, packets: &[Packet]) -> Result<(), ConnectionError> {
        for packet in packets {
            check_outbound(packet)?;
        }
        self.channel.send_packets(packets).await?;
        Ok(())
    }

    pub(crate) fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }
}

/// The encoder writes whatever packet identifier is present, so a QoS 1/2
/// PUBLISH without one has to be stopped here
fn check_outbound(packet: &Packet) -> Result<(), ProtocolError> {
    match packet {
        Packet::Publish(p) if p.requires_packet_id() && p.packet_id.is_none() => {
            Err(ProtocolError::ProtocolViolation("missing packet identifier"))
        }
        _ => Ok(()),
    }
}

/// How often unacknowledged deliveries are checked
fn retry_interval(ack_timeout: Duration) -> Duration {
    (ack_timeout / 2).clamp(Duration::from_millis(50), Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DecodeError, Publish, QoS};

    #[test]
    fn test_retry_interval_bounds() {
        assert_eq!(retry_interval(Duration::from_secs(20)), Duration::from_secs(5));
        assert_eq!(retry_interval(Duration::from_secs(2)), Duration::from_secs(1));
        assert_eq!(retry_interval(Duration::from_millis(10)), Duration::from_millis(50));
    }

    #[test]
    fn test_outbound_publish_needs_packet_id() {
        let mut publish = Publish {
            qos: QoS::AtLeastOnce,
            topic: "t".into(),
            ..Default::default()
        };
        assert_eq!(
            check_outbound(&Packet::Publish(publish.clone())),
            Err(ProtocolError::ProtocolViolation("missing packet identifier"))
        );

        publish.packet_id = Some(1);
        assert_eq!(check_outbound(&Packet::Publish(publish.clone())), Ok(()));

        publish.qos = QoS::AtMostOnce;
        publish.packet_id = None;
        assert_eq!(check_outbound(&Packet::Publish(publish)), Ok(()));
        assert_eq!(check_outbound(&Packet::PingResp), Ok(()));
    }

    #[test]
    fn test_disconnect_reasons() {
        let malformed = ConnectionError::Channel(ChannelError::Protocol(ProtocolError::Decode(
            DecodeError::InvalidRemainingLength,
        )));
        assert_eq!(malformed.disconnect_reason(), Some(ReasonCode::MalformedPacket));

        let too_large = ConnectionError::Channel(ChannelError::Protocol(ProtocolError::Decode(
            DecodeError::PacketTooLarge,
        )));
        assert_eq!(too_large.disconnect_reason(), Some(ReasonCode::PacketTooLarge));

        let violation = ConnectionError::Protocol(ProtocolError::ProtocolViolation("x"));
        assert_eq!(violation.disconnect_reason(), Some(ReasonCode::ProtocolError));

        let bad_filter = ConnectionError::Protocol(ProtocolError::InvalidTopicFilter("a/#/b".into()));
        assert_eq!(bad_filter.disconnect_reason(), Some(ReasonCode::TopicFilterInvalid));

        let io = ConnectionError::Channel(ChannelError::Io(std::io::ErrorKind::BrokenPipe.into()));
        assert_eq!(io.disconnect_reason(), None);
    }
}
