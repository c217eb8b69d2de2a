//! CONNECT packet handling

use std::time::Duration;

use tracing::{debug, info};

use super::{Connection, ConnectionError};
use crate::broker::{BrokerConfig, BrokerEvent, SessionAttachment};
use crate::channel::{ChannelAdapter, ChannelError};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, Properties, ProtocolError, ProtocolVersion, QoS,
    ReasonCode,
};

/// Keep alive agreed with the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeepAlive {
    /// Seconds the client must honour, 0 = disabled
    pub seconds: u16,
    /// Sent back as Server Keep Alive (v5) when it differs from the request
    pub server_override: bool,
}

impl KeepAlive {
    /// Time without traffic after which the client is dropped
    pub fn timeout(self) -> Option<Duration> {
        (self.seconds > 0).then(|| Duration::from_millis(u64::from(self.seconds) * 1500))
    }
}

pub(crate) fn negotiate_keep_alive(
    requested: u16,
    version: ProtocolVersion,
    config: &BrokerConfig,
) -> KeepAlive {
    // v3.x has no way to tell the client about a different value
    if version != ProtocolVersion::V5 {
        return KeepAlive {
            seconds: requested,
            server_override: false,
        };
    }

    let seconds = if requested == 0 {
        config.default_keep_alive
    } else {
        requested.min(config.max_keep_alive.max(1))
    };
    KeepAlive {
        seconds,
        server_override: seconds != requested,
    }
}

impl<C: ChannelAdapter> Connection<C> {
    /// Wait for CONNECT and attach the session it asks for
    pub(crate) async fn read_connect(&mut self) -> Result<SessionAttachment, ConnectionError> {
        let connect_timeout = self.broker.config().connect_timeout;

        let packet = match self.channel.receive_packet(Some(connect_timeout)).await {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                return Err(ConnectionError::Channel(ChannelError::Closed));
            }
            Err(ChannelError::Timeout) => {
                debug!("No CONNECT from {} within {:?}", self.channel.endpoint(), connect_timeout);
                return Err(ConnectionError::Timeout);
            }
            Err(ChannelError::Protocol(ProtocolError::Decode(DecodeError::InvalidProtocolVersion(
                level,
            )))) => {
                debug!("Unsupported protocol level {} from {}", level, self.channel.endpoint());
                let connack = ConnAck::new(false, ReasonCode::UnsupportedProtocolVersion);
                let _ = self.send(Packet::ConnAck(connack)).await;
                return Err(ConnectionError::Rejected(ReasonCode::UnsupportedProtocolVersion));
            }
            Err(e) => return Err(e.into()),
        };

        match packet {
            Packet::Connect(connect) => self.handle_connect(*connect).await,
            other => {
                debug!(
                    "First packet from {} was {}, not CONNECT",
                    self.channel.endpoint(),
                    other.name()
                );
                Err(ProtocolError::ProtocolViolation("first packet must be CONNECT").into())
            }
        }
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<SessionAttachment, ConnectionError> {
        self.protocol_version = connect.protocol_version;
        self.channel.set_protocol_version(connect.protocol_version);

        debug!(
            "CONNECT from {} (client_id: {:?}, version: {:?}, clean: {}, keep_alive: {})",
            self.channel.endpoint(),
            connect.client_id,
            connect.protocol_version,
            connect.clean_session,
            connect.keep_alive
        );

        if self.broker.connection_count() > self.broker.config().max_connections {
            return self.refuse(ReasonCode::ServerUnavailable).await;
        }

        let attachment = match self.broker.create_or_resume_session(&connect) {
            Ok(attachment) => attachment,
            Err(reason) => return self.refuse(reason).await,
        };

        let keep_alive = negotiate_keep_alive(connect.keep_alive, connect.protocol_version, self.broker.config());
        self.keep_alive = keep_alive.timeout();

        // v3.1 has no session present flag
        let session_present =
            attachment.session_present && connect.protocol_version != ProtocolVersion::V31;
        let mut connack = ConnAck::new(session_present, ReasonCode::Success);
        if self.is_v5() {
            connack.properties = self.connack_properties(&attachment, keep_alive);
        }

        if let Err(e) = self.send(Packet::ConnAck(connack)).await {
            self.broker.disconnect_session(&attachment, false);
            return Err(e);
        }

        info!(
            "Client {} connected from {} (session present: {})",
            attachment.client_id(),
            self.channel.endpoint(),
            session_present
        );
        self.broker.emit(BrokerEvent::ClientConnected {
            client_id: attachment.client_id().clone(),
            protocol_version: self.protocol_version,
            session_present,
        });
        Ok(attachment)
    }

    fn connack_properties(&self, attachment: &SessionAttachment, keep_alive: KeepAlive) -> Properties {
        let config = self.broker.config();
        let mut properties = Properties::default();

        if attachment.assigned_client_id {
            properties.assigned_client_identifier = Some(attachment.client_id().to_string());
        }
        if keep_alive.server_override {
            properties.server_keep_alive = Some(keep_alive.seconds);
        }
        properties.topic_alias_maximum = Some(config.max_topic_alias);
        properties.receive_maximum = Some(
            config
                .session_limits
                .max_awaiting_rel
                .clamp(1, u16::MAX as usize) as u16,
        );
        if config.max_qos() < QoS::ExactlyOnce {
            properties.maximum_qos = Some(config.max_qos() as u8);
        }
        if !config.retain_available {
            properties.retain_available = Some(0);
        }
        properties.shared_subscription_available = Some(0);
        properties
    }

    async fn refuse(&mut self, reason: ReasonCode) -> Result<SessionAttachment, ConnectionError> {
        info!("Refusing connection from {}: {}", self.channel.endpoint(), reason);
        let _ = self.send(Packet::ConnAck(ConnAck::new(false, reason))).await;
        Err(ConnectionError::Rejected(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn config(default_keep_alive: u16, max_keep_alive: u16) -> BrokerConfig {
        BrokerConfig {
            default_keep_alive,
            max_keep_alive,
            ..Default::default()
        }
    }

    #[test_case(ProtocolVersion::V311, 0, 0 ; "v311 disabled stays disabled")]
    #[test_case(ProtocolVersion::V311, 600, 600 ; "v311 is never capped")]
    #[test_case(ProtocolVersion::V5, 30, 30 ; "v5 within bounds")]
    #[test_case(ProtocolVersion::V5, 600, 120 ; "v5 capped at maximum")]
    #[test_case(ProtocolVersion::V5, 0, 60 ; "v5 zero gets default")]
    fn test_negotiate_keep_alive(version: ProtocolVersion, requested: u16, expected: u16) {
        let negotiated = negotiate_keep_alive(requested, version, &config(60, 120));
        assert_eq!(negotiated.seconds, expected);
        assert_eq!(negotiated.server_override, requested != expected);
    }

    #[test]
    fn test_keep_alive_timeout_is_one_and_a_half_intervals() {
        let keep_alive = KeepAlive {
            seconds: 10,
            server_override: false,
        };
        assert_eq!(keep_alive.timeout(), Some(Duration::from_secs(15)));

        let disabled = KeepAlive {
            seconds: 0,
            server_override: false,
        };
        assert_eq!(disabled.timeout(), None);
    }
}
