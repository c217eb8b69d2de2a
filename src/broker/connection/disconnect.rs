//! Connection teardown and will publishing

use tracing::{debug, info};

use super::{Connection, ConnectionError};
use crate::broker::SessionAttachment;
use crate::channel::ChannelAdapter;
use crate::protocol::{Disconnect, Packet, ReasonCode};

/// Why the connected loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    /// Client sent DISCONNECT
    ClientDisconnect { publish_will: bool },
    /// Transport closed without DISCONNECT
    PeerClosed,
    KeepAliveTimeout,
    /// Another connection attached to the session
    TakenOver,
    ServerShutdown,
}

impl Exit {
    fn publishes_will(self) -> bool {
        match self {
            Exit::ClientDisconnect { publish_will } => publish_will,
            Exit::TakenOver => false,
            Exit::PeerClosed | Exit::KeepAliveTimeout | Exit::ServerShutdown => true,
        }
    }

    fn reason(self) -> Option<ReasonCode> {
        match self {
            Exit::KeepAliveTimeout => Some(ReasonCode::KeepAliveTimeout),
            Exit::TakenOver => Some(ReasonCode::SessionTakenOver),
            Exit::ServerShutdown => Some(ReasonCode::ServerShuttingDown),
            Exit::ClientDisconnect { .. } | Exit::PeerClosed => None,
        }
    }
}

impl<C: ChannelAdapter> Connection<C> {
    /// Tell the client why (v5), close the channel and release the session
    pub(crate) async fn finish(
        &mut self,
        attachment: &SessionAttachment,
        result: Result<Exit, ConnectionError>,
    ) -> Result<(), ConnectionError> {
        let client_id = attachment.client_id();
        let (publish_will, reason) = match &result {
            Ok(exit) => (exit.publishes_will(), exit.reason()),
            Err(e) => {
                debug!("Connection error for {}: {}", client_id, e);
                (true, e.disconnect_reason())
            }
        };

        if let (true, Some(reason)) = (self.is_v5(), reason) {
            let _ = self
                .send(Packet::Disconnect(Disconnect::with_reason(reason)))
                .await;
        }
        let _ = self.channel.disconnect().await;

        self.broker.disconnect_session(attachment, publish_will);
        info!("Client {} disconnected", client_id);

        result.map(|_| ())
    }
}
