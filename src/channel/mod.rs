//! Channel adapters
//!
//! The broker talks to clients through a [`ChannelAdapter`]: something that
//! yields decoded packets and accepts packets to send, in order. The
//! transport underneath is not the broker's concern. [`MqttChannel`] adapts
//! any tokio byte stream (TCP socket, in-memory duplex pipe) by running the
//! packet codec over it.

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::codec::{Decoder, Encoder, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{Packet, ProtocolError, ProtocolVersion};

/// Errors raised by a channel
#[derive(Debug)]
pub enum ChannelError {
    /// Transport read or write failure
    Io(io::Error),
    /// Bytes received that do not form a valid packet
    Protocol(ProtocolError),
    /// Nothing arrived within the requested timeout
    Timeout,
    /// The channel was already disconnected
    Closed,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Io(e) => write!(f, "IO error: {}", e),
            ChannelError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ChannelError::Timeout => write!(f, "Timed out waiting for a packet"),
            ChannelError::Closed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io(e) => Some(e),
            ChannelError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::Io(e)
    }
}

impl From<ProtocolError> for ChannelError {
    fn from(e: ProtocolError) -> Self {
        ChannelError::Protocol(e)
    }
}

/// Packet-level transport used by a connection
///
/// `receive_packet` must be cancel safe: dropping its future before it
/// completes must not lose bytes already read. The connection loop polls it
/// inside `tokio::select!`.
#[async_trait]
pub trait ChannelAdapter: Send {
    /// Next packet, or `None` when the peer closed the channel cleanly
    ///
    /// `timeout` bounds the wait for a complete packet.
    async fn receive_packet(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<Packet>, ChannelError>;

    /// Write `packets` in order
    async fn send_packets(&mut self, packets: &[Packet]) -> Result<(), ChannelError>;

    async fn disconnect(&mut self) -> Result<(), ChannelError>;

    /// Select the field layout for packets sent and received from now on
    fn set_protocol_version(&mut self, version: ProtocolVersion);

    /// Peer description for log output
    fn endpoint(&self) -> &str;
}

/// [`ChannelAdapter`] over a tokio byte stream
pub struct MqttChannel<S> {
    stream: S,
    endpoint: String,
    decoder: Decoder,
    encoder: Encoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    closed: bool,
}

impl<S> MqttChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, endpoint: impl Into<String>) -> Self {
        Self {
            stream,
            endpoint: endpoint.into(),
            decoder: Decoder::default().with_max_packet_size(DEFAULT_MAX_PACKET_SIZE),
            encoder: Encoder::default(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            closed: false,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.decoder = self.decoder.with_max_packet_size(size);
        self
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.encoder.protocol_version()
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    async fn read_packet(&mut self) -> Result<Option<Packet>, ChannelError> {
        loop {
            if let Some(packet) = self
                .decoder
                .decode_from(&mut self.read_buf)
                .map_err(ProtocolError::from)?
            {
                trace!(endpoint = %self.endpoint, packet = packet.name(), "received");
                return Ok(Some(packet));
            }

            // read_buf is cancel safe, partial frames stay buffered
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ChannelError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-packet",
                )));
            }
        }
    }
}

#[async_trait]
impl<S> ChannelAdapter for MqttChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn receive_packet(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<Packet>, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.read_packet())
                .await
                .map_err(|_| ChannelError::Timeout)?,
            None => self.read_packet().await,
        }
    }

    async fn send_packets(&mut self, packets: &[Packet]) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        if packets.is_empty() {
            return Ok(());
        }

        self.write_buf.clear();
        for packet in packets {
            self.encoder
                .encode(packet, &mut self.write_buf)
                .map_err(ProtocolError::from)?;
            trace!(endpoint = %self.endpoint, packet = packet.name(), "sending");
        }
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream.shutdown().await?;
        Ok(())
    }

    fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.decoder.set_protocol_version(version);
        self.encoder.set_protocol_version(version);
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Connect, PubAck, Publish, QoS};
    use pretty_assertions::assert_eq;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_send_and_receive() {
        let (a, b) = duplex(1024);
        let mut left = MqttChannel::new(a, "left");
        let mut right = MqttChannel::new(b, "right");

        let publish = Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            topic: "a/b".into(),
            packet_id: Some(3),
            payload: "x".into(),
            ..Default::default()
        });
        left.send_packets(&[publish.clone(), Packet::PubAck(PubAck::new(3))])
            .await
            .unwrap();

        assert_eq!(right.receive_packet(None).await.unwrap(), Some(publish));
        assert_eq!(
            right.receive_packet(None).await.unwrap(),
            Some(Packet::PubAck(PubAck::new(3)))
        );
    }

    #[tokio::test]
    async fn test_partial_frame_survives_cancellation() {
        let (mut raw, b) = duplex(1024);
        let mut channel = MqttChannel::new(b, "peer");

        let bytes = Encoder::default()
            .encode_to_bytes(&Packet::Connect(Box::new(Connect::default())))
            .unwrap();
        let (head, tail) = bytes.split_at(5);

        raw.write_all(head).await.unwrap();
        let first = channel
            .receive_packet(Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(first, Err(ChannelError::Timeout)));

        raw.write_all(tail).await.unwrap();
        let packet = channel.receive_packet(None).await.unwrap();
        assert!(matches!(packet, Some(Packet::Connect(_))));
    }

    #[tokio::test]
    async fn test_graceful_close_and_truncation() {
        let (raw, b) = duplex(64);
        let mut channel = MqttChannel::new(b, "peer");
        drop(raw);
        assert!(channel.receive_packet(None).await.unwrap().is_none());

        let (mut raw, b) = duplex(64);
        let mut channel = MqttChannel::new(b, "peer");
        raw.write_all(&[0x30, 0x05, 0x00]).await.unwrap();
        drop(raw);
        assert!(matches!(
            channel.receive_packet(None).await,
            Err(ChannelError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_input() {
        let (mut raw, b) = duplex(64);
        let mut channel = MqttChannel::new(b, "peer");
        raw.write_all(&[0xF0, 0x00]).await.unwrap();
        assert!(matches!(
            channel.receive_packet(None).await,
            Err(ChannelError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_after_disconnect() {
        let (_raw, b) = duplex(64);
        let mut channel = MqttChannel::new(b, "peer");
        channel.disconnect().await.unwrap();
        assert!(matches!(
            channel.send_packets(&[Packet::PingResp]).await,
            Err(ChannelError::Closed)
        ));
    }
}
