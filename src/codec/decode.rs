//! MQTT packet decoder

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use super::{read_variable_int, Reader, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Disconnect, Packet, Properties, ProtocolVersion, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, ReasonCode, SubAck, Subscribe, Subscription,
    SubscriptionOptions, UnsubAck, Unsubscribe, Will,
};

/// Fixed header flags required by PUBREL, SUBSCRIBE and UNSUBSCRIBE
const FLAGS_0010: u8 = 0x02;

/// Stateful MQTT packet decoder
///
/// The wire layout depends on the protocol version. The version given at
/// construction is used until a CONNECT packet announces another one.
#[derive(Debug, Clone)]
pub struct Decoder {
    max_packet_size: usize,
    protocol_version: ProtocolVersion,
}

impl Decoder {
    pub fn new(protocol_version: ProtocolVersion) -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            protocol_version,
        }
    }

    /// Reject packets whose remaining length exceeds `size`
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Decode one packet from the front of `buf`
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete packet, and
    /// `Ok(Some((packet, consumed)))` otherwise. The buffer is never modified,
    /// so a caller may append more bytes and call again.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some(&first_byte) = buf.first() else {
            return Ok(None);
        };

        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        let remaining_length = remaining_length as usize;

        if remaining_length > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let header_len = 1 + len_bytes;
        let total_len = header_len + remaining_length;
        if buf.len() < total_len {
            return Ok(None);
        }

        let mut r = Reader::new(&buf[header_len..total_len]);

        let packet = match packet_type {
            1 => self.decode_connect(flags, &mut r)?,
            2 => self.decode_connack(flags, &mut r)?,
            3 => self.decode_publish(flags, &mut r)?,
            4 => {
                let (packet_id, reason_code, properties) = self.decode_ack(flags, 0, &mut r)?;
                let mut ack = PubAck::with_reason(packet_id, reason_code);
                ack.properties = properties;
                Packet::PubAck(ack)
            }
            5 => {
                let (packet_id, reason_code, properties) = self.decode_ack(flags, 0, &mut r)?;
                let mut ack = PubRec::with_reason(packet_id, reason_code);
                ack.properties = properties;
                Packet::PubRec(ack)
            }
            6 => {
                let (packet_id, reason_code, properties) =
                    self.decode_ack(flags, FLAGS_0010, &mut r)?;
                let mut ack = PubRel::with_reason(packet_id, reason_code);
                ack.properties = properties;
                Packet::PubRel(ack)
            }
            7 => {
                let (packet_id, reason_code, properties) = self.decode_ack(flags, 0, &mut r)?;
                let mut ack = PubComp::with_reason(packet_id, reason_code);
                ack.properties = properties;
                Packet::PubComp(ack)
            }
            8 => self.decode_subscribe(flags, &mut r)?,
            9 => self.decode_suback(flags, &mut r)?,
            10 => self.decode_unsubscribe(flags, &mut r)?,
            11 => self.decode_unsuback(flags, &mut r)?,
            12 | 13 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                if !r.is_empty() {
                    return Err(DecodeError::MalformedPacket("unexpected ping payload"));
                }
                if packet_type == 12 {
                    Packet::PingReq
                } else {
                    Packet::PingResp
                }
            }
            14 => self.decode_disconnect(flags, &mut r)?,
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    /// Decode one packet and advance `buf` past it
    ///
    /// Partial frames are left in place.
    pub fn decode_from(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, DecodeError> {
        match self.decode(&buf[..])? {
            Some((packet, consumed)) => {
                buf.advance(consumed);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    #[inline]
    fn has_properties(&self) -> bool {
        self.protocol_version.has_properties()
    }

    fn read_properties(&self, r: &mut Reader<'_>) -> Result<Properties, DecodeError> {
        if self.has_properties() {
            Properties::read(r)
        } else {
            Ok(Properties::default())
        }
    }

    fn decode_connect(&mut self, flags: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let protocol_name = r.string()?;
        let level = r.u8()?;

        let protocol_version = match (protocol_name, level) {
            ("MQIsdp", 3) => ProtocolVersion::V31,
            ("MQTT", 4) => ProtocolVersion::V311,
            ("MQTT", 5) => ProtocolVersion::V5,
            ("MQIsdp", _) | ("MQTT", _) => {
                return Err(DecodeError::InvalidProtocolVersion(level))
            }
            _ => return Err(DecodeError::InvalidProtocolName),
        };

        // Everything after the level byte uses the announced layout
        self.protocol_version = protocol_version;

        let connect_flags = r.u8()?;
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let clean_session = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos_bits = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;
        if !will_flag && (will_qos_bits != 0 || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }
        // A password without a user name is only legal from v5 on
        if password_flag && !username_flag && protocol_version != ProtocolVersion::V5 {
            return Err(DecodeError::InvalidFlags);
        }

        let keep_alive = r.u16()?;
        let properties = self.read_properties(r)?;
        let client_id = r.string()?.to_owned();

        let will = if will_flag {
            let will_properties = self.read_properties(r)?;
            let topic = r.string()?.to_owned();
            let payload = Bytes::copy_from_slice(r.binary()?);
            Some(Will {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
                properties: will_properties,
            })
        } else {
            None
        };

        let username = if username_flag {
            Some(r.string()?.to_owned())
        } else {
            None
        };
        let password = if password_flag {
            Some(Bytes::copy_from_slice(r.binary()?))
        } else {
            None
        };

        if !r.is_empty() {
            return Err(DecodeError::MalformedPacket("trailing bytes after CONNECT payload"));
        }

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id,
            clean_session,
            keep_alive,
            username,
            password,
            will,
            properties,
        })))
    }

    fn decode_connack(&self, flags: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let ack_flags = r.u8()?;
        if (ack_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let code = r.u8()?;

        let reason_code = if self.has_properties() {
            ReasonCode::from_u8(code)
        } else {
            ReasonCode::from_v3_connack_code(code)
        }
        .ok_or(DecodeError::InvalidReasonCode(code))?;

        let properties = if self.has_properties() && !r.is_empty() {
            Properties::read(r)?
        } else {
            Properties::default()
        };

        Ok(Packet::ConnAck(ConnAck {
            session_present: (ack_flags & 0x01) != 0,
            reason_code,
            properties,
        }))
    }

    fn decode_publish(&self, flags: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let retain = (flags & 0x01) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let topic = r.string()?;
        if topic.contains(|c| c == '+' || c == '#') {
            return Err(DecodeError::MalformedPacket("topic name contains wildcard"));
        }

        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            match r.u16()? {
                0 => return Err(DecodeError::MalformedPacket("packet id cannot be 0")),
                id => Some(id),
            }
        };

        let properties = self.read_properties(r)?;
        let payload = Bytes::copy_from_slice(r.rest());

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload,
            properties,
        }))
    }

    /// Shared layout of PUBACK, PUBREC, PUBREL and PUBCOMP
    fn decode_ack(
        &self,
        flags: u8,
        expected_flags: u8,
        r: &mut Reader<'_>,
    ) -> Result<(u16, ReasonCode, Properties), DecodeError> {
        if flags != expected_flags {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = r.u16()?;

        if !self.has_properties() {
            if !r.is_empty() {
                return Err(DecodeError::MalformedPacket("unexpected acknowledgment payload"));
            }
            return Ok((packet_id, ReasonCode::Success, Properties::default()));
        }

        // v5: reason code and properties may each be omitted
        let reason_code = if r.is_empty() {
            ReasonCode::Success
        } else {
            let code = r.u8()?;
            ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?
        };
        let properties = if r.is_empty() {
            Properties::default()
        } else {
            Properties::read(r)?
        };

        Ok((packet_id, reason_code, properties))
    }

    fn decode_subscribe(&self, flags: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        if flags != FLAGS_0010 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = match r.u16()? {
            0 => return Err(DecodeError::MalformedPacket("packet id cannot be 0")),
            id => id,
        };
        let properties = self.read_properties(r)?;

        let mut subscriptions = Vec::new();
        while !r.is_empty() {
            let filter = r.string()?;
            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }

            let byte = r.u8()?;
            let options = if self.has_properties() {
                SubscriptionOptions::from_byte(byte)
                    .ok_or(DecodeError::InvalidSubscriptionOptions)?
            } else {
                if (byte & 0xFC) != 0 {
                    return Err(DecodeError::InvalidSubscriptionOptions);
                }
                let qos = QoS::from_u8(byte).ok_or(DecodeError::InvalidQoS(byte))?;
                SubscriptionOptions::with_qos(qos)
            };

            subscriptions.push(Subscription {
                filter: filter.to_owned(),
                options,
            });
        }

        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must contain at least one topic filter",
            ));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
            properties,
        }))
    }

    fn decode_suback(&self, flags: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = r.u16()?;
        let properties = self.read_properties(r)?;

        let mut reason_codes = Vec::with_capacity(r.remaining());
        while !r.is_empty() {
            let code = r.u8()?;
            let reason = if self.has_properties() {
                ReasonCode::from_u8(code)
            } else {
                ReasonCode::from_v3_suback_code(code)
            };
            reason_codes.push(reason.ok_or(DecodeError::InvalidReasonCode(code))?);
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        if flags != FLAGS_0010 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = match r.u16()? {
            0 => return Err(DecodeError::MalformedPacket("packet id cannot be 0")),
            id => id,
        };
        let properties = self.read_properties(r)?;

        let mut filters = Vec::new();
        while !r.is_empty() {
            let filter = r.string()?;
            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }
            filters.push(filter.to_owned());
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "UNSUBSCRIBE must contain at least one topic filter",
            ));
        }

        Ok(Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_unsuback(&self, flags: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = r.u16()?;

        if !self.has_properties() {
            return Ok(Packet::UnsubAck(UnsubAck {
                packet_id,
                reason_codes: Vec::new(),
                properties: Properties::default(),
            }));
        }

        let properties = Properties::read(r)?;
        let mut reason_codes = Vec::with_capacity(r.remaining());
        while !r.is_empty() {
            let code = r.u8()?;
            reason_codes.push(ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?);
        }

        Ok(Packet::UnsubAck(UnsubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_disconnect(&self, flags: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        if !self.has_properties() {
            if !r.is_empty() {
                return Err(DecodeError::MalformedPacket("DISCONNECT has no payload before v5"));
            }
            return Ok(Packet::Disconnect(Disconnect::default()));
        }

        let mut disconnect = Disconnect::default();
        if !r.is_empty() {
            let code = r.u8()?;
            disconnect.reason_code =
                ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?;
        }
        if !r.is_empty() {
            disconnect.properties = Properties::read(r)?;
        }

        Ok(Packet::Disconnect(disconnect))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V311)
    }
}
