//! MQTT packet encoder

use bytes::{BufMut, Bytes, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, Disconnect, EncodeError, Packet, Properties, ProtocolVersion, Publish,
    ReasonCode, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

/// MQTT packet encoder for a fixed protocol version
#[derive(Debug, Clone)]
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(protocol_version: ProtocolVersion) -> Self {
        Self { protocol_version }
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Append the encoded packet to `buf`
    ///
    /// On error nothing is appended.
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();

        let first_byte = match packet {
            Packet::Connect(p) => {
                self.encode_connect(p, &mut body)?;
                0x10
            }
            Packet::ConnAck(p) => {
                self.encode_connack(p, &mut body)?;
                0x20
            }
            Packet::Publish(p) => {
                self.encode_publish(p, &mut body)?;
                0x30 | ((p.dup as u8) << 3) | ((p.qos as u8) << 1) | (p.retain as u8)
            }
            Packet::PubAck(p) => {
                self.encode_ack(p.packet_id, p.reason_code, &p.properties, &mut body)?;
                0x40
            }
            Packet::PubRec(p) => {
                self.encode_ack(p.packet_id, p.reason_code, &p.properties, &mut body)?;
                0x50
            }
            Packet::PubRel(p) => {
                self.encode_ack(p.packet_id, p.reason_code, &p.properties, &mut body)?;
                0x62
            }
            Packet::PubComp(p) => {
                self.encode_ack(p.packet_id, p.reason_code, &p.properties, &mut body)?;
                0x70
            }
            Packet::Subscribe(p) => {
                self.encode_subscribe(p, &mut body)?;
                0x82
            }
            Packet::SubAck(p) => {
                self.encode_suback(p, &mut body)?;
                0x90
            }
            Packet::Unsubscribe(p) => {
                self.encode_unsubscribe(p, &mut body)?;
                0xA2
            }
            Packet::UnsubAck(p) => {
                self.encode_unsuback(p, &mut body)?;
                0xB0
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect(p) => {
                self.encode_disconnect(p, &mut body)?;
                0xE0
            }
        };

        let mut header = BytesMut::with_capacity(5);
        header.put_u8(first_byte);
        write_variable_int(&mut header, body.len() as u32)?;

        buf.reserve(header.len() + body.len());
        buf.put_slice(&header);
        buf.put_slice(&body);
        Ok(())
    }

    /// Encode into a freshly allocated buffer
    pub fn encode_to_bytes(&self, packet: &Packet) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode(packet, &mut buf)?;
        Ok(buf.freeze())
    }

    #[inline]
    fn has_properties(&self) -> bool {
        self.protocol_version.has_properties()
    }

    fn write_properties(&self, props: &Properties, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if self.has_properties() {
            props.encode(buf)?;
        }
        Ok(())
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // The packet carries its own version; encode with that layout
        let version = packet.protocol_version;
        let v5 = version.has_properties();

        write_string(buf, version.protocol_name())?;
        buf.put_u8(version as u8);

        let mut flags = 0u8;
        if packet.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &packet.will {
            flags |= 0x04 | ((will.qos as u8) << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        if packet.password.is_some() {
            flags |= 0x40;
        }
        if packet.username.is_some() {
            flags |= 0x80;
        }
        buf.put_u8(flags);
        buf.put_u16(packet.keep_alive);

        if v5 {
            packet.properties.encode(buf)?;
        }
        write_string(buf, &packet.client_id)?;

        if let Some(will) = &packet.will {
            if v5 {
                will.properties.encode(buf)?;
            }
            write_string(buf, &will.topic)?;
            write_binary(buf, &will.payload)?;
        }
        if let Some(username) = &packet.username {
            write_string(buf, username)?;
        }
        if let Some(password) = &packet.password {
            write_binary(buf, password)?;
        }
        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(packet.session_present as u8);
        if self.has_properties() {
            buf.put_u8(packet.reason_code as u8);
            packet.properties.encode(buf)?;
        } else {
            buf.put_u8(packet.reason_code.to_v3_connack_code());
        }
        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_string(buf, &packet.topic)?;
        // a missing id on QoS > 0 is the caller's to catch
        if let Some(packet_id) = packet.packet_id.filter(|_| packet.requires_packet_id()) {
            buf.put_u16(packet_id);
        }
        self.write_properties(&packet.properties, buf)?;
        buf.put_slice(&packet.payload);
        Ok(())
    }

    /// PUBACK, PUBREC, PUBREL and PUBCOMP
    ///
    /// In v5 a successful ack without properties is sent in its short form.
    fn encode_ack(
        &self,
        packet_id: u16,
        reason_code: ReasonCode,
        properties: &Properties,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        buf.put_u16(packet_id);
        if self.has_properties() && (reason_code != ReasonCode::Success || !properties.is_empty())
        {
            buf.put_u8(reason_code as u8);
            if !properties.is_empty() {
                properties.encode(buf)?;
            }
        }
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u16(packet.packet_id);
        self.write_properties(&packet.properties, buf)?;
        for sub in &packet.subscriptions {
            write_string(buf, &sub.filter)?;
            if self.has_properties() {
                buf.put_u8(sub.options.to_byte());
            } else {
                buf.put_u8(sub.options.qos as u8);
            }
        }
        Ok(())
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u16(packet.packet_id);
        self.write_properties(&packet.properties, buf)?;
        for code in &packet.reason_codes {
            if self.has_properties() {
                buf.put_u8(*code as u8);
            } else {
                buf.put_u8(code.to_v3_suback_code());
            }
        }
        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        buf.put_u16(packet.packet_id);
        self.write_properties(&packet.properties, buf)?;
        for filter in &packet.filters {
            write_string(buf, filter)?;
        }
        Ok(())
    }

    fn encode_unsuback(&self, packet: &UnsubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u16(packet.packet_id);
        if self.has_properties() {
            packet.properties.encode(buf)?;
            for code in &packet.reason_codes {
                buf.put_u8(*code as u8);
            }
        }
        Ok(())
    }

    fn encode_disconnect(
        &self,
        packet: &Disconnect,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        if !self.has_properties() {
            return Ok(());
        }
        if packet.reason_code != ReasonCode::Success || !packet.properties.is_empty() {
            buf.put_u8(packet.reason_code as u8);
            if !packet.properties.is_empty() {
                packet.properties.encode(buf)?;
            }
        }
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V311)
    }
}
