//! MQTT v5.0 properties
//!
//! Properties travel on the wire as `(identifier, value)` pairs behind a
//! variable-length size prefix. [`Property`] is one decoded pair;
//! [`Properties`] is the typed collection carried by packets.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{variable_int_len, write_binary, write_string, write_variable_int, Reader};
use crate::protocol::{DecodeError, EncodeError};

/// Property identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

/// A single property value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    PayloadFormatIndicator(u8),
    MessageExpiryInterval(u32),
    ContentType(String),
    ResponseTopic(String),
    CorrelationData(Bytes),
    SubscriptionIdentifier(u32),
    SessionExpiryInterval(u32),
    AssignedClientIdentifier(String),
    ServerKeepAlive(u16),
    AuthenticationMethod(String),
    AuthenticationData(Bytes),
    RequestProblemInformation(u8),
    WillDelayInterval(u32),
    RequestResponseInformation(u8),
    ResponseInformation(String),
    ServerReference(String),
    ReasonString(String),
    ReceiveMaximum(u16),
    TopicAliasMaximum(u16),
    TopicAlias(u16),
    MaximumQoS(u8),
    RetainAvailable(u8),
    UserProperty(String, String),
    MaximumPacketSize(u32),
    WildcardSubscriptionAvailable(u8),
    SubscriptionIdentifierAvailable(u8),
    SharedSubscriptionAvailable(u8),
}

impl Property {
    /// Read one `(identifier, value)` pair
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let id = r.variable_int()?;
        let id = u8::try_from(id).map_err(|_| DecodeError::InvalidPropertyId(0xFF))?;

        let prop = match id {
            0x01 => Property::PayloadFormatIndicator(r.u8()?),
            0x02 => Property::MessageExpiryInterval(r.u32()?),
            0x03 => Property::ContentType(r.string()?.to_owned()),
            0x08 => Property::ResponseTopic(r.string()?.to_owned()),
            0x09 => Property::CorrelationData(Bytes::copy_from_slice(r.binary()?)),
            0x0B => match r.variable_int()? {
                0 => {
                    return Err(DecodeError::MalformedPacket(
                        "subscription identifier cannot be 0",
                    ))
                }
                v => Property::SubscriptionIdentifier(v),
            },
            0x11 => Property::SessionExpiryInterval(r.u32()?),
            0x12 => Property::AssignedClientIdentifier(r.string()?.to_owned()),
            0x13 => Property::ServerKeepAlive(r.u16()?),
            0x15 => Property::AuthenticationMethod(r.string()?.to_owned()),
            0x16 => Property::AuthenticationData(Bytes::copy_from_slice(r.binary()?)),
            0x17 => Property::RequestProblemInformation(r.u8()?),
            0x18 => Property::WillDelayInterval(r.u32()?),
            0x19 => Property::RequestResponseInformation(r.u8()?),
            0x1A => Property::ResponseInformation(r.string()?.to_owned()),
            0x1C => Property::ServerReference(r.string()?.to_owned()),
            0x1F => Property::ReasonString(r.string()?.to_owned()),
            0x21 => match r.u16()? {
                0 => return Err(DecodeError::MalformedPacket("receive maximum cannot be 0")),
                v => Property::ReceiveMaximum(v),
            },
            0x22 => Property::TopicAliasMaximum(r.u16()?),
            0x23 => match r.u16()? {
                0 => return Err(DecodeError::MalformedPacket("topic alias cannot be 0")),
                v => Property::TopicAlias(v),
            },
            0x24 => Property::MaximumQoS(r.u8()?),
            0x25 => Property::RetainAvailable(r.u8()?),
            0x26 => {
                let key = r.string()?.to_owned();
                Property::UserProperty(key, r.string()?.to_owned())
            }
            0x27 => match r.u32()? {
                0 => {
                    return Err(DecodeError::MalformedPacket(
                        "maximum packet size cannot be 0",
                    ))
                }
                v => Property::MaximumPacketSize(v),
            },
            0x28 => Property::WildcardSubscriptionAvailable(r.u8()?),
            0x29 => Property::SubscriptionIdentifierAvailable(r.u8()?),
            0x2A => Property::SharedSubscriptionAvailable(r.u8()?),
            other => return Err(DecodeError::InvalidPropertyId(other)),
        };

        Ok(prop)
    }

    pub fn id(&self) -> PropertyId {
        match self {
            Property::PayloadFormatIndicator(_) => PropertyId::PayloadFormatIndicator,
            Property::MessageExpiryInterval(_) => PropertyId::MessageExpiryInterval,
            Property::ContentType(_) => PropertyId::ContentType,
            Property::ResponseTopic(_) => PropertyId::ResponseTopic,
            Property::CorrelationData(_) => PropertyId::CorrelationData,
            Property::SubscriptionIdentifier(_) => PropertyId::SubscriptionIdentifier,
            Property::SessionExpiryInterval(_) => PropertyId::SessionExpiryInterval,
            Property::AssignedClientIdentifier(_) => PropertyId::AssignedClientIdentifier,
            Property::ServerKeepAlive(_) => PropertyId::ServerKeepAlive,
            Property::AuthenticationMethod(_) => PropertyId::AuthenticationMethod,
            Property::AuthenticationData(_) => PropertyId::AuthenticationData,
            Property::RequestProblemInformation(_) => PropertyId::RequestProblemInformation,
            Property::WillDelayInterval(_) => PropertyId::WillDelayInterval,
            Property::RequestResponseInformation(_) => PropertyId::RequestResponseInformation,
            Property::ResponseInformation(_) => PropertyId::ResponseInformation,
            Property::ServerReference(_) => PropertyId::ServerReference,
            Property::ReasonString(_) => PropertyId::ReasonString,
            Property::ReceiveMaximum(_) => PropertyId::ReceiveMaximum,
            Property::TopicAliasMaximum(_) => PropertyId::TopicAliasMaximum,
            Property::TopicAlias(_) => PropertyId::TopicAlias,
            Property::MaximumQoS(_) => PropertyId::MaximumQoS,
            Property::RetainAvailable(_) => PropertyId::RetainAvailable,
            Property::UserProperty(_, _) => PropertyId::UserProperty,
            Property::MaximumPacketSize(_) => PropertyId::MaximumPacketSize,
            Property::WildcardSubscriptionAvailable(_) => PropertyId::WildcardSubscriptionAvailable,
            Property::SubscriptionIdentifierAvailable(_) => {
                PropertyId::SubscriptionIdentifierAvailable
            }
            Property::SharedSubscriptionAvailable(_) => PropertyId::SharedSubscriptionAvailable,
        }
    }

    /// Encoded size including the identifier byte
    pub fn encoded_size(&self) -> usize {
        1 + match self {
            Property::PayloadFormatIndicator(_)
            | Property::RequestProblemInformation(_)
            | Property::RequestResponseInformation(_)
            | Property::MaximumQoS(_)
            | Property::RetainAvailable(_)
            | Property::WildcardSubscriptionAvailable(_)
            | Property::SubscriptionIdentifierAvailable(_)
            | Property::SharedSubscriptionAvailable(_) => 1,
            Property::ServerKeepAlive(_)
            | Property::ReceiveMaximum(_)
            | Property::TopicAliasMaximum(_)
            | Property::TopicAlias(_) => 2,
            Property::MessageExpiryInterval(_)
            | Property::SessionExpiryInterval(_)
            | Property::WillDelayInterval(_)
            | Property::MaximumPacketSize(_) => 4,
            Property::ContentType(s)
            | Property::ResponseTopic(s)
            | Property::AssignedClientIdentifier(s)
            | Property::AuthenticationMethod(s)
            | Property::ResponseInformation(s)
            | Property::ServerReference(s)
            | Property::ReasonString(s) => 2 + s.len(),
            Property::CorrelationData(d) | Property::AuthenticationData(d) => 2 + d.len(),
            Property::SubscriptionIdentifier(v) => variable_int_len(*v),
            Property::UserProperty(k, v) => 4 + k.len() + v.len(),
        }
    }

    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(self.id() as u8);
        match self {
            Property::PayloadFormatIndicator(v)
            | Property::RequestProblemInformation(v)
            | Property::RequestResponseInformation(v)
            | Property::MaximumQoS(v)
            | Property::RetainAvailable(v)
            | Property::WildcardSubscriptionAvailable(v)
            | Property::SubscriptionIdentifierAvailable(v)
            | Property::SharedSubscriptionAvailable(v) => buf.put_u8(*v),
            Property::ServerKeepAlive(v)
            | Property::ReceiveMaximum(v)
            | Property::TopicAliasMaximum(v)
            | Property::TopicAlias(v) => buf.put_u16(*v),
            Property::MessageExpiryInterval(v)
            | Property::SessionExpiryInterval(v)
            | Property::WillDelayInterval(v)
            | Property::MaximumPacketSize(v) => buf.put_u32(*v),
            Property::ContentType(s)
            | Property::ResponseTopic(s)
            | Property::AssignedClientIdentifier(s)
            | Property::AuthenticationMethod(s)
            | Property::ResponseInformation(s)
            | Property::ServerReference(s)
            | Property::ReasonString(s) => write_string(buf, s)?,
            Property::CorrelationData(d) | Property::AuthenticationData(d) => write_binary(buf, d)?,
            Property::SubscriptionIdentifier(v) => {
                write_variable_int(buf, *v)?;
            }
            Property::UserProperty(k, v) => {
                write_string(buf, k)?;
                write_string(buf, v)?;
            }
        }
        Ok(())
    }
}

/// Typed collection of MQTT v5.0 properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub subscription_identifiers: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub request_problem_information: Option<u8>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<u8>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
}

/// Store `value` in a single-valued slot, rejecting a second occurrence
fn set_once<T>(slot: &mut Option<T>, value: T, id: PropertyId) -> Result<(), DecodeError> {
    if slot.is_some() {
        return Err(DecodeError::DuplicateProperty(id as u8));
    }
    *slot = Some(value);
    Ok(())
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Add a decoded property; only user properties and subscription
    /// identifiers may repeat
    pub fn insert(&mut self, prop: Property) -> Result<(), DecodeError> {
        let id = prop.id();
        match prop {
            Property::PayloadFormatIndicator(v) => {
                set_once(&mut self.payload_format_indicator, v, id)
            }
            Property::MessageExpiryInterval(v) => {
                set_once(&mut self.message_expiry_interval, v, id)
            }
            Property::ContentType(v) => set_once(&mut self.content_type, v, id),
            Property::ResponseTopic(v) => set_once(&mut self.response_topic, v, id),
            Property::CorrelationData(v) => set_once(&mut self.correlation_data, v, id),
            Property::SubscriptionIdentifier(v) => {
                self.subscription_identifiers.push(v);
                Ok(())
            }
            Property::SessionExpiryInterval(v) => {
                set_once(&mut self.session_expiry_interval, v, id)
            }
            Property::AssignedClientIdentifier(v) => {
                set_once(&mut self.assigned_client_identifier, v, id)
            }
            Property::ServerKeepAlive(v) => set_once(&mut self.server_keep_alive, v, id),
            Property::AuthenticationMethod(v) => set_once(&mut self.authentication_method, v, id),
            Property::AuthenticationData(v) => set_once(&mut self.authentication_data, v, id),
            Property::RequestProblemInformation(v) => {
                set_once(&mut self.request_problem_information, v, id)
            }
            Property::WillDelayInterval(v) => set_once(&mut self.will_delay_interval, v, id),
            Property::RequestResponseInformation(v) => {
                set_once(&mut self.request_response_information, v, id)
            }
            Property::ResponseInformation(v) => set_once(&mut self.response_information, v, id),
            Property::ServerReference(v) => set_once(&mut self.server_reference, v, id),
            Property::ReasonString(v) => set_once(&mut self.reason_string, v, id),
            Property::ReceiveMaximum(v) => set_once(&mut self.receive_maximum, v, id),
            Property::TopicAliasMaximum(v) => set_once(&mut self.topic_alias_maximum, v, id),
            Property::TopicAlias(v) => set_once(&mut self.topic_alias, v, id),
            Property::MaximumQoS(v) => set_once(&mut self.maximum_qos, v, id),
            Property::RetainAvailable(v) => set_once(&mut self.retain_available, v, id),
            Property::UserProperty(k, v) => {
                self.user_properties.push((k, v));
                Ok(())
            }
            Property::MaximumPacketSize(v) => set_once(&mut self.maximum_packet_size, v, id),
            Property::WildcardSubscriptionAvailable(v) => {
                set_once(&mut self.wildcard_subscription_available, v, id)
            }
            Property::SubscriptionIdentifierAvailable(v) => {
                set_once(&mut self.subscription_identifier_available, v, id)
            }
            Property::SharedSubscriptionAvailable(v) => {
                set_once(&mut self.shared_subscription_available, v, id)
            }
        }
    }

    /// Flatten into wire order
    pub fn to_list(&self) -> Vec<Property> {
        let mut list = Vec::new();

        macro_rules! push {
            ($field:ident, $variant:ident) => {
                if let Some(v) = &self.$field {
                    list.push(Property::$variant(v.clone()));
                }
            };
        }

        push!(payload_format_indicator, PayloadFormatIndicator);
        push!(message_expiry_interval, MessageExpiryInterval);
        push!(content_type, ContentType);
        push!(response_topic, ResponseTopic);
        push!(correlation_data, CorrelationData);
        list.extend(
            self.subscription_identifiers
                .iter()
                .map(|v| Property::SubscriptionIdentifier(*v)),
        );
        push!(session_expiry_interval, SessionExpiryInterval);
        push!(assigned_client_identifier, AssignedClientIdentifier);
        push!(server_keep_alive, ServerKeepAlive);
        push!(authentication_method, AuthenticationMethod);
        push!(authentication_data, AuthenticationData);
        push!(request_problem_information, RequestProblemInformation);
        push!(will_delay_interval, WillDelayInterval);
        push!(request_response_information, RequestResponseInformation);
        push!(response_information, ResponseInformation);
        push!(server_reference, ServerReference);
        push!(reason_string, ReasonString);
        push!(receive_maximum, ReceiveMaximum);
        push!(topic_alias_maximum, TopicAliasMaximum);
        push!(topic_alias, TopicAlias);
        push!(maximum_qos, MaximumQoS);
        push!(retain_available, RetainAvailable);
        list.extend(
            self.user_properties
                .iter()
                .map(|(k, v)| Property::UserProperty(k.clone(), v.clone())),
        );
        push!(maximum_packet_size, MaximumPacketSize);
        push!(wildcard_subscription_available, WildcardSubscriptionAvailable);
        push!(subscription_identifier_available, SubscriptionIdentifierAvailable);
        push!(shared_subscription_available, SharedSubscriptionAvailable);

        list
    }

    /// Size of the property list, excluding its length prefix
    pub fn encoded_size(&self) -> usize {
        self.to_list().iter().map(Property::encoded_size).sum()
    }

    /// Size including the variable-length prefix
    pub fn wire_size(&self) -> usize {
        let size = self.encoded_size();
        variable_int_len(size as u32) + size
    }

    /// Decode a length-prefixed property block
    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let len = r.variable_int()? as usize;
        let mut block = r.sub_reader(len)?;

        let mut props = Properties::new();
        while !block.is_empty() {
            props.insert(Property::read(&mut block)?)?;
        }
        Ok(props)
    }

    /// Encode with a length prefix
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let list = self.to_list();
        let size: usize = list.iter().map(Property::encoded_size).sum();
        write_variable_int(buf, size as u32)?;
        for prop in &list {
            prop.write(buf)?;
        }
        Ok(())
    }
}
