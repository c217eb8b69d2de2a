//! MQTT protocol definitions
//!
//! Types shared by the codec, the sessions and the broker. A single set of
//! packet structs covers MQTT 3.1, 3.1.1 and 5.0; the wire layout differences
//! are handled by the codec based on [`ProtocolVersion`].

mod error;
mod packet;
mod properties;
mod reason;

pub use error::{DecodeError, EncodeError, ProtocolError};
pub use packet::*;
pub use properties::{Properties, Property};
pub use reason::ReasonCode;

/// MQTT protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// MQTT 3.1 (protocol name "MQIsdp", level 3)
    V31 = 3,
    /// MQTT 3.1.1 (protocol level 4)
    V311 = 4,
    /// MQTT 5.0 (protocol level 5)
    V5 = 5,
}

impl ProtocolVersion {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            3 => Some(ProtocolVersion::V31),
            4 => Some(ProtocolVersion::V311),
            5 => Some(ProtocolVersion::V5),
            _ => None,
        }
    }

    /// Protocol name carried in the CONNECT variable header
    pub fn protocol_name(self) -> &'static str {
        match self {
            ProtocolVersion::V31 => "MQIsdp",
            ProtocolVersion::V311 | ProtocolVersion::V5 => "MQTT",
        }
    }

    /// Whether packets carry a properties block
    #[inline]
    pub fn has_properties(self) -> bool {
        self == ProtocolVersion::V5
    }
}

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the lower of two QoS levels
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// Retain handling options (MQTT v5.0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    /// Send retained messages at subscription time
    #[default]
    SendAtSubscribe = 0,
    /// Send retained messages only for new subscriptions
    SendAtSubscribeIfNew = 1,
    /// Do not send retained messages
    DoNotSend = 2,
}

impl RetainHandling {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RetainHandling::SendAtSubscribe),
            1 => Some(RetainHandling::SendAtSubscribeIfNew),
            2 => Some(RetainHandling::DoNotSend),
            _ => None,
        }
    }
}

/// Per-filter subscription options
///
/// Only `qos` exists on the wire before MQTT 5.0; the remaining flags keep
/// their defaults for older clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscriptionOptions {
    /// Options with the given maximum QoS and every v5 flag at its default
    pub fn with_qos(qos: QoS) -> Self {
        Self {
            qos,
            ..Default::default()
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        if (byte & 0xC0) != 0 {
            return None;
        }

        Some(Self {
            qos: QoS::from_u8(byte & 0x03)?,
            no_local: (byte & 0x04) != 0,
            retain_as_published: (byte & 0x08) != 0,
            retain_handling: RetainHandling::from_u8((byte >> 4) & 0x03)?,
        })
    }

    pub fn to_byte(self) -> u8 {
        (self.qos as u8)
            | ((self.no_local as u8) << 2)
            | ((self.retain_as_published as u8) << 3)
            | ((self.retain_handling as u8) << 4)
    }
}
