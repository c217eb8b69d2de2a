//! Reason codes
//!
//! MQTT 5.0 reason codes, plus the mappings to the return codes used by
//! CONNACK and SUBACK in MQTT 3.x.

use std::fmt;

use super::QoS;

macro_rules! reason_codes {
    ($($(#[$meta:meta])* $name:ident = $value:literal => $text:literal,)+) => {
        /// MQTT v5.0 reason code
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(u8)]
        pub enum ReasonCode {
            /// Success / normal disconnection / granted QoS 0
            #[default]
            Success = 0x00,
            $($(#[$meta])* $name = $value,)+
        }

        impl ReasonCode {
            pub fn from_u8(v: u8) -> Option<Self> {
                match v {
                    0x00 => Some(ReasonCode::Success),
                    $($value => Some(ReasonCode::$name),)+
                    _ => None,
                }
            }

            fn text(self) -> &'static str {
                match self {
                    ReasonCode::Success => "Success",
                    $(ReasonCode::$name => $text,)+
                }
            }
        }
    };
}

reason_codes! {
    GrantedQoS1 = 0x01 => "Granted QoS 1",
    GrantedQoS2 = 0x02 => "Granted QoS 2",
    DisconnectWithWill = 0x04 => "Disconnect with Will Message",
    NoMatchingSubscribers = 0x10 => "No matching subscribers",
    NoSubscriptionExisted = 0x11 => "No subscription existed",
    UnspecifiedError = 0x80 => "Unspecified error",
    MalformedPacket = 0x81 => "Malformed Packet",
    ProtocolError = 0x82 => "Protocol Error",
    ImplementationError = 0x83 => "Implementation specific error",
    UnsupportedProtocolVersion = 0x84 => "Unsupported Protocol Version",
    ClientIdNotValid = 0x85 => "Client Identifier not valid",
    BadUserNameOrPassword = 0x86 => "Bad User Name or Password",
    NotAuthorized = 0x87 => "Not authorized",
    ServerUnavailable = 0x88 => "Server unavailable",
    ServerBusy = 0x89 => "Server busy",
    Banned = 0x8A => "Banned",
    ServerShuttingDown = 0x8B => "Server shutting down",
    KeepAliveTimeout = 0x8D => "Keep Alive timeout",
    SessionTakenOver = 0x8E => "Session taken over",
    TopicFilterInvalid = 0x8F => "Topic Filter invalid",
    TopicNameInvalid = 0x90 => "Topic Name invalid",
    PacketIdInUse = 0x91 => "Packet Identifier in use",
    PacketIdNotFound = 0x92 => "Packet Identifier not found",
    ReceiveMaxExceeded = 0x93 => "Receive Maximum exceeded",
    TopicAliasInvalid = 0x94 => "Topic Alias invalid",
    PacketTooLarge = 0x95 => "Packet too large",
    QuotaExceeded = 0x97 => "Quota exceeded",
    PayloadFormatInvalid = 0x99 => "Payload format invalid",
    RetainNotSupported = 0x9A => "Retain not supported",
    QoSNotSupported = 0x9B => "QoS not supported",
    SharedSubsNotSupported = 0x9E => "Shared Subscriptions not supported",
    SubIdNotSupported = 0xA1 => "Subscription Identifiers not supported",
    WildcardSubsNotSupported = 0xA2 => "Wildcard Subscriptions not supported",
}

impl ReasonCode {
    #[inline]
    pub fn is_success(self) -> bool {
        (self as u8) < 0x80
    }

    #[inline]
    pub fn is_error(self) -> bool {
        !self.is_success()
    }

    /// SUBACK code for a granted subscription
    pub fn granted(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => ReasonCode::Success,
            QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
            QoS::ExactlyOnce => ReasonCode::GrantedQoS2,
        }
    }

    /// MQTT 3.x CONNACK return code
    pub fn to_v3_connack_code(self) -> u8 {
        match self {
            ReasonCode::Success => 0x00,
            ReasonCode::UnsupportedProtocolVersion => 0x01,
            ReasonCode::ClientIdNotValid => 0x02,
            ReasonCode::ServerUnavailable | ReasonCode::ServerBusy => 0x03,
            ReasonCode::BadUserNameOrPassword => 0x04,
            _ => 0x05,
        }
    }

    pub fn from_v3_connack_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ReasonCode::Success),
            0x01 => Some(ReasonCode::UnsupportedProtocolVersion),
            0x02 => Some(ReasonCode::ClientIdNotValid),
            0x03 => Some(ReasonCode::ServerUnavailable),
            0x04 => Some(ReasonCode::BadUserNameOrPassword),
            0x05 => Some(ReasonCode::NotAuthorized),
            _ => None,
        }
    }

    /// MQTT 3.x SUBACK return code: granted QoS or 0x80 for failure
    pub fn to_v3_suback_code(self) -> u8 {
        match self {
            ReasonCode::Success => 0x00,
            ReasonCode::GrantedQoS1 => 0x01,
            ReasonCode::GrantedQoS2 => 0x02,
            _ => 0x80,
        }
    }

    pub fn from_v3_suback_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ReasonCode::Success),
            0x01 => Some(ReasonCode::GrantedQoS1),
            0x02 => Some(ReasonCode::GrantedQoS2),
            0x80 => Some(ReasonCode::UnspecifiedError),
            _ => None,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8() {
        assert_eq!(ReasonCode::from_u8(0x8E), Some(ReasonCode::SessionTakenOver));
        assert_eq!(ReasonCode::from_u8(0x00), Some(ReasonCode::Success));
        assert_eq!(ReasonCode::from_u8(0x03), None);
    }

    #[test]
    fn test_v3_mappings() {
        assert_eq!(ReasonCode::ClientIdNotValid.to_v3_connack_code(), 0x02);
        assert_eq!(ReasonCode::TopicFilterInvalid.to_v3_suback_code(), 0x80);
        assert_eq!(ReasonCode::granted(QoS::ExactlyOnce).to_v3_suback_code(), 0x02);
        assert_eq!(ReasonCode::from_v3_suback_code(0x03), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(ReasonCode::TopicFilterInvalid.to_string(), "Topic Filter invalid");
        assert!(ReasonCode::GrantedQoS2.is_success());
        assert!(ReasonCode::PacketIdNotFound.is_error());
    }
}
