//! Wire and protocol errors
//!
//! [`DecodeError`] and [`EncodeError`] come out of the codec.
//! [`ProtocolError`] is what a connection fails with when the peer breaks
//! the rules; [`ProtocolError::reason_code`] picks the v5 DISCONNECT reason
//! that goes with it.

use std::fmt;

use super::ReasonCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A field runs past the end of the buffer. Field readers raise this;
    /// the frame decoder reports an incomplete frame as `Ok(None)` instead.
    InsufficientData,
    /// Packet type 0, or AUTH (15) which is not supported
    InvalidPacketType(u8),
    /// Remaining length continues past its fourth byte
    InvalidRemainingLength,
    InvalidProtocolName,
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    InvalidPropertyId(u8),
    DuplicateProperty(u8),
    /// Fixed header flags not allowed for the packet type
    InvalidFlags,
    MalformedPacket(&'static str),
    /// Larger than the receiver's maximum packet size
    PacketTooLarge,
    InvalidReasonCode(u8),
    InvalidSubscriptionOptions,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "field truncated"),
            Self::InvalidPacketType(t) => write!(f, "unsupported packet type {}", t),
            Self::InvalidRemainingLength => write!(f, "remaining length longer than 4 bytes"),
            Self::InvalidProtocolName => write!(f, "unknown protocol name"),
            Self::InvalidProtocolVersion(v) => write!(f, "unsupported protocol level {}", v),
            Self::InvalidQoS(q) => write!(f, "QoS {} out of range", q),
            Self::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            Self::InvalidPropertyId(id) => write!(f, "unknown property 0x{:02x}", id),
            Self::DuplicateProperty(id) => write!(f, "property 0x{:02x} repeated", id),
            Self::InvalidFlags => write!(f, "reserved flags set"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet exceeds maximum size"),
            Self::InvalidReasonCode(r) => write!(f, "reason code 0x{:02x} not allowed here", r),
            Self::InvalidSubscriptionOptions => write!(f, "reserved subscription option bits set"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length over 268,435,455 bytes
    PacketTooLarge,
    /// Length-prefixed field over 65,535 bytes
    StringTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet does not fit a remaining length"),
            Self::StringTooLong => write!(f, "field longer than 65535 bytes"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// A broken protocol rule; the connection that saw it is closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Decode(DecodeError),
    Encode(EncodeError),
    ProtocolViolation(&'static str),
    /// SUBSCRIBE or UNSUBSCRIBE with a filter that cannot match anything
    InvalidTopicFilter(String),
}

impl ProtocolError {
    /// DISCONNECT reason for a v5 peer
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::Decode(DecodeError::PacketTooLarge) => ReasonCode::PacketTooLarge,
            Self::Decode(_) => ReasonCode::MalformedPacket,
            Self::InvalidTopicFilter(_) => ReasonCode::TopicFilterInvalid,
            Self::Encode(_) => ReasonCode::ImplementationError,
            Self::ProtocolViolation(_) => ReasonCode::ProtocolError,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "cannot decode: {}", e),
            Self::Encode(e) => write!(f, "cannot encode: {}", e),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::InvalidTopicFilter(t) => write!(f, "topic filter {:?} is invalid", t),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(DecodeError::PacketTooLarge.into(), ReasonCode::PacketTooLarge; "oversized")]
    #[test_case(DecodeError::InvalidRemainingLength.into(), ReasonCode::MalformedPacket; "bad length")]
    #[test_case(ProtocolError::InvalidTopicFilter("a/#/b".into()), ReasonCode::TopicFilterInvalid; "bad filter")]
    #[test_case(ProtocolError::ProtocolViolation("x"), ReasonCode::ProtocolError; "violation")]
    fn test_reason_code(error: ProtocolError, expected: ReasonCode) {
        assert_eq!(error.reason_code(), expected);
    }
}
