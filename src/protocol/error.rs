//! Protocol error types

use std::fmt;

/// Errors that can occur during packet decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer
    InsufficientData,
    /// Invalid remaining length encoding (more than 4 continuation bytes)
    InvalidRemainingLength,
    /// Invalid QoS value
    InvalidQoS(u8),
    /// QoS 2 PUBLISH received; the design rejects QoS 2 at protocol level
    QoS2NotSupported,
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// Invalid packet flags
    InvalidFlags,
    /// Malformed packet
    MalformedPacket(&'static str),
    /// Packet exceeds the configured size limit
    PacketTooLarge,
    /// An ACK arrived for a packet identifier that was never outstanding
    UnknownPacketId(u16),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::QoS2NotSupported => write!(f, "QoS 2 publish not supported"),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::UnknownPacketId(pid) => write!(f, "ack for unknown packet id: {}", pid),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during packet encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length would exceed the 4-byte variable integer range
    PacketTooLarge,
    /// A length-prefixed string exceeds 65535 bytes
    StringTooLong,
    /// PUBLISH topic + payload reach the 2_097_152-byte remaining-length cap
    PublishTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
            Self::PublishTooLong => write!(f, "publish topic and payload too long"),
        }
    }
}

impl std::error::Error for EncodeError {}
