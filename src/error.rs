//! Client error taxonomy
//!
//! `SocketDown` is recoverable and consumed by the reconnection supervisor;
//! everything else is surfaced to the caller of the failing operation.

use std::fmt;

use crate::protocol::{DecodeError, EncodeError};

/// Errors raised by the MQTT session and client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttError {
    /// Read/write deadline exceeded, connection closed by peer, or the
    /// network interface reports down
    SocketDown,
    /// CONNACK malformed or its return code non-zero
    BadConnack,
    /// QoS-1 publish exhausted its re-publish attempts without a PUBACK
    NoAck,
    /// Topic + payload exceed the MQTT remaining-length cap
    StringsTooLong,
    /// QoS outside {0, 1}
    BadQos,
    /// Empty or otherwise unusable topic
    IllegalTopic,
    /// Keepalive does not fit the CONNECT 16-bit field
    BadKeepalive,
    /// Broker sent a protocol violation
    Protocol(DecodeError),
}

impl fmt::Display for MqttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SocketDown => write!(f, "socket down"),
            Self::BadConnack => write!(f, "bad CONNACK from broker"),
            Self::NoAck => write!(f, "no PUBACK after max re-publish attempts"),
            Self::StringsTooLong => write!(f, "topic and payload too long"),
            Self::BadQos => write!(f, "only QoS 0 and 1 are supported"),
            Self::IllegalTopic => write!(f, "illegal topic"),
            Self::BadKeepalive => write!(f, "keepalive must be below 65536 seconds"),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

impl std::error::Error for MqttError {}

impl From<std::io::Error> for MqttError {
    fn from(_: std::io::Error) -> Self {
        MqttError::SocketDown
    }
}

impl From<DecodeError> for MqttError {
    fn from(e: DecodeError) -> Self {
        MqttError::Protocol(e)
    }
}

impl From<EncodeError> for MqttError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::PublishTooLong => MqttError::StringsTooLong,
            EncodeError::StringTooLong => MqttError::StringsTooLong,
            EncodeError::PacketTooLarge => MqttError::StringsTooLong,
        }
    }
}

/// Validate a QoS value from an untyped source
pub fn qos_check(qos: u8) -> Result<crate::protocol::QoS, MqttError> {
    crate::protocol::QoS::from_u8(qos).ok_or(MqttError::BadQos)
}
