//! Node-side link layer
//!
//! The peer half of the gateway protocol: acquire the gateway's WiFi
//! channel, then publish, subscribe and poll over framed request/reply
//! exchanges. `Link` is the plain request/reply form for nodes that wake,
//! transmit and sleep; `AsyncLink` keeps a reader task running and exposes
//! broker state as events.

mod alink;
mod link;


pub use alink::{AsyncLink, NodeMessage};
pub use link::Link;

use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::radio::RadioError;

/// Result of a node publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubOutcome {
    /// Gateway queued the message with room to spare
    PubOk,
    /// Gateway queued it but its broker link is struggling
    BrokerOut,
    /// Gateway queue full; the message is lost
    PubFail,
    /// No radio contact with the gateway
    EspFail,
}

/// Channel acquisition and link errors
#[derive(Debug)]
pub enum LinkError {
    /// Gateway id is not a 12-hex-digit MAC
    BadGateway,
    /// No gateway answered on any channel
    NoChannel,
    /// WiFi credentials connect did not finish in time
    WifiTimeout,
    /// Channel strategy needs hardware this link was not given
    Unsupported(&'static str),
    /// Radio failure
    Radio(RadioError),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::BadGateway => write!(f, "gateway id must be 12 hex digits"),
            LinkError::NoChannel => write!(f, "no gateway found on any channel"),
            LinkError::WifiTimeout => write!(f, "wifi connect fail"),
            LinkError::Unsupported(what) => write!(f, "channel strategy needs {}", what),
            LinkError::Radio(e) => write!(f, "radio: {}", e),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<RadioError> for LinkError {
    fn from(e: RadioError) -> Self {
        LinkError::Radio(e)
    }
}

/// How the node finds the gateway's WiFi channel
#[derive(Debug, Clone)]
pub enum ChannelConfig {
    /// The channel is known and fixed
    Fixed(u8),
    /// Join the AP with credentials; the channel comes as a side effect
    Credentials { ssid: String, password: String },
    /// Probe channels 1..=14 until the gateway answers
    Scan,
}

/// Station interface used by the credentials strategy
#[async_trait]
pub trait WifiStation: Send + Sync {
    /// Join the AP; true once associated
    async fn connect(&self, ssid: &str, password: &str) -> bool;

    /// Channel learned from the association
    fn channel(&self) -> u8;
}

/// Non-volatile cache of the last working channel. Nodes waking from deep
/// sleep skip the scan when the cached channel still works.
pub trait ChannelStore: Send + Sync {
    fn load(&self) -> Option<u8>;
    fn save(&self, channel: u8);
    fn clear(&self);
}

/// In-memory channel store; stands in for RTC RAM on hosted targets
#[derive(Default)]
pub struct MemoryChannelStore(Mutex<Option<u8>>);

impl MemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelStore for MemoryChannelStore {
    fn load(&self) -> Option<u8> {
        *self.0.lock()
    }

    fn save(&self, channel: u8) {
        *self.0.lock() = Some(channel);
    }

    fn clear(&self) {
        *self.0.lock() = None;
    }
}
