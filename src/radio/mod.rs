//! Radio abstraction
//!
//! ESP-NOW itself lives outside this crate; these types define the seam the
//! gateway and node link speak through. Frames are connectionless datagrams
//! addressed by MAC, and both ends must sit on the same WiFi channel.

mod loopback;
mod udp;

pub use loopback::{LoopbackHub, LoopbackRadio};
pub use udp::UdpRadio;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

/// A 6-byte radio MAC address, rendered as 12 lowercase hex digits
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mac([u8; 6]);

impl Mac {
    pub const BROADCAST: Mac = Mac([0xFF; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Mac(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Parse 12 hex digits (case-insensitive)
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 12 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let mut bytes = [0u8; 6];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(hex, 16).ok()?;
        }
        Some(Mac(bytes))
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({})", self)
    }
}

impl FromStr for Mac {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mac::from_hex(s).ok_or(())
    }
}

/// Radio failures. A failed send is non-fatal everywhere: the gateway keeps
/// the frame queued, the node lets the caller retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    /// Send failed: peer out of range, powered down, channel mismatch, or
    /// the local interface is not active
    Down,
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioError::Down => write!(f, "radio send failed"),
        }
    }
}

impl std::error::Error for RadioError {}

/// A connectionless, MAC-addressed frame transport
#[async_trait]
pub trait Radio: Send + Sync {
    /// This endpoint's own MAC
    fn mac(&self) -> Mac;

    /// Current WiFi channel
    fn channel(&self) -> u8;

    /// Move the interface to `channel`
    fn set_channel(&self, channel: u8);

    /// Register a peer MAC with the driver; idempotent
    fn add_peer(&self, mac: Mac) -> Result<(), RadioError>;

    /// Send one frame; `Ok` means the peer acknowledged at the link layer
    async fn send(&self, to: Mac, frame: &[u8]) -> Result<(), RadioError>;

    /// Receive the next frame; `None` when the radio is shut down
    async fn recv(&self) -> Option<(Mac, Vec<u8>)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_hex_roundtrip() {
        let mac = Mac::from_hex("a0b1c2d3e4f5").unwrap();
        assert_eq!(mac.to_string(), "a0b1c2d3e4f5");
        assert_eq!(mac.as_bytes(), &[0xA0, 0xB1, 0xC2, 0xD3, 0xE4, 0xF5]);
    }

    #[test]
    fn mac_hex_is_case_insensitive() {
        assert_eq!(
            Mac::from_hex("AABBCCDDEEFF"),
            Mac::from_hex("aabbccddeeff")
        );
    }

    #[test]
    fn bad_mac_strings_rejected() {
        assert!(Mac::from_hex("a0b1c2d3e4").is_none());
        assert!(Mac::from_hex("a0b1c2d3e4f5f6").is_none());
        assert!(Mac::from_hex("zzb1c2d3e4f5").is_none());
    }
}
