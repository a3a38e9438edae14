//! UDP datagram radio adapter
//!
//! Lets the gateway and nodes run on plain hosts: one datagram carries one
//! frame, prefixed with the sender's 6-byte MAC. Peer addresses are learned
//! from inbound traffic, or pinned with `add_route` for the fixed gateway
//! address a node starts from. Channels are notional on UDP; the value is
//! stored and reported but does not gate delivery.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tracing::debug;

use super::{Mac, Radio, RadioError};

/// Largest frame accepted; the real link caps payloads far below this
const MAX_FRAME: usize = 1024;

pub struct UdpRadio {
    sock: UdpSocket,
    mac: Mac,
    channel: AtomicU8,
    routes: DashMap<Mac, SocketAddr>,
}

impl UdpRadio {
    /// Bind a radio endpoint to `bind`
    pub async fn bind(bind: SocketAddr, mac: Mac, channel: u8) -> std::io::Result<Self> {
        let sock = UdpSocket::bind(bind).await?;
        Ok(Self {
            sock,
            mac,
            channel: AtomicU8::new(channel),
            routes: DashMap::new(),
        })
    }

    /// Pin a peer's socket address ahead of any traffic from it
    pub fn add_route(&self, mac: Mac, addr: SocketAddr) {
        self.routes.insert(mac, addr);
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.sock.local_addr()
    }
}

#[async_trait]
impl Radio for UdpRadio {
    fn mac(&self) -> Mac {
        self.mac
    }

    fn channel(&self) -> u8 {
        self.channel.load(Ordering::SeqCst)
    }

    fn set_channel(&self, channel: u8) {
        self.channel.store(channel, Ordering::SeqCst);
    }

    fn add_peer(&self, _mac: Mac) -> Result<(), RadioError> {
        // Registration is implicit; the address arrives with the traffic
        Ok(())
    }

    async fn send(&self, to: Mac, frame: &[u8]) -> Result<(), RadioError> {
        if frame.len() > MAX_FRAME {
            return Err(RadioError::Down);
        }
        let addr = *self.routes.get(&to).ok_or(RadioError::Down)?;
        let mut datagram = Vec::with_capacity(6 + frame.len());
        datagram.extend_from_slice(self.mac.as_bytes());
        datagram.extend_from_slice(frame);
        match self.sock.send_to(&datagram, addr).await {
            Ok(_) => Ok(()),
            Err(_) => Err(RadioError::Down),
        }
    }

    async fn recv(&self) -> Option<(Mac, Vec<u8>)> {
        let mut buf = [0u8; 6 + MAX_FRAME];
        loop {
            let (n, addr) = match self.sock.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(_) => return None,
            };
            if n < 6 {
                debug!(%addr, "runt datagram dropped");
                continue;
            }
            let mut mac_bytes = [0u8; 6];
            mac_bytes.copy_from_slice(&buf[..6]);
            let from = Mac::new(mac_bytes);
            self.routes.insert(from, addr);
            return Some((from, buf[6..n].to_vec()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_roundtrip_and_routes_are_learned() {
        let a = UdpRadio::bind("127.0.0.1:0".parse().unwrap(), Mac::new([1; 6]), 1)
            .await
            .unwrap();
        let b = UdpRadio::bind("127.0.0.1:0".parse().unwrap(), Mac::new([2; 6]), 1)
            .await
            .unwrap();
        a.add_route(Mac::new([2; 6]), b.local_addr().unwrap());

        a.send(Mac::new([2; 6]), b"ping").await.unwrap();
        let (from, frame) = b.recv().await.unwrap();
        assert_eq!(from, Mac::new([1; 6]));
        assert_eq!(frame, b"ping");

        // b learned a's address from the datagram and can reply
        b.send(Mac::new([1; 6]), b"pong").await.unwrap();
        let (from, frame) = a.recv().await.unwrap();
        assert_eq!(from, Mac::new([2; 6]));
        assert_eq!(frame, b"pong");
    }

    #[tokio::test]
    async fn send_without_route_fails() {
        let a = UdpRadio::bind("127.0.0.1:0".parse().unwrap(), Mac::new([1; 6]), 1)
            .await
            .unwrap();
        assert_eq!(
            a.send(Mac::new([9; 6]), b"x").await,
            Err(RadioError::Down)
        );
    }
}
