//! In-memory radio hub
//!
//! Models the ESP-NOW link for tests and demos: endpoints share a hub,
//! frames are delivered FIFO between endpoints whose channel numbers match,
//! and an endpoint can be marked unreachable to play a sleeping or
//! out-of-range node. Sends to unregistered peers fail the way the real
//! driver's do.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Mac, Radio, RadioError};

struct Endpoint {
    tx: mpsc::UnboundedSender<(Mac, Vec<u8>)>,
    channel: Arc<AtomicU8>,
    reachable: Arc<AtomicBool>,
}

/// Shared medium connecting loopback endpoints
#[derive(Default)]
pub struct LoopbackHub {
    endpoints: Mutex<HashMap<Mac, Endpoint>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new endpoint on `channel`
    pub fn endpoint(self: &Arc<Self>, mac: Mac, channel: u8) -> LoopbackRadio {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(AtomicU8::new(channel));
        let reachable = Arc::new(AtomicBool::new(true));
        self.endpoints.lock().insert(
            mac,
            Endpoint {
                tx,
                channel: channel.clone(),
                reachable: reachable.clone(),
            },
        );
        LoopbackRadio {
            hub: self.clone(),
            mac,
            channel,
            reachable,
            rx: tokio::sync::Mutex::new(rx),
            peers: Mutex::new(Vec::new()),
        }
    }
}

/// One endpoint of the in-memory radio
pub struct LoopbackRadio {
    hub: Arc<LoopbackHub>,
    mac: Mac,
    channel: Arc<AtomicU8>,
    reachable: Arc<AtomicBool>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Mac, Vec<u8>)>>,
    peers: Mutex<Vec<Mac>>,
}

impl LoopbackRadio {
    /// Mark this endpoint asleep/awake; sends towards it fail while asleep
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Radio for LoopbackRadio {
    fn mac(&self) -> Mac {
        self.mac
    }

    fn channel(&self) -> u8 {
        self.channel.load(Ordering::SeqCst)
    }

    fn set_channel(&self, channel: u8) {
        self.channel.store(channel, Ordering::SeqCst);
    }

    fn add_peer(&self, mac: Mac) -> Result<(), RadioError> {
        let mut peers = self.peers.lock();
        if !peers.contains(&mac) {
            peers.push(mac);
        }
        Ok(())
    }

    async fn send(&self, to: Mac, frame: &[u8]) -> Result<(), RadioError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RadioError::Down);
        }
        if !self.peers.lock().contains(&to) {
            return Err(RadioError::Down);
        }
        let endpoints = self.hub.endpoints.lock();
        let target = endpoints.get(&to).ok_or(RadioError::Down)?;
        if !target.reachable.load(Ordering::SeqCst) {
            return Err(RadioError::Down);
        }
        // No channel handshake: a mismatch means the peer never hears us
        if target.channel.load(Ordering::SeqCst) != self.channel.load(Ordering::SeqCst) {
            return Err(RadioError::Down);
        }
        target
            .tx
            .send((self.mac, frame.to_vec()))
            .map_err(|_| RadioError::Down)
    }

    async fn recv(&self) -> Option<(Mac, Vec<u8>)> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn mac(n: u8) -> Mac {
        Mac::new([n; 6])
    }

    #[tokio::test]
    async fn frames_flow_between_matching_channels() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint(mac(1), 3);
        let b = hub.endpoint(mac(2), 3);
        a.add_peer(mac(2)).unwrap();
        a.send(mac(2), b"hello").await.unwrap();
        let (from, frame) = b.recv().await.unwrap();
        assert_eq!(from, mac(1));
        assert_eq!(frame, b"hello");
    }

    #[tokio::test]
    async fn channel_mismatch_fails_send() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint(mac(1), 3);
        let _b = hub.endpoint(mac(2), 7);
        a.add_peer(mac(2)).unwrap();
        assert_eq!(a.send(mac(2), b"x").await, Err(RadioError::Down));
    }

    #[tokio::test]
    async fn unregistered_peer_fails_send() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint(mac(1), 1);
        let _b = hub.endpoint(mac(2), 1);
        assert_eq!(a.send(mac(2), b"x").await, Err(RadioError::Down));
    }

    #[tokio::test]
    async fn sleeping_endpoint_fails_send_then_recovers() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint(mac(1), 1);
        let b = hub.endpoint(mac(2), 1);
        a.add_peer(mac(2)).unwrap();

        b.set_reachable(false);
        assert_eq!(a.send(mac(2), b"x").await, Err(RadioError::Down));

        b.set_reachable(true);
        a.send(mac(2), b"y").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.1, b"y");
    }
}
