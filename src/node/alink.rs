//! Asynchronous node link
//!
//! For mains-powered nodes that stay awake: a long-running reader task
//! classifies every inbound frame, broker reachability is exposed as an
//! event stream, and a poll task prompts the gateway to flush queued
//! subscription messages. Publish awaits the gateway's ACK; wrap the call
//! in a timeout to get watchdog-style cancellation and then `connect`
//! again on prolonged silence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::debug;

use super::{ChannelConfig, ChannelStore, LinkError, WifiStation};
use crate::config::NodeConfig;
use crate::gateway::frame::{self, Command, ReplyTag};
use crate::protocol::QoS;
use crate::queue::RingQueue;
use crate::radio::{Mac, Radio};

/// WiFi association wait for the credentials strategy
const WIFI_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// An inbound subscription message: topic, payload, retained
pub type NodeMessage = (String, String, bool);

/// Always-on ESP-NOW link with an event surface
pub struct AsyncLink {
    radio: Arc<dyn Radio>,
    gateway: Mac,
    channel_cfg: ChannelConfig,
    wifi: Option<Arc<dyn WifiStation>>,
    store: Option<Arc<dyn ChannelStore>>,
    poll_interval: Duration,

    /// Application frames (everything that is not a control tag)
    queue: RingQueue<Vec<u8>>,
    /// Broker reachability as last reported by the gateway
    broker_tx: watch::Sender<bool>,
    ack: Notify,
    esp_connected: AtomicBool,
    wifi_connected: AtomicBool,
    /// Serializes transmissions
    tx_lock: tokio::sync::Mutex<()>,
    /// Serializes publish-and-await-ACK cycles
    pub_lock: tokio::sync::Mutex<()>,
}

impl AsyncLink {
    pub fn new(
        cfg: &NodeConfig,
        radio: Arc<dyn Radio>,
        channel_cfg: ChannelConfig,
    ) -> Result<Self, LinkError> {
        let gateway = Mac::from_hex(&cfg.gateway).ok_or(LinkError::BadGateway)?;
        let (broker_tx, _) = watch::channel(false);
        Ok(Self {
            radio,
            gateway,
            channel_cfg,
            wifi: None,
            store: None,
            poll_interval: cfg.poll_interval,
            queue: RingQueue::new(cfg.queue_len),
            broker_tx,
            ack: Notify::new(),
            esp_connected: AtomicBool::new(false),
            wifi_connected: AtomicBool::new(false),
            tx_lock: tokio::sync::Mutex::new(()),
            pub_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Supply the station interface for `ChannelConfig::Credentials`
    pub fn with_wifi(mut self, wifi: Arc<dyn WifiStation>) -> Self {
        self.wifi = Some(wifi);
        self
    }

    /// Supply a channel cache shared with a deep-sleep boot path
    pub fn with_channel_store(mut self, store: Arc<dyn ChannelStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Broker reachability events; `true` while the gateway reports UP
    pub fn watch_broker(&self) -> watch::Receiver<bool> {
        self.broker_tx.subscribe()
    }

    /// Radio-level contact with the gateway as of the last send
    pub fn esp_connected(&self) -> bool {
        self.esp_connected.load(Ordering::SeqCst)
    }

    /// Acquire the channel and start the reader and poll tasks
    pub async fn run(self: &Arc<Self>) -> Result<(), LinkError> {
        self.connect().await?;
        let poller = self.clone();
        tokio::spawn(async move { poller.poll_task().await });
        let reader = self.clone();
        tokio::spawn(async move { reader.reader_task().await });
        Ok(())
    }

    /// Channel acquisition; also used to recover after prolonged silence
    pub async fn connect(&self) -> Result<u8, LinkError> {
        self.radio.add_peer(self.gateway)?;
        let channel = match &self.channel_cfg {
            ChannelConfig::Fixed(ch) => {
                self.radio.set_channel(*ch);
                *ch
            }
            ChannelConfig::Credentials { ssid, password } => {
                let wifi = self
                    .wifi
                    .as_ref()
                    .ok_or(LinkError::Unsupported("a wifi station"))?;
                match tokio::time::timeout(WIFI_CONNECT_TIMEOUT, wifi.connect(ssid, password))
                    .await
                {
                    Ok(true) => {}
                    _ => return Err(LinkError::WifiTimeout),
                }
                let ch = wifi.channel();
                self.radio.set_channel(ch);
                ch
            }
            ChannelConfig::Scan => {
                return Err(LinkError::Unsupported(
                    "a fixed channel or credentials",
                ))
            }
        };
        if let Some(store) = self.store.as_ref() {
            store.save(channel);
        }
        debug!(channel, "async link connected");
        Ok(channel)
    }

    /// Send one frame, updating the radio-contact state
    async fn a_send(&self, msg: &[u8]) -> bool {
        let _guard = self.tx_lock.lock().await;
        let ok = self.radio.send(self.gateway, msg).await.is_ok();
        self.esp_connected.store(ok, Ordering::SeqCst);
        ok
    }

    /// Prompt the gateway to report broker state and flush our queue.
    /// Polling slows fourfold during an outage but never stops: it is how
    /// reconnection is detected.
    async fn poll_task(self: Arc<Self>) {
        let aget = Command::Aget.to_frame();
        loop {
            let mut wait = self.poll_interval;
            if !self.a_send(&aget).await {
                wait *= 4;
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Classify inbound frames: control tags update events, the rest are
    /// application messages
    async fn reader_task(self: Arc<Self>) {
        while let Some((_, msg)) = self.radio.recv().await {
            match ReplyTag::from_frame(&msg) {
                Some(ReplyTag::Ack) => {
                    self.ack.notify_waiters();
                    self.set_broker(true);
                }
                Some(ReplyTag::Up) => self.set_broker(true),
                // NAK leaves the publish waiting; the watchdog handles it
                Some(ReplyTag::Nak) | Some(ReplyTag::Bad) | Some(ReplyTag::Down) => {
                    self.set_broker(false);
                }
                None => self.queue.push(msg),
            }
        }
        debug!("radio closed, reader ending");
    }

    fn set_broker(&self, up: bool) {
        self.wifi_connected.store(up, Ordering::SeqCst);
        self.broker_tx.send_replace(up);
    }

    /// Publish and await the gateway's ACK. Suspends across outages; wrap
    /// in `tokio::time::timeout` for watchdog cancellation, then call
    /// `connect` to recover the channel.
    pub async fn publish(&self, topic: &str, payload: &str, retain: bool, qos: QoS) {
        let _guard = self.pub_lock.lock().await;
        let request = frame::render_publish(topic, payload, retain, qos);
        loop {
            while !(self.wifi_connected.load(Ordering::SeqCst)
                && self.esp_connected.load(Ordering::SeqCst))
            {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            // Register for the ACK before transmitting so it cannot be lost
            let mut acked = std::pin::pin!(self.ack.notified());
            acked.as_mut().enable();
            if !self.a_send(&request).await {
                continue;
            }
            acked.await;
            return;
        }
    }

    /// Register a subscription with the gateway
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> bool {
        self.a_send(&frame::render_subscribe(topic, qos)).await
    }

    /// Next decoded subscription message; undecodable frames are skipped
    pub async fn next_message(&self) -> NodeMessage {
        loop {
            let raw = self.queue.pop().await;
            if let Some(msg) = frame::parse_downstream(&raw) {
                return msg;
            }
        }
    }
}
