//! Request/reply node link
//!
//! For nodes that wake, exchange a few frames with the gateway and go back
//! to sleep. Every operation is one transmission followed by a short reply
//! window; the transmit path is serialized so polling and publication never
//! interleave.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use super::{ChannelConfig, ChannelStore, LinkError, PubOutcome, WifiStation};
use crate::config::NodeConfig;
use crate::gateway::frame::{self, Command, ReplyTag};
use crate::protocol::QoS;
use crate::queue::RingQueue;
use crate::radio::{Mac, Radio};

/// WiFi association wait for the credentials strategy
const WIFI_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// ESP-NOW link to a gateway, one request/reply at a time
pub struct Link {
    radio: Arc<dyn Radio>,
    gateway: Mac,
    channel_cfg: ChannelConfig,
    wifi: Option<Arc<dyn WifiStation>>,
    store: Option<Arc<dyn ChannelStore>>,
    reply_timeout: Duration,
    chan_fails_max: u32,
    /// Frames that arrived while a reply was awaited
    queue: RingQueue<Vec<u8>>,
    fail_count: AtomicU32,
    tx_lock: tokio::sync::Mutex<()>,
}

impl Link {
    pub fn new(
        cfg: &NodeConfig,
        radio: Arc<dyn Radio>,
        channel_cfg: ChannelConfig,
    ) -> Result<Self, LinkError> {
        let gateway = Mac::from_hex(&cfg.gateway).ok_or(LinkError::BadGateway)?;
        Ok(Self {
            radio,
            gateway,
            channel_cfg,
            wifi: None,
            store: None,
            reply_timeout: cfg.reply_timeout,
            chan_fails_max: cfg.chan_fails_max,
            queue: RingQueue::new(cfg.queue_len),
            fail_count: AtomicU32::new(0),
            tx_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Supply the station interface for `ChannelConfig::Credentials`
    pub fn with_wifi(mut self, wifi: Arc<dyn WifiStation>) -> Self {
        self.wifi = Some(wifi);
        self
    }

    /// Supply a channel cache to skip scans after deep sleep
    pub fn with_channel_store(mut self, store: Arc<dyn ChannelStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn gateway(&self) -> Mac {
        self.gateway
    }

    /// Acquire (or re-acquire) the gateway channel. Returns the channel in
    /// use. Called once at start-up and again whenever repeated failures
    /// suggest the gateway moved.
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
                match timeout(WIFI_CONNECT_TIMEOUT, wifi.connect(ssid, password)).await {
                    Ok(true) => {}
                    _ => return Err(LinkError::WifiTimeout),
                }
                let ch = wifi.channel();
                self.radio.set_channel(ch);
                ch
            }
            ChannelConfig::Scan => self.acquire_by_scan().await?,
        };
        self.fail_count.store(0, Ordering::SeqCst);
        debug!(channel, "link connected");
        Ok(channel)
    }

    /// Try the cached channel first, then probe 1..=14
    async fn acquire_by_scan(&self) -> Result<u8, LinkError> {
        if let Some(cached) = self.store.as_ref().and_then(|s| s.load()) {
            self.radio.set_channel(cached);
            if let Some(ch) = self.get_channel().await {
                self.radio.set_channel(ch);
                return Ok(ch);
            }
            debug!(cached, "cached channel is stale");
        }
        for probe in 1..=14u8 {
            debug!(channel = probe, "testing channel");
            self.radio.set_channel(probe);
            if let Some(ch) = self.get_channel().await {
                // Use the channel the gateway reports, not the probe value
                self.radio.set_channel(ch);
                if let Some(store) = self.store.as_ref() {
                    store.save(ch);
                }
                return Ok(ch);
            }
        }
        Err(LinkError::NoChannel)
    }

    /// One send plus one bounded read
    async fn exchange(&self, request: &[u8]) -> Option<Vec<u8>> {
        if self.radio.send(self.gateway, request).await.is_err() {
            return None;
        }
        match timeout(self.reply_timeout, self.radio.recv()).await {
            Ok(Some((_, msg))) => Some(msg),
            _ => None,
        }
    }

    /// A radio-level failure; enough of them in a row invalidates the
    /// cached channel so the next `connect` rescans
    fn count_failure(&self) {
        let fails = self.fail_count.fetch_add(1, Ordering::SeqCst) + 1;
        if fails >= self.chan_fails_max {
            if let Some(store) = self.store.as_ref() {
                debug!(fails, "discarding cached channel");
                store.clear();
            }
        }
    }

    /// Publish through the gateway and interpret the backpressure tag.
    /// Frames that beat the tag to the radio are queued for a later `get`.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &str,
        retain: bool,
        qos: QoS,
    ) -> PubOutcome {
        let _guard = self.tx_lock.lock().await;
        let request = frame::render_publish(topic, payload, retain, qos);
        if self.radio.send(self.gateway, &request).await.is_err() {
            self.count_failure();
            return PubOutcome::EspFail;
        }
        loop {
            let msg = match timeout(self.reply_timeout, self.radio.recv()).await {
                Ok(Some((_, msg))) => msg,
                _ => {
                    self.count_failure();
                    return PubOutcome::EspFail;
                }
            };
            match ReplyTag::from_frame(&msg) {
                Some(ReplyTag::Ack) => {
                    self.fail_count.store(0, Ordering::SeqCst);
                    return PubOutcome::PubOk;
                }
                Some(ReplyTag::Nak) => return PubOutcome::BrokerOut,
                Some(ReplyTag::Bad) => return PubOutcome::PubFail,
                // An unsolicited frame raced the reply; keep it for get()
                _ => self.queue.push(msg),
            }
        }
    }

    /// Register a subscription with the gateway. The gateway answers
    /// nothing; delivery happens through later polls.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> bool {
        let _guard = self.tx_lock.lock().await;
        self.radio
            .send(self.gateway, &frame::render_subscribe(topic, qos))
            .await
            .is_ok()
    }

    /// Probe the gateway's broker connectivity
    pub async fn ping(&self) -> PubOutcome {
        let _guard = self.tx_lock.lock().await;
        match self.exchange(&Command::Ping.to_frame()).await {
            Some(msg) => match ReplyTag::from_frame(&msg) {
                Some(ReplyTag::Up) => PubOutcome::PubOk,
                _ => PubOutcome::PubFail,
            },
            None => PubOutcome::EspFail,
        }
    }

    /// Ask the gateway which channel it is on
    pub async fn get_channel(&self) -> Option<u8> {
        let _guard = self.tx_lock.lock().await;
        let msg = self.exchange(&Command::Chan.to_frame()).await?;
        std::str::from_utf8(&msg).ok()?.parse().ok()
    }

    /// Poll for queued subscription messages. Every decoded frame is fed
    /// to `deliver`; frames that fail to decode are dropped (they occur
    /// after gateway outages). Returns false on radio failure.
    pub async fn get(&self, mut deliver: impl FnMut(String, String, bool)) -> bool {
        let _guard = self.tx_lock.lock().await;
        if self
            .radio
            .send(self.gateway, &Command::Get.to_frame())
            .await
            .is_err()
        {
            self.count_failure();
            return false;
        }
        // Frames queued while awaiting earlier replies go first
        while let Some(msg) = self.queue.try_pop() {
            if let Some((topic, payload, retained)) = frame::parse_downstream(&msg) {
                deliver(topic, payload, retained);
            }
        }
        // Then read until the gateway goes quiet
        while let Ok(Some((_, msg))) = timeout(self.reply_timeout, self.radio.recv()).await {
            if let Some((topic, payload, retained)) = frame::parse_downstream(&msg) {
                deliver(topic, payload, retained);
            }
        }
        true
    }
}
