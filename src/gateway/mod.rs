//! ESP-NOW to MQTT gateway
//!
//! Bridges intermittently-reachable radio peers to an MQTT broker.
//! Micropower peers spend most of their life in deep sleep; anything
//! published for them waits in a per-peer queue until they poll. Peer
//! publishes flow through a bounded publication queue whose depth is
//! signalled back as ACK/NAK/BAD so nodes can tell a healthy gateway from
//! one cut off from its broker.

pub mod frame;


use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::MqttClient;
use crate::config::{GatewayConfig, PubTopic};
use crate::error::MqttError;
use crate::ntp;
use crate::protocol::QoS;
use crate::queue::RingQueue;
use crate::radio::{Mac, Radio};

use frame::{Command, PubRequest, ReplyTag, UpstreamFrame};

struct TopicEntry {
    qos: QoS,
    peers: HashSet<Mac>,
}

struct TimeBase {
    epoch: u64,
    anchor: Instant,
}

/// The gateway: owns the resilient client, the radio, and all peer state
pub struct Gateway {
    cfg: GatewayConfig,
    client: Arc<MqttClient>,
    radio: Arc<dyn Radio>,
    gwid: Mac,
    /// Pending downstream messages per peer, oldest first
    queues: DashMap<Mac, Arc<RingQueue<Vec<u8>>>>,
    /// topic -> (qos, subscribed peers); one broker subscription per topic
    topics: parking_lot::Mutex<HashMap<String, TopicEntry>>,
    /// Peer publishes awaiting the broker
    pubq: RingQueue<PubRequest>,
    time_base: parking_lot::Mutex<Option<TimeBase>>,
}

impl Gateway {
    pub fn new(
        cfg: GatewayConfig,
        client: Arc<MqttClient>,
        radio: Arc<dyn Radio>,
    ) -> Arc<Self> {
        let gwid = radio.mac();
        let mut topics = HashMap::new();
        topics.insert(
            cfg.pub_all.topic.clone(),
            TopicEntry {
                qos: QoS::from_u8(cfg.pub_all.qos).unwrap_or(QoS::AtMostOnce),
                peers: HashSet::new(),
            },
        );
        let pubq = RingQueue::new(cfg.pubq_len);
        Arc::new(Self {
            cfg,
            client,
            radio,
            gwid,
            queues: DashMap::new(),
            topics: parking_lot::Mutex::new(topics),
            pubq,
            time_base: parking_lot::Mutex::new(None),
        })
    }

    pub fn gwid(&self) -> Mac {
        self.gwid
    }

    /// Publication queue depth (peer publishes awaiting the broker)
    pub fn pubq_len(&self) -> usize {
        self.pubq.len()
    }

    /// Pending downstream messages for one peer
    pub fn peer_queue_len(&self, mac: Mac) -> Option<usize> {
        self.queues.get(&mac).map(|q| q.len())
    }

    /// Downstream messages lost to per-peer queue overflow
    pub fn peer_discards(&self, mac: Mac) -> Option<u64> {
        self.queues.get(&mac).map(|q| q.discards())
    }

    /// Connect the client and run every gateway task. Returns only if the
    /// radio shuts down; the broker link is supervised forever.
    pub async fn run(self: Arc<Self>) -> Result<(), MqttError> {
        // Subscribe the edge observers before the first connect so the
        // initial up transition is seen
        let up = self.clone();
        tokio::spawn(async move { up.up_handler().await });
        let down = self.clone();
        tokio::spawn(async move { down.down_handler().await });

        self.client.connect().await?;
        info!(gwid = %self.gwid, "gateway online");

        let fanout = self.clone();
        tokio::spawn(async move { fanout.fanout_task().await });
        let publisher = self.clone();
        tokio::spawn(async move { publisher.publisher_task().await });

        self.ingest().await;
        Ok(())
    }

    /// Broker up edge: operational status, re-subscribe the topic table,
    /// kick one-shot time sync when the clock needs it
    async fn up_handler(self: Arc<Self>) {
        let mut rx = self.client.watch();
        let mut ntp_started = false;
        loop {
            if rx.changed().await.is_err() {
                return;
            }
            if !*rx.borrow_and_update() {
                continue;
            }
            self.pub_status(format!("Gateway {} connected to broker.", self.gwid));
            let snapshot: Vec<(String, QoS)> = self
                .topics
                .lock()
                .iter()
                .map(|(t, e)| (t.clone(), e.qos))
                .collect();
            for (topic, qos) in snapshot {
                if let Err(e) = self.client.subscribe(&topic, qos).await {
                    self.pub_error(format!("subscribe {} failed: {}", topic, e));
                }
            }
            if let Some(ref sr) = self.cfg.statreq {
                let qos = QoS::from_u8(sr.qos).unwrap_or(QoS::AtMostOnce);
                if let Err(e) = self.client.subscribe(&sr.topic, qos).await {
                    self.pub_error(format!("subscribe {} failed: {}", sr.topic, e));
                }
            }
            if !ntp_started && clock_unset() {
                if let Some(host) = self.cfg.ntp_host.clone() {
                    ntp_started = true;
                    let (tx, rx_time) = mpsc::channel(1);
                    let me = self.clone();
                    tokio::spawn(async move { me.adopt_time(rx_time).await });
                    let gate_client = self.client.clone();
                    tokio::spawn(ntp::sync_task(host, tx, move || {
                        gate_client.is_connected()
                    }));
                }
            }
        }
    }

    /// Broker down edge: queue a status message for delivery after recovery
    async fn down_handler(self: Arc<Self>) {
        let mut rx = self.client.watch();
        loop {
            if rx.changed().await.is_err() {
                return;
            }
            if *rx.borrow_and_update() {
                continue;
            }
            self.pub_status("WiFi or broker is down.".to_string());
        }
    }

    async fn adopt_time(self: Arc<Self>, mut rx: mpsc::Receiver<u64>) {
        if let Some(epoch) = rx.recv().await {
            *self.time_base.lock() = Some(TimeBase {
                epoch,
                anchor: Instant::now(),
            });
        }
    }

    fn now_epoch(&self) -> u64 {
        if let Some(ref tb) = *self.time_base.lock() {
            return tb.epoch + tb.anchor.elapsed().as_secs();
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Publish to an operational topic, timestamp-prefixed. Suppressed when
    /// the topic is not configured; delivery happens whenever the broker is
    /// next reachable.
    fn pub_to(&self, dest: &Option<PubTopic>, msg: String) {
        debug!("{}", msg);
        let Some(dest) = dest.as_ref() else { return };
        let stamped = format!(
            "{} {}",
            format_timestamp(self.now_epoch(), self.cfg.ntp_offset),
            msg
        );
        let client = self.client.clone();
        let topic = dest.topic.clone();
        let retain = dest.retain;
        let qos = QoS::from_u8(dest.qos).unwrap_or(QoS::AtMostOnce);
        tokio::spawn(async move {
            let _ = client.publish(&topic, stamped, retain, qos).await;
        });
    }

    fn pub_status(&self, msg: String) {
        self.pub_to(&self.cfg.status, msg);
    }

    fn pub_error(&self, msg: String) {
        warn!("{}", msg);
        self.pub_to(&self.cfg.errors, msg);
    }

    /// Send one frame to a peer; failure is reported, never fatal
    async fn do_send(&self, mac: Mac, msg: &[u8]) -> bool {
        match self.radio.send(mac, msg).await {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %mac, error = %e, "radio send failed");
                false
            }
        }
    }

    fn peer_queue(&self, mac: Mac) -> Arc<RingQueue<Vec<u8>>> {
        self.queues
            .entry(mac)
            .or_insert_with(|| Arc::new(RingQueue::new(self.cfg.qlen)))
            .clone()
    }

    /// Deliver or queue one downstream message for a peer. Messages are
    /// queued when anything is already queued (ordering) or in low-power
    /// mode (the peer is presumed asleep); otherwise one immediate send is
    /// attempted and the queue takes the message on failure.
    async fn try_send(&self, mac: Mac, msg: Vec<u8>) {
        let queue = self.peer_queue(mac);
        if !queue.is_empty() || self.cfg.lpmode {
            if queue.is_full() {
                self.pub_status(format!("Gateway: node {} queue full", mac));
            }
            queue.push(msg);
        } else if !self.do_send(mac, &msg).await {
            // Queue was empty so this cannot overflow
            queue.push(msg);
        }
    }

    /// Drain a peer's queue head-first, stopping at the first send failure;
    /// the peer may have gone back to sleep mid-drain
    async fn qsend(&self, mac: Mac) {
        let queue = self.peer_queue(mac);
        while let Some(msg) = queue.peek() {
            if self.do_send(mac, &msg).await {
                queue.try_pop();
            } else {
                self.pub_error(format!("Peer {} not responding", mac));
                break;
            }
        }
    }

    /// Broker-to-peers fan-out: render once, deliver to every subscriber
    async fn fanout_task(self: Arc<Self>) {
        loop {
            let msg = self.client.messages().pop().await;
            if let Some(ref sr) = self.cfg.statreq {
                if msg.topic == sr.topic {
                    self.pub_status("Status request not yet implemented".to_string());
                    continue;
                }
            }
            let payload = String::from_utf8_lossy(&msg.payload).into_owned();
            let rendered = frame::render_downstream(&msg.topic, &payload, msg.retained);
            let peers: Vec<Mac> = match self.topics.lock().get(&msg.topic) {
                Some(entry) => entry.peers.iter().copied().collect(),
                None => Vec::new(),
            };
            if peers.is_empty() {
                self.pub_error(format!("No nodes subscribed to topic {}", msg.topic));
                continue;
            }
            for mac in peers {
                debug!(peer = %mac, topic = %msg.topic, "fanning out");
                self.try_send(mac, rendered.clone()).await;
            }
        }
    }

    /// Drain the publication queue into the broker. Messages are popped
    /// only while connected so that during an outage every queued publish
    /// stays visible to the depth the ACK/NAK/BAD replies are computed from.
    async fn publisher_task(self: Arc<Self>) {
        loop {
            self.client.await_connection().await;
            let Some(req) = self.pubq.try_pop() else {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                continue;
            };
            if let Err(e) = self
                .client
                .publish(&req.topic, req.payload, req.retain, req.qos)
                .await
            {
                self.pub_error(format!("publish to {} failed: {}", req.topic, e));
            }
        }
    }

    /// First contact: queue, radio registration, default fan-out membership
    fn onboard(&self, mac: Mac) {
        if self.queues.contains_key(&mac) {
            return;
        }
        self.peer_queue(mac);
        if let Err(e) = self.radio.add_peer(mac) {
            self.pub_error(format!("radio add_peer {} failed: {}", mac, e));
        }
        if let Some(entry) = self.topics.lock().get_mut(&self.cfg.pub_all.topic) {
            entry.peers.insert(mac);
        }
        info!(peer = %mac, "peer onboarded");
    }

    /// Peers-to-broker ingest: runs on the radio's inbound stream forever
    async fn ingest(self: &Arc<Self>) {
        while let Some((mac, raw)) = self.radio.recv().await {
            let Some(parsed) = frame::parse_upstream(&raw) else {
                debug!(peer = %mac, "unformatted frame dropped");
                continue;
            };
            self.onboard(mac);
            match parsed {
                UpstreamFrame::Command(cmd) => self.handle_command(mac, cmd).await,
                UpstreamFrame::Subscribe { topic, qos } => {
                    self.handle_subscribe(mac, topic, qos);
                }
                UpstreamFrame::Publish(req) => self.handle_publish(mac, req).await,
                UpstreamFrame::Malformed => {
                    self.pub_error(format!("Malformed message from node {}", mac));
                }
            }
        }
        debug!("radio closed, ingest loop ending");
    }

    async fn handle_command(&self, mac: Mac, cmd: Command) {
        match cmd {
            Command::Chan => {
                let reply = self.radio.channel().to_string();
                self.do_send(mac, reply.as_bytes()).await;
            }
            Command::Ping => {
                self.send_broker_state(mac).await;
            }
            Command::Get => {
                self.qsend(mac).await;
            }
            Command::Aget => {
                self.send_broker_state(mac).await;
                self.qsend(mac).await;
            }
            Command::Unknown(name) => {
                self.pub_error(format!(
                    "Warning: unknown command {} from node {}",
                    name, mac
                ));
            }
        }
    }

    async fn send_broker_state(&self, mac: Mac) {
        let tag = if self.client.is_connected() {
            ReplyTag::Up
        } else {
            ReplyTag::Down
        };
        self.do_send(mac, tag.as_bytes()).await;
    }

    /// Add the peer to a topic's subscriber set, creating the broker-side
    /// subscription on first use. One broker subscription per topic; a
    /// different qos from a later peer is reported, not applied.
    fn handle_subscribe(self: &Arc<Self>, mac: Mac, topic: String, qos: QoS) {
        let mut topics = self.topics.lock();
        if let Some(entry) = topics.get_mut(&topic) {
            entry.peers.insert(mac);
            if qos != entry.qos {
                drop(topics);
                self.pub_error(format!(
                    "Warning: attempt to change qos of existing subscription: {}",
                    topic
                ));
            }
        } else {
            topics.insert(
                topic.clone(),
                TopicEntry {
                    qos,
                    peers: HashSet::from([mac]),
                },
            );
            drop(topics);
            let client = self.client.clone();
            let me = self.clone();
            tokio::spawn(async move {
                if let Err(e) = client.subscribe(&topic, qos).await {
                    me.pub_error(format!("subscribe {} failed: {}", topic, e));
                }
            });
        }
    }

    /// Queue a peer publish towards the broker and answer with the
    /// backpressure tag: BAD full/dropped, NAK past the soft limit, else ACK
    async fn handle_publish(&self, mac: Mac, req: PubRequest) {
        let reply = if self.pubq.is_full() {
            ReplyTag::Bad
        } else {
            match self.pubq.try_push(req) {
                Ok(()) => {
                    if self.pubq.len() > self.cfg.pub_threshold {
                        ReplyTag::Nak
                    } else {
                        ReplyTag::Ack
                    }
                }
                Err(_) => ReplyTag::Bad,
            }
        };
        self.do_send(mac, reply.as_bytes()).await;
    }
}

/// True when the platform clock has clearly never been set
fn clock_unset() -> bool {
    // Anything before 2001 means an unset RTC, not a real wall clock
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() < 978_307_200)
        .unwrap_or(true)
}

/// days-from-epoch to (year, month, day), proleptic Gregorian
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

/// Render `epoch` shifted by `offset_hours` as `d/m/yyyy HH:MM:SS`
fn format_timestamp(epoch: u64, offset_hours: i32) -> String {
    let total = epoch as i64 + offset_hours as i64 * 3600;
    let days = total.div_euclid(86_400);
    let secs = total.rem_euclid(86_400);
    let (y, m, d) = civil_from_days(days);
    format!(
        "{}/{}/{} {:02}:{:02}:{:02}",
        d,
        m,
        y,
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )
}

#[cfg(test)]
mod time_tests {
    use super::*;

    #[test]
    fn timestamp_formats_known_instant() {
        // 2023-01-01T00:00:00Z
        assert_eq!(format_timestamp(1_672_531_200, 0), "1/1/2023 00:00:00");
        // Offset pushes across midnight
        assert_eq!(format_timestamp(1_672_531_200, -1), "31/12/2022 23:00:00");
        assert_eq!(format_timestamp(1_672_531_200, 5), "1/1/2023 05:00:00");
    }

    #[test]
    fn leap_day_renders() {
        // 2024-02-29T12:34:56Z
        assert_eq!(format_timestamp(1_709_210_096, 0), "29/2/2024 12:34:56");
    }
}
