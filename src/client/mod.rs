//! Resilient MQTT client
//!
//! Wraps the base session with a reconnection supervisor, a keepalive
//! watchdog and an inbound message pump. User-visible operations suspend
//! across outages instead of failing: `publish` either returns success or
//! raises a caller error (`StringsTooLong`, `BadQos`, `IllegalTopic`);
//! `SocketDown` and its relatives never escape, they drive the supervisor.

mod pid;
mod session;

#[cfg(test)]
mod tests;

pub use session::Session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ConfigError};
use crate::error::MqttError;
use crate::net::NetInterface;
use crate::protocol::QoS;
use crate::queue::RingQueue;

/// Connection generation; stale per-connection tasks notice a newer epoch
/// and exit instead of touching the replacement connection
type Epoch = u32;

/// Delay between message-pump iterations; lets writers take the socket lock
const PUMP_DELAY: Duration = Duration::from_millis(20);

/// Keepalive watchdog tick
const WATCHDOG_TICK: Duration = Duration::from_secs(1);

/// Missed-ping multiple at which the broker is declared failed
const PINGS_DUE_LIMIT: u32 = 4;

/// An inbound publication delivered through the client queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub retained: bool,
}

/// Resilient asynchronous MQTT v3.1.1 client
pub struct MqttClient {
    session: Arc<Session>,
    iface: Arc<dyn NetInterface>,
    queue: Arc<RingQueue<Message>>,
    subs: parking_lot::Mutex<HashMap<String, QoS>>,
    conn_tx: watch::Sender<bool>,
    has_connected: AtomicBool,
    outages: AtomicU32,
    epoch: AtomicU32,
}

impl MqttClient {
    /// Build a client from a validated configuration. Fails on invalid
    /// config or unusable TLS material; no I/O happens here.
    pub fn new(
        cfg: ClientConfig,
        iface: Arc<dyn NetInterface>,
    ) -> Result<Arc<Self>, ConfigError> {
        cfg.validate()?;
        let queue = Arc::new(RingQueue::new(cfg.queue_len));
        let sink_queue = queue.clone();
        let session = Session::new(
            cfg,
            iface.clone(),
            Box::new(move |topic, payload, retained| {
                sink_queue.push(Message {
                    topic,
                    payload,
                    retained,
                });
            }),
        )
        .map_err(|e| ConfigError::Validation(e.to_string()))?;

        let (conn_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            session: Arc::new(session),
            iface,
            queue,
            subs: parking_lot::Mutex::new(HashMap::new()),
            conn_tx,
            has_connected: AtomicBool::new(false),
            outages: AtomicU32::new(0),
            epoch: AtomicU32::new(0),
        }))
    }

    /// Inbound publication queue (bounded; overflow drops the oldest entry
    /// and advances the discard counter)
    pub fn messages(&self) -> &RingQueue<Message> {
        &self.queue
    }

    /// Edge observer for up/down transitions; `true` means connected
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.conn_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.conn_tx.borrow() && self.iface.is_up()
    }

    /// Completed outages since the first connect
    pub fn outages(&self) -> u32 {
        self.outages.load(Ordering::Relaxed)
    }

    /// QoS-1 dup re-sends over the client lifetime
    pub fn repub_count(&self) -> u32 {
        self.session.repub_count()
    }

    /// Inbound messages lost to queue overflow
    pub fn discards(&self) -> u64 {
        self.queue.discards()
    }

    pub fn client_id(&self) -> &str {
        self.session.client_id()
    }

    /// Broker-reachability probe on the live session
    pub async fn broker_up(&self) -> bool {
        self.session.broker_up().await
    }

    /// Internet-reachability probe (DNS to 8.8.8.8)
    pub async fn wan_ok(&self) -> bool {
        self.session.wan_ok().await
    }

    /// First connect. On success the reconnection supervisor owns the
    /// connection for the rest of the client's life.
    pub async fn connect(self: &Arc<Self>) -> Result<(), MqttError> {
        if self.has_connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.iface.connect().await {
            return Err(MqttError::SocketDown);
        }
        let clean = self.session.config().clean_init;
        self.session.connect(clean).await?;
        self.session.set_connected(true);
        self.has_connected.store(true, Ordering::SeqCst);
        self.conn_tx.send_replace(true);
        info!(client_id = %self.session.client_id(), "broker connection established");

        self.spawn_connection_tasks();
        let me = self.clone();
        tokio::spawn(async move { me.keep_connected().await });
        Ok(())
    }

    /// Terminal disconnect: stops the supervisor and sends DISCONNECT so
    /// the broker drops the will cleanly.
    pub async fn disconnect(&self) {
        self.has_connected.store(false, Ordering::SeqCst);
        self.session.disconnect().await;
        self.session.set_connected(false);
        self.conn_tx.send_replace(false);
    }

    /// Suspend until the broker connection is up
    pub async fn await_connection(&self) {
        let mut rx = self.conn_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Publish, suspending across outages. QoS 1 is idempotent from the
    /// caller's view: success means a PUBACK was processed for this message
    /// or a re-sent copy of it.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        retain: bool,
        qos: QoS,
    ) -> Result<(), MqttError> {
        check_topic(topic)?;
        let payload = payload.into();
        loop {
            self.await_connection().await;
            match self
                .session
                .publish(topic, payload.clone(), retain, qos)
                .await
            {
                Ok(()) => return Ok(()),
                Err(MqttError::SocketDown) | Err(MqttError::NoAck) | Err(MqttError::Protocol(_)) => {
                    self.trigger_down();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Subscribe, suspending across outages. The subscription is recorded
    /// and re-issued automatically after every reconnect while the session
    /// is clean.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        check_topic(topic)?;
        loop {
            self.await_connection().await;
            match self.session.subscribe(topic, qos).await {
                Ok(()) => {
                    self.subs.lock().insert(topic.to_string(), qos);
                    return Ok(());
                }
                Err(MqttError::SocketDown) | Err(MqttError::Protocol(_)) => {
                    self.trigger_down();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Unsubscribe, suspending across outages; deletes the stored record
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        check_topic(topic)?;
        loop {
            self.await_connection().await;
            match self.session.unsubscribe(topic).await {
                Ok(()) => {
                    self.subs.lock().remove(topic);
                    return Ok(());
                }
                Err(MqttError::SocketDown) | Err(MqttError::Protocol(_)) => {
                    self.trigger_down();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Mark the connection down exactly once per outage
    fn trigger_down(&self) {
        let transitioned = self.conn_tx.send_if_modified(|up| {
            if *up {
                *up = false;
                true
            } else {
                false
            }
        });
        if transitioned {
            self.session.set_connected(false);
            self.outages.fetch_add(1, Ordering::Relaxed);
            warn!("broker connection lost");
        }
    }

    fn spawn_connection_tasks(self: &Arc<Self>) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let pump = self.clone();
        tokio::spawn(async move { pump.message_pump(epoch).await });
        let watchdog = self.clone();
        tokio::spawn(async move { watchdog.keep_alive(epoch).await });
    }

    fn current(&self, epoch: Epoch) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Drain inbound packets one at a time until the connection fails
    async fn message_pump(self: Arc<Self>, epoch: Epoch) {
        while self.current(epoch) && self.is_connected() {
            if let Err(e) = self.session.wait_msg().await {
                debug!(error = %e, "message pump stopping");
                break;
            }
            tokio::time::sleep(PUMP_DELAY).await;
        }
        if self.current(epoch) {
            self.trigger_down();
        }
    }

    /// Effective ping cadence: keepalive/4, shortened by an explicit
    /// `ping_interval` when one is configured
    fn ping_interval(&self) -> Duration {
        let cfg = self.session.config();
        let derived = if cfg.keepalive > 0 {
            Duration::from_millis(cfg.keepalive as u64 * 1000 / 4)
        } else {
            Duration::from_secs(20)
        };
        if !cfg.ping_interval.is_zero() && cfg.ping_interval < derived {
            cfg.ping_interval
        } else {
            derived
        }
    }

    /// Keepalive watchdog (MQTT-3.1.2.10). Declares broker failure after
    /// four unanswered ping intervals of silence.
    async fn keep_alive(self: Arc<Self>, epoch: Epoch) {
        let interval = self.ping_interval();
        while self.current(epoch) && self.is_connected() {
            let silent = self.session.last_rx().elapsed();
            let pings_due = (silent.as_millis() / interval.as_millis().max(1)) as u32;
            if pings_due >= PINGS_DUE_LIMIT {
                warn!("keepalive watchdog: broker fail");
                break;
            }
            if pings_due >= 1 {
                // Failure is ignored; silence trips the watchdog next tick
                let _ = self.session.ping().await;
            }
            tokio::time::sleep(WATCHDOG_TICK).await;
        }
        if self.current(epoch) {
            self.trigger_down();
        }
    }

    /// Reconnection supervisor: the only task that calls `connect` after
    /// the first success. Runs until `disconnect`.
    async fn keep_connected(self: Arc<Self>) {
        while self.has_connected.load(Ordering::SeqCst) {
            if self.is_connected() {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            self.session.close().await;
            if !self.iface.reconnect().await {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            if !self.has_connected.load(Ordering::SeqCst) {
                debug!("disconnected, exiting supervisor");
                break;
            }
            let clean = self.session.config().clean;
            match self.session.connect(clean).await {
                Ok(()) => {
                    self.session.set_connected(true);
                    self.conn_tx.send_replace(true);
                    info!("reconnect ok");
                    self.spawn_connection_tasks();
                    if clean {
                        self.resubscribe_all().await;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "reconnect attempt failed");
                    self.session.close().await;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        debug!("supervisor exited");
    }

    /// Re-issue every stored subscription after a clean-session reconnect
    async fn resubscribe_all(&self) {
        let subs: Vec<(String, QoS)> = self
            .subs
            .lock()
            .iter()
            .map(|(t, q)| (t.clone(), *q))
            .collect();
        for (topic, qos) in subs {
            if let Err(e) = self.session.subscribe(&topic, qos).await {
                warn!(topic = %topic, error = %e, "resubscribe failed");
                self.trigger_down();
                return;
            }
        }
    }
}

fn check_topic(topic: &str) -> Result<(), MqttError> {
    if topic.is_empty() || topic.contains('\0') {
        return Err(MqttError::IllegalTopic);
    }
    Ok(())
}
