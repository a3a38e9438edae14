//! Base MQTT session
//!
//! Drives the protocol over a single broker connection on the assumption
//! that the connection is good; connectivity failures surface as
//! `MqttError::SocketDown` and are handled by the owning client.
//!
//! Socket discipline: one async mutex owns the stream. Every full packet
//! write holds it; the inbound reader holds it around each `wait_msg` parse,
//! bounded by a short poll window so a quiet socket never starves writers.
//! QoS-1 publishers release it while awaiting the PUBACK.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::pid::PidAllocator;
use crate::codec::{Decoder, Encoder};
use crate::config::ClientConfig;
use crate::error::MqttError;
use crate::net::{build_connector, NetInterface, NetStream, TlsError};
use crate::protocol::{
    Connect, Packet, PubAck, Publish, QoS, Subscribe, Unsubscribe, Will,
};

/// Poll window for the inbound reader's first byte; keeps the socket lock
/// from being held while the broker is quiet
const POLL_WINDOW: Duration = Duration::from_millis(20);

/// Re-check cadence while awaiting an ACK
const ACK_POLL: Duration = Duration::from_millis(100);

/// DNS A-query for www.google.com, used by the WAN probe
const DNS_QUERY: &[u8] = b"$\x1a\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00\x03www\x06google\x03com\x00\x00\x01\x00\x01";

/// Messages delivered by `wait_msg`: topic, payload, retained
pub type InboundSink = Box<dyn Fn(String, Bytes, bool) + Send + Sync>;

struct SessionStream {
    io: NetStream,
    buf: BytesMut,
    decoder: Decoder,
}

/// One broker connection speaking MQTT v3.1.1
pub struct Session {
    cfg: ClientConfig,
    client_id: String,
    will: Option<Will>,
    tls: Option<TlsConnector>,
    iface: Arc<dyn NetInterface>,
    sink: InboundSink,

    sock: tokio::sync::Mutex<Option<SessionStream>>,
    addr: parking_lot::Mutex<Option<SocketAddr>>,
    pids: PidAllocator,
    last_rx: parking_lot::Mutex<Instant>,
    acked: Notify,

    connected: AtomicBool,
    in_connect: AtomicBool,
    repub_count: AtomicU32,
}

impl Session {
    pub fn new(
        cfg: ClientConfig,
        iface: Arc<dyn NetInterface>,
        sink: InboundSink,
    ) -> Result<Self, TlsError> {
        let tls = if cfg.ssl {
            Some(build_connector(&cfg.ssl_params)?)
        } else {
            None
        };
        let client_id = cfg.effective_client_id();
        let will = match cfg.will {
            Some(ref w) => Some(Will {
                topic: w.topic.clone(),
                payload: Bytes::from(w.payload.clone().into_bytes()),
                qos: QoS::from_u8(w.qos).unwrap_or(QoS::AtMostOnce),
                retain: w.retain,
            }),
            None => None,
        };
        Ok(Self {
            cfg,
            client_id,
            will,
            tls,
            iface,
            sink,
            sock: tokio::sync::Mutex::new(None),
            addr: parking_lot::Mutex::new(None),
            pids: PidAllocator::new(),
            last_rx: parking_lot::Mutex::new(Instant::now()),
            acked: Notify::new(),
            connected: AtomicBool::new(false),
            in_connect: AtomicBool::new(false),
            repub_count: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.cfg
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Dup re-sends performed over the session lifetime
    pub fn repub_count(&self) -> u32 {
        self.repub_count.load(Ordering::Relaxed)
    }

    /// Time of the last byte received from the broker
    pub fn last_rx(&self) -> Instant {
        *self.last_rx.lock()
    }

    fn touch_rx(&self) {
        *self.last_rx.lock() = Instant::now();
    }

    pub(crate) fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::SeqCst);
    }

    /// Connection state as seen by the socket helpers. During `connect` the
    /// low-level check is disabled so the handshake itself can proceed.
    pub fn is_connected(&self) -> bool {
        if self.in_connect.load(Ordering::SeqCst) {
            return true;
        }
        self.connected.load(Ordering::SeqCst) && self.iface.is_up()
    }

    fn response_time(&self) -> Duration {
        self.cfg.response_time
    }

    fn encode(&self, packet: &Packet) -> Result<BytesMut, MqttError> {
        let mut buf = BytesMut::new();
        Encoder::new().encode(packet, &mut buf)?;
        Ok(buf)
    }

    /// Write one full packet while holding the socket lock
    async fn write_packet(&self, packet: &Packet) -> Result<(), MqttError> {
        let buf = self.encode(packet)?;
        let mut guard = self.sock.lock().await;
        let stream = guard.as_mut().ok_or(MqttError::SocketDown)?;
        self.write_all_bounded(&mut stream.io, &buf).await
    }

    async fn write_all_bounded(
        &self,
        io: &mut NetStream,
        buf: &[u8],
    ) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::SocketDown);
        }
        match timeout(self.response_time(), io.write_all(buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(MqttError::SocketDown),
        }
    }

    /// Open the socket, send CONNECT and validate the 4-byte CONNACK
    pub async fn connect(&self, clean: bool) -> Result<(), MqttError> {
        self.in_connect.store(true, Ordering::SeqCst);
        let result = self.connect_inner(clean).await;
        self.in_connect.store(false, Ordering::SeqCst);
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn connect_inner(&self, clean: bool) -> Result<(), MqttError> {
        // Resolve once; a later DNS outage must not block reconnects
        let addr = {
            let cached = *self.addr.lock();
            match cached {
                Some(a) => a,
                None => {
                    let port = self.cfg.effective_port();
                    let mut addrs =
                        tokio::net::lookup_host((self.cfg.server.as_str(), port)).await?;
                    let a = addrs.next().ok_or(MqttError::SocketDown)?;
                    *self.addr.lock() = Some(a);
                    a
                }
            }
        };

        let tls = self.tls.as_ref().map(|c| {
            let name = self
                .cfg
                .ssl_params
                .server_name
                .as_deref()
                .unwrap_or(&self.cfg.server);
            (c, name)
        });
        debug!(server = %addr, "connecting to broker");
        let mut io = match timeout(
            self.response_time(),
            NetStream::open(&addr.ip().to_string(), addr.port(), tls),
        )
        .await
        {
            Ok(Ok(io)) => io,
            Ok(Err(_)) | Err(_) => return Err(MqttError::SocketDown),
        };

        let connect = Packet::Connect(Box::new(Connect {
            client_id: self.client_id.clone(),
            clean_session: clean,
            keep_alive: self.cfg.keepalive as u16,
            username: self.cfg.user.clone(),
            password: self
                .cfg
                .password
                .as_ref()
                .map(|p| Bytes::from(p.clone().into_bytes())),
            will: self.will.clone(),
        }));
        let buf = self.encode(&connect)?;
        self.write_all_bounded(&mut io, &buf).await?;

        // Read exactly the 4-byte CONNACK
        let mut resp = [0u8; 4];
        match timeout(self.response_time(), io.read_exact(&mut resp)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => return Err(MqttError::SocketDown),
        }
        self.touch_rx();
        if resp[0] != 0x20 || resp[1] != 0x02 || resp[3] != 0 {
            return Err(MqttError::BadConnack);
        }
        debug!("connected to broker");

        self.pids.clear();
        *self.sock.lock().await = Some(SessionStream {
            io,
            buf: BytesMut::with_capacity(4096),
            decoder: Decoder::new(),
        });
        Ok(())
    }

    /// Drop the socket; any blocked reader or writer fails over shortly
    pub async fn close(&self) {
        *self.sock.lock().await = None;
    }

    /// Send PINGREQ
    pub async fn ping(&self) -> Result<(), MqttError> {
        self.write_packet(&Packet::PingReq).await
    }

    /// Best-effort DISCONNECT, then close
    pub async fn disconnect(&self) {
        let _ = self.write_packet(&Packet::Disconnect).await;
        self.close().await;
    }

    /// Broker-reachability probe. True when traffic is fresh, otherwise
    /// pings and watches `last_rx` advance within the response time.
    pub async fn broker_up(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let tlast = self.last_rx();
        if tlast.elapsed() < Duration::from_secs(1) {
            return true;
        }
        if self.ping().await.is_err() {
            return false;
        }
        let deadline = Instant::now() + self.response_time();
        while Instant::now() < deadline {
            tokio::time::sleep(ACK_POLL).await;
            if self.last_rx() > tlast {
                return true;
            }
        }
        false
    }

    /// Internet-reachability probe: DNS query to 8.8.8.8
    pub async fn wan_ok(&self) -> bool {
        if !self.iface.is_up() {
            return false;
        }
        let sock = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(_) => return false,
        };
        if sock.connect("8.8.8.8:53").await.is_err() {
            return false;
        }
        if sock.send(DNS_QUERY).await.is_err() {
            return false;
        }
        let mut buf = [0u8; 32];
        matches!(
            timeout(self.response_time(), sock.recv(&mut buf)).await,
            Ok(Ok(n)) if n == buf.len()
        )
    }

    /// Wait until `pid` is acknowledged; false on timeout or connection loss
    async fn await_pid(&self, pid: u16) -> bool {
        let deadline = Instant::now() + self.response_time();
        loop {
            if !self.pids.is_outstanding(pid) {
                return true;
            }
            if Instant::now() >= deadline || !self.is_connected() {
                return false;
            }
            let _ = timeout(ACK_POLL, self.acked.notified()).await;
        }
    }

    /// Publish. QoS 0 returns after the write; QoS 1 awaits the PUBACK,
    /// re-sending with dup=1 and the same PID up to `max_repubs` times.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        retain: bool,
        qos: QoS,
    ) -> Result<(), MqttError> {
        if qos == QoS::AtMostOnce {
            let packet = Packet::Publish(Publish {
                dup: false,
                qos,
                retain,
                topic: topic.to_string(),
                packet_id: None,
                payload,
            });
            return self.write_packet(&packet).await;
        }

        let pid = self.pids.allocate();
        let mut packet = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id: Some(pid),
            payload,
        };
        if let Err(e) = self.write_packet(&Packet::Publish(packet.clone())).await {
            self.pids.release(pid);
            return Err(e);
        }

        let mut count = 0u32;
        loop {
            if self.await_pid(pid).await {
                return Ok(());
            }
            if count >= self.cfg.max_repubs || !self.is_connected() {
                self.pids.release(pid);
                return Err(MqttError::NoAck);
            }
            packet.dup = true;
            if let Err(e) = self.write_packet(&Packet::Publish(packet.clone())).await {
                self.pids.release(pid);
                return Err(e);
            }
            count += 1;
            self.repub_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Subscribe and await the SUBACK
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        let pid = self.pids.allocate();
        let packet = Packet::Subscribe(Subscribe {
            packet_id: pid,
            topic: topic.to_string(),
            qos,
        });
        if let Err(e) = self.write_packet(&packet).await {
            self.pids.release(pid);
            return Err(e);
        }
        if self.await_pid(pid).await {
            Ok(())
        } else {
            self.pids.release(pid);
            Err(MqttError::SocketDown)
        }
    }

    /// Unsubscribe and await the UNSUBACK
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        let pid = self.pids.allocate();
        let packet = Packet::Unsubscribe(Unsubscribe {
            packet_id: pid,
            topic: topic.to_string(),
        });
        if let Err(e) = self.write_packet(&packet).await {
            self.pids.release(pid);
            return Err(e);
        }
        if self.await_pid(pid).await {
            Ok(())
        } else {
            self.pids.release(pid);
            Err(MqttError::SocketDown)
        }
    }

    /// Parse and process at most one inbound packet.
    ///
    /// Holds the socket lock for the duration of the parse. Returns quickly
    /// when the broker is quiet; a partial packet must complete within the
    /// response time.
    pub async fn wait_msg(&self) -> Result<(), MqttError> {
        let mut guard = self.sock.lock().await;
        let stream = guard.as_mut().ok_or(MqttError::SocketDown)?;

        // A complete packet may already be buffered
        if let Some((packet, consumed)) = stream.decoder.decode(&stream.buf)? {
            let _ = stream.buf.split_to(consumed);
            return self.handle_packet(stream, packet).await;
        }

        // First read is bounded by the poll window so the lock is released
        // promptly when nothing is arriving
        match timeout(POLL_WINDOW, stream.io.read_buf(&mut stream.buf)).await {
            Err(_) => return Ok(()),
            Ok(Ok(0)) => return Err(MqttError::SocketDown),
            Ok(Ok(_)) => self.touch_rx(),
            Ok(Err(_)) => return Err(MqttError::SocketDown),
        }

        // Data started arriving: finish the packet within the response time
        let deadline = Instant::now() + self.response_time();
        loop {
            if let Some((packet, consumed)) = stream.decoder.decode(&stream.buf)? {
                let _ = stream.buf.split_to(consumed);
                return self.handle_packet(stream, packet).await;
            }
            if Instant::now() >= deadline || !self.is_connected() {
                return Err(MqttError::SocketDown);
            }
            match timeout(POLL_WINDOW, stream.io.read_buf(&mut stream.buf)).await {
                Err(_) => continue,
                Ok(Ok(0)) => return Err(MqttError::SocketDown),
                Ok(Ok(_)) => self.touch_rx(),
                Ok(Err(_)) => return Err(MqttError::SocketDown),
            }
        }
    }

    async fn handle_packet(
        &self,
        stream: &mut SessionStream,
        packet: Packet,
    ) -> Result<(), MqttError> {
        match packet {
            Packet::PingResp => {}
            Packet::PubAck(ack) => {
                self.pids.acknowledge(ack.packet_id)?;
                self.acked.notify_waiters();
            }
            Packet::SubAck(ack) => {
                if ack.is_failure() {
                    warn!(pid = ack.packet_id, "broker refused subscription");
                    return Err(MqttError::Protocol(
                        crate::protocol::DecodeError::MalformedPacket("suback failure"),
                    ));
                }
                self.pids.acknowledge(ack.packet_id)?;
                self.acked.notify_waiters();
            }
            Packet::UnsubAck(ack) => {
                self.pids.acknowledge(ack.packet_id)?;
                self.acked.notify_waiters();
            }
            Packet::Publish(publish) => {
                let pid = publish.packet_id;
                let qos = publish.qos;
                (self.sink)(publish.topic, publish.payload, publish.retain);
                if qos == QoS::AtLeastOnce {
                    if let Some(pid) = pid {
                        let buf = self.encode(&Packet::PubAck(PubAck::new(pid)))?;
                        self.write_all_bounded(&mut stream.io, &buf).await?;
                    }
                }
            }
            // Broker-originated CONNECT/SUBSCRIBE traffic is nonsense here;
            // drop it rather than kill the connection
            other => {
                debug!(packet_type = other.packet_type(), "ignoring packet");
            }
        }
        Ok(())
    }
}
