//! Scripted broker fixture
//!
//! A minimal MQTT v3.1.1 broker side for driving the client: accepts
//! connections in sequence, acks what it is told to ack, records every
//! packet it decodes, and lets a test inject publications or cut the
//! connection to stage an outage.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

use nowmq::codec::{Decoder, Encoder};
use nowmq::protocol::{ConnAck, Packet, PubAck, Publish, QoS, SubAck, UnsubAck};

pub struct ScriptedBroker {
    pub addr: SocketAddr,
    /// Every packet decoded, across all connections in order
    pub received: Arc<Mutex<Vec<Packet>>>,
    /// Completed CONNECT handshakes
    pub connects: Arc<AtomicUsize>,
    /// Swallow this many QoS-1 PUBACKs before resuming normal acking
    pub drop_pubacks: Arc<AtomicUsize>,
    /// When false, new connections are refused
    accepting: Arc<AtomicBool>,
    inject_tx: mpsc::UnboundedSender<Publish>,
    kill: Arc<Notify>,
}

impl ScriptedBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let connects = Arc::new(AtomicUsize::new(0));
        let drop_pubacks = Arc::new(AtomicUsize::new(0));
        let accepting = Arc::new(AtomicBool::new(true));
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let inject_rx = Arc::new(tokio::sync::Mutex::new(inject_rx));
        let kill = Arc::new(Notify::new());

        let broker = Self {
            addr,
            received: received.clone(),
            connects: connects.clone(),
            drop_pubacks: drop_pubacks.clone(),
            accepting: accepting.clone(),
            inject_tx,
            kill: kill.clone(),
        };

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                if !accepting.load(Ordering::SeqCst) {
                    continue;
                }
                serve(
                    stream,
                    received.clone(),
                    connects.clone(),
                    drop_pubacks.clone(),
                    inject_rx.clone(),
                    kill.clone(),
                )
                .await;
            }
        });
        broker
    }

    /// Deliver a publication to the connected client
    pub fn inject(&self, topic: &str, payload: &[u8], retained: bool, qos: QoS) {
        let publish = Publish {
            dup: false,
            qos,
            retain: retained,
            topic: topic.to_string(),
            packet_id: (qos == QoS::AtLeastOnce).then_some(0x0101),
            payload: bytes::Bytes::copy_from_slice(payload),
        };
        self.inject_tx.send(publish).unwrap();
    }

    /// Cut the current connection
    pub fn kill_connection(&self) {
        self.kill.notify_waiters();
    }

    /// Refuse (or allow again) new connections
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Snapshot of the recorded packets
    pub fn packets(&self) -> Vec<Packet> {
        self.received.lock().clone()
    }
}

async fn serve(
    mut stream: TcpStream,
    received: Arc<Mutex<Vec<Packet>>>,
    connects: Arc<AtomicUsize>,
    drop_pubacks: Arc<AtomicUsize>,
    inject_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Publish>>>,
    kill: Arc<Notify>,
) {
    let mut decoder = Decoder::new();
    let encoder = Encoder::new();
    let mut buf = BytesMut::with_capacity(4096);
    let mut out = BytesMut::new();
    let mut inject_rx = inject_rx.lock().await;

    loop {
        tokio::select! {
            read = stream.read_buf(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                while let Ok(Some((packet, consumed))) = decoder.decode(&buf) {
                    let _ = buf.split_to(consumed);
                    received.lock().push(packet.clone());
                    out.clear();
                    match packet {
                        Packet::Connect(_) => {
                            connects.fetch_add(1, Ordering::SeqCst);
                            encoder
                                .encode(&Packet::ConnAck(ConnAck::default()), &mut out)
                                .unwrap();
                        }
                        Packet::Publish(p) => {
                            if p.qos == QoS::AtLeastOnce {
                                let dropping = drop_pubacks
                                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                                        n.checked_sub(1)
                                    })
                                    .is_ok();
                                if !dropping {
                                    let pid = p.packet_id.unwrap();
                                    encoder
                                        .encode(&Packet::PubAck(PubAck::new(pid)), &mut out)
                                        .unwrap();
                                }
                            }
                        }
                        Packet::Subscribe(s) => {
                            encoder
                                .encode(
                                    &Packet::SubAck(SubAck {
                                        packet_id: s.packet_id,
                                        return_code: s.qos as u8,
                                    }),
                                    &mut out,
                                )
                                .unwrap();
                        }
                        Packet::Unsubscribe(u) => {
                            encoder
                                .encode(
                                    &Packet::UnsubAck(UnsubAck {
                                        packet_id: u.packet_id,
                                    }),
                                    &mut out,
                                )
                                .unwrap();
                        }
                        Packet::PingReq => {
                            encoder.encode(&Packet::PingResp, &mut out).unwrap();
                        }
                        Packet::Disconnect => return,
                        _ => {}
                    }
                    if !out.is_empty() && stream.write_all(&out).await.is_err() {
                        return;
                    }
                }
            }
            Some(publish) = inject_rx.recv() => {
                out.clear();
                encoder.encode(&Packet::Publish(publish), &mut out).unwrap();
                if stream.write_all(&out).await.is_err() {
                    return;
                }
            }
            _ = kill.notified() => {
                return;
            }
        }
    }
}

/// Count packets matching a predicate
pub fn count_packets(packets: &[Packet], pred: impl Fn(&Packet) -> bool) -> usize {
    packets.iter().filter(|p| pred(p)).count()
}
