//! End-to-end scenarios against a scripted broker
//!
//! Covers the client's publish/reconnect behaviour on a real socket and the
//! gateway wired between the broker and loopback radio peers.

mod support;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time::timeout;

use nowmq::config::{ClientConfig, GatewayConfig};
use nowmq::gateway::frame::{render_publish, render_subscribe, ReplyTag};
use nowmq::net::HostInterface;
use nowmq::protocol::Packet;
use nowmq::radio::{LoopbackHub, LoopbackRadio, Mac, Radio};
use nowmq::{Gateway, MqttClient, QoS};

use support::{count_packets, ScriptedBroker};

const GW: Mac = Mac::new([0xAA; 6]);
const NODE_A: Mac = Mac::new([0x01; 6]);
const NODE_B: Mac = Mac::new([0x02; 6]);

fn client_for(broker: &ScriptedBroker) -> Arc<MqttClient> {
    let cfg = ClientConfig {
        server: "127.0.0.1".to_string(),
        port: broker.addr.port(),
        response_time: Duration::from_millis(300),
        queue_len: 32,
        client_id: Some("it-client".to_string()),
        ..Default::default()
    };
    MqttClient::new(cfg, Arc::new(HostInterface)).unwrap()
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn recv_frame(radio: &LoopbackRadio) -> Vec<u8> {
    timeout(Duration::from_secs(5), radio.recv())
        .await
        .expect("frame expected")
        .expect("radio open")
        .1
}

// ---------------------------------------------------------------------------
// Scenario: clean publish
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_publish_round_trip() {
    let broker = ScriptedBroker::start().await;
    let client = client_for(&broker);
    client.connect().await.unwrap();
    client
        .publish("shed", "hi", false, QoS::AtLeastOnce)
        .await
        .unwrap();

    let packets = broker.packets();
    let connects: Vec<_> = packets
        .iter()
        .filter_map(|p| match p {
            Packet::Connect(c) => Some(c),
            _ => None,
        })
        .collect();
    assert_eq!(connects.len(), 1);
    assert!(connects[0].clean_session);
    assert_eq!(connects[0].client_id, "it-client");

    let publishes: Vec<_> = packets
        .iter()
        .filter_map(|p| match p {
            Packet::Publish(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(publishes.len(), 1);
    assert_eq!(publishes[0].topic, "shed");
    assert_eq!(&publishes[0].payload[..], b"hi");
    assert_eq!(publishes[0].qos, QoS::AtLeastOnce);
    assert!(!publishes[0].dup);
    assert!(publishes[0].packet_id.unwrap() > 0);
    assert_eq!(client.repub_count(), 0);
}

// ---------------------------------------------------------------------------
// Scenario: PUBACK lost, client re-sends with dup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lost_puback_triggers_dup_resend() {
    let broker = ScriptedBroker::start().await;
    broker.drop_pubacks.store(1, std::sync::atomic::Ordering::SeqCst);

    let client = client_for(&broker);
    client.connect().await.unwrap();
    client
        .publish("shed", "hi", false, QoS::AtLeastOnce)
        .await
        .unwrap();

    assert_eq!(client.repub_count(), 1);
    let packets = broker.packets();
    let publishes: Vec<_> = packets
        .iter()
        .filter_map(|p| match p {
            Packet::Publish(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(publishes.len(), 2);
    assert!(!publishes[0].dup);
    assert!(publishes[1].dup);
    // Re-send reuses the PID; exactly one PUBACK reached the client
    assert_eq!(publishes[0].packet_id, publishes[1].packet_id);
}

// ---------------------------------------------------------------------------
// Scenario: outage across publish; subscriptions restored
// ---------------------------------------------------------------------------

#[tokio::test]
async fn outage_reconnect_restores_subscriptions() {
    let broker = ScriptedBroker::start().await;
    let client = client_for(&broker);
    client.connect().await.unwrap();
    client.subscribe("shed", QoS::AtLeastOnce).await.unwrap();

    broker.kill_connection();
    wait_for(|| !client.is_connected()).await;

    // Publish during the outage: suspends, then succeeds after reconnect
    client
        .publish("shed", "after", false, QoS::AtLeastOnce)
        .await
        .unwrap();

    assert_eq!(client.outages(), 1);
    assert_eq!(broker.connects.load(std::sync::atomic::Ordering::SeqCst), 2);
    let packets = broker.packets();
    assert_eq!(
        count_packets(&packets, |p| matches!(p, Packet::Connect(_))),
        2
    );
    // Initial subscribe plus the automatic re-issue
    assert!(
        count_packets(
            &packets,
            |p| matches!(p, Packet::Subscribe(s) if s.topic == "shed")
        ) >= 2
    );
}

// ---------------------------------------------------------------------------
// Scenario: gateway fan-out to two subscribed peers
// ---------------------------------------------------------------------------

struct GatewayRig {
    broker: ScriptedBroker,
    gateway: Arc<Gateway>,
    client: Arc<MqttClient>,
    hub: Arc<LoopbackHub>,
}

async fn start_gateway(cfg: GatewayConfig) -> GatewayRig {
    let broker = ScriptedBroker::start().await;
    let client = client_for(&broker);
    let hub = LoopbackHub::new();
    let gw_radio = Arc::new(hub.endpoint(GW, 3));
    let gateway = Gateway::new(cfg, client.clone(), gw_radio);
    let runner = gateway.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    wait_for(|| client.is_connected()).await;
    GatewayRig {
        broker,
        gateway,
        client,
        hub,
    }
}

#[tokio::test]
async fn gateway_fans_out_to_every_subscriber_exactly_once() {
    let rig = start_gateway(GatewayConfig::default()).await;
    let node_a = rig.hub.endpoint(NODE_A, 3);
    let node_b = rig.hub.endpoint(NODE_B, 3);
    node_a.add_peer(GW).unwrap();
    node_b.add_peer(GW).unwrap();

    let sub = render_subscribe("weather", QoS::AtLeastOnce);
    node_a.send(GW, &sub).await.unwrap();
    node_b.send(GW, &sub).await.unwrap();

    // The broker-side subscription appears once the first peer asks
    wait_for(|| {
        count_packets(
            &rig.broker.packets(),
            |p| matches!(p, Packet::Subscribe(s) if s.topic == "weather"),
        ) >= 1
    })
    .await;

    rig.broker.inject("weather", b"sunny", false, QoS::AtMostOnce);

    let expect = br#"["weather","sunny",false]"#.to_vec();
    assert_eq!(recv_frame(&node_a).await, expect);
    assert_eq!(recv_frame(&node_b).await, expect);
    assert!(timeout(Duration::from_millis(300), node_a.recv())
        .await
        .is_err());
    assert!(timeout(Duration::from_millis(300), node_b.recv())
        .await
        .is_err());
}

// ---------------------------------------------------------------------------
// Scenario: backpressure while the broker is down
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gateway_signals_backpressure_during_outage() {
    let rig = start_gateway(GatewayConfig::default()).await;
    let node = rig.hub.endpoint(NODE_A, 3);
    node.add_peer(GW).unwrap();

    rig.broker.set_accepting(false);
    rig.broker.kill_connection();
    wait_for(|| !rig.client.is_connected()).await;
    // Let the publisher settle behind its connection gate
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut tags = Vec::new();
    for i in 0..11 {
        let frame = render_publish("shed", &format!("m{}", i), false, QoS::AtLeastOnce);
        node.send(GW, &frame).await.unwrap();
        tags.push(ReplyTag::from_frame(&recv_frame(&node).await).unwrap());
    }

    assert_eq!(&tags[..5], &[ReplyTag::Ack; 5]);
    assert_eq!(&tags[5..10], &[ReplyTag::Nak; 5]);
    assert_eq!(tags[10], ReplyTag::Bad);
    assert_eq!(rig.gateway.pubq_len(), 10);
}

// ---------------------------------------------------------------------------
// Scenario: sleepy peer polls its queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sleepy_peer_receives_queued_messages_in_order() {
    let rig = start_gateway(GatewayConfig::default()).await;
    let node = rig.hub.endpoint(NODE_A, 3);
    node.add_peer(GW).unwrap();

    // First contact onboards the peer onto the default fan-out topic
    let frame = render_publish("shed", "hello", false, QoS::AtLeastOnce);
    node.send(GW, &frame).await.unwrap();
    assert_eq!(
        ReplyTag::from_frame(&recv_frame(&node).await),
        Some(ReplyTag::Ack)
    );

    // Peer goes to sleep; two fan-out messages arrive meanwhile
    node.set_reachable(false);
    rig.broker.inject("allnodes", b"m1", false, QoS::AtMostOnce);
    wait_for(|| rig.gateway.peer_queue_len(NODE_A) == Some(1)).await;
    rig.broker.inject("allnodes", b"m2", false, QoS::AtMostOnce);
    wait_for(|| rig.gateway.peer_queue_len(NODE_A) == Some(2)).await;

    // Awake again: one poll drains the queue in FIFO order
    node.set_reachable(true);
    node.send(GW, br#"["get"]"#).await.unwrap();
    assert_eq!(recv_frame(&node).await, br#"["allnodes","m1",false]"#);
    assert_eq!(recv_frame(&node).await, br#"["allnodes","m2",false]"#);
    wait_for(|| rig.gateway.peer_queue_len(NODE_A) == Some(0)).await;
}

// ---------------------------------------------------------------------------
// Scenario: peer publish reaches the broker through the gateway
// ---------------------------------------------------------------------------

#[tokio::test]
async fn peer_publish_flows_through_to_the_broker() {
    use rand::Rng;

    let rig = start_gateway(GatewayConfig::default()).await;
    let node = rig.hub.endpoint(NODE_A, 3);
    node.add_peer(GW).unwrap();

    // Payload content is opaque to the relay path
    let reading: f64 = rand::thread_rng().gen_range(-40.0..85.0);
    let payload = format!("{:.1}", reading);
    let frame = render_publish("sensors/shed", &payload, true, QoS::AtLeastOnce);
    node.send(GW, &frame).await.unwrap();
    assert_eq!(
        ReplyTag::from_frame(&recv_frame(&node).await),
        Some(ReplyTag::Ack)
    );

    wait_for(|| {
        rig.broker.packets().iter().any(|p| {
            matches!(p, Packet::Publish(p)
                if p.topic == "sensors/shed" && p.payload == payload.as_bytes() && p.retain)
        })
    })
    .await;
}
