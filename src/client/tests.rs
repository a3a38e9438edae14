//! Client unit tests
//!
//! Connection-level behaviour is exercised end-to-end against a scripted
//! broker in the integration suite; these cover construction, validation
//! and the caller-error paths that never touch the network.

use std::sync::Arc;

use super::*;
use crate::config::ClientConfig;
use crate::error::qos_check;
use crate::net::HostInterface;

fn config() -> ClientConfig {
    ClientConfig {
        server: "127.0.0.1".to_string(),
        ..Default::default()
    }
}

fn client() -> Arc<MqttClient> {
    MqttClient::new(config(), Arc::new(HostInterface)).unwrap()
}

#[test]
fn empty_server_is_refused() {
    let cfg = ClientConfig::default();
    assert!(MqttClient::new(cfg, Arc::new(HostInterface)).is_err());
}

#[test]
fn oversized_keepalive_is_refused() {
    let cfg = ClientConfig {
        keepalive: 65536,
        ..config()
    };
    assert!(MqttClient::new(cfg, Arc::new(HostInterface)).is_err());
}

#[test]
fn empty_will_topic_is_refused() {
    let cfg = ClientConfig {
        will: Some(crate::config::WillConfig {
            topic: String::new(),
            payload: "gone".to_string(),
            retain: false,
            qos: 0,
        }),
        ..config()
    };
    assert!(MqttClient::new(cfg, Arc::new(HostInterface)).is_err());
}

#[test]
fn qos_values_outside_zero_one_are_refused() {
    assert!(qos_check(0).is_ok());
    assert!(qos_check(1).is_ok());
    assert!(qos_check(2).is_err());
    assert!(qos_check(255).is_err());
}

#[tokio::test]
async fn illegal_topic_fails_before_suspending() {
    let client = client();
    // Not connected; an illegal topic must fail fast instead of waiting
    // for connectivity
    assert_eq!(
        client.publish("", "x", false, QoS::AtMostOnce).await,
        Err(MqttError::IllegalTopic)
    );
    assert_eq!(
        client.publish("a\0b", "x", false, QoS::AtMostOnce).await,
        Err(MqttError::IllegalTopic)
    );
    assert_eq!(
        client.subscribe("a\0b", QoS::AtMostOnce).await,
        Err(MqttError::IllegalTopic)
    );
}

#[test]
fn fresh_client_reports_down_and_zero_counters() {
    let client = client();
    assert!(!client.is_connected());
    assert_eq!(client.outages(), 0);
    assert_eq!(client.repub_count(), 0);
    assert_eq!(client.discards(), 0);
}

#[tokio::test]
async fn connect_to_dead_port_fails() {
    // Bind a listener to learn a free port, then close it
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let cfg = ClientConfig {
        port,
        response_time: std::time::Duration::from_millis(300),
        ..config()
    };
    let client = MqttClient::new(cfg, Arc::new(HostInterface)).unwrap();
    assert_eq!(client.connect().await, Err(MqttError::SocketDown));
    assert!(!client.is_connected());
}

#[test]
fn inbound_queue_drops_oldest_and_counts() {
    let cfg = ClientConfig {
        queue_len: 2,
        ..config()
    };
    let client = MqttClient::new(cfg, Arc::new(HostInterface)).unwrap();
    for i in 0..3 {
        client.messages().push(Message {
            topic: format!("t{}", i),
            payload: bytes::Bytes::new(),
            retained: false,
        });
    }
    assert_eq!(client.discards(), 1);
    assert_eq!(client.messages().try_pop().unwrap().topic, "t1");
    assert_eq!(client.messages().try_pop().unwrap().topic, "t2");
}
