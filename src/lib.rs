//! nowmq - Resilient asynchronous MQTT v3.1.1 client and ESP-NOW gateway
//!
//! Connects battery-powered radio nodes to an MQTT broker across periodic
//! WiFi and broker outages: a reconnecting QoS 0/1 client, a gateway with
//! per-peer store-and-forward queues and backpressure signalling, and the
//! node-side link layer the peers speak.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod gateway;
pub mod net;
pub mod node;
pub mod ntp;
pub mod protocol;
pub mod queue;
pub mod radio;

pub use client::{Message, MqttClient};
pub use config::Config;
pub use error::MqttError;
pub use gateway::Gateway;
pub use net::{HostInterface, NetInterface};
pub use node::{AsyncLink, ChannelConfig, Link, PubOutcome};
pub use protocol::QoS;
pub use queue::RingQueue;
pub use radio::{LoopbackHub, Mac, Radio, UdpRadio};
