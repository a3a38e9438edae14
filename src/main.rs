//! nowmq gateway daemon
//!
//! Usage:
//!   nowmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file path
//!   --radio-bind <ADDR>      UDP radio bind address (default: 0.0.0.0:8266)
//!   --channel <N>            Reported WiFi channel (default: 1)
//!   --gwid <MAC>             Gateway id as 12 hex digits
//!   -l, --log-level          Log level (error, warn, info, debug, trace)

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use nowmq::net::HostInterface;
use nowmq::radio::{Mac, UdpRadio};
use nowmq::{Config, Gateway, MqttClient};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// nowmq - ESP-NOW to MQTT gateway
#[derive(Parser, Debug)]
#[command(name = "nowmq")]
#[command(version)]
#[command(about = "Resilient MQTT gateway for micropower radio nodes")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP radio bind address
    #[arg(long, default_value = "0.0.0.0:8266")]
    radio_bind: SocketAddr,

    /// WiFi channel reported to probing nodes
    #[arg(long, default_value_t = 1)]
    channel: u8,

    /// Gateway id as 12 hex digits; derived from the hostname when absent
    #[arg(long)]
    gwid: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

/// A stable locally-administered MAC derived from the hostname
fn derived_gwid() -> Mac {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "nowmq".to_string());
    let mut hasher = DefaultHasher::new();
    host.hash(&mut hasher);
    let h = hasher.finish().to_be_bytes();
    Mac::new([h[0] | 0x02, h[1], h[2], h[3], h[4], h[5]])
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => match Config::from_env() {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading configuration: {}", e);
                std::process::exit(1);
            }
        },
    };

    // CLI overrides config, config overrides the default
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let gwid = match args.gwid.as_deref() {
        Some(s) => Mac::from_hex(s).ok_or("gwid must be 12 hex digits")?,
        None => derived_gwid(),
    };

    info!("Starting nowmq gateway");
    info!("  Broker: {}:{}", file_config.client.server, file_config.client.effective_port());
    info!("  Radio bind: {}", args.radio_bind);
    info!("  Gateway id: {}", gwid);
    info!("  Channel: {}", args.channel);
    info!("  Peer queue depth: {}", file_config.gateway.qlen);
    info!("  Low-power mode: {}", file_config.gateway.lpmode);
    info!("  Fan-out topic: {}", file_config.gateway.pub_all.topic);
    match &file_config.gateway.ntp_host {
        Some(host) => info!("  NTP: {}", host),
        None => info!("  NTP: disabled"),
    }

    let radio = Arc::new(UdpRadio::bind(args.radio_bind, gwid, args.channel).await?);
    let iface = Arc::new(HostInterface);
    let client = MqttClient::new(file_config.client.clone(), iface)?;
    let gateway = Gateway::new(file_config.gateway.clone(), client, radio);

    if let Err(e) = gateway.run().await {
        eprintln!("Connection failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
