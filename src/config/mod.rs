//! Configuration Module
//!
//! TOML-based configuration for the MQTT client, the gateway and the node
//! link, with environment variable overrides (NOWMQ__* prefix) and
//! `${VAR}`/`${VAR:-default}` substitution inside the file.

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::protocol::QoS;

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// MQTT client configuration
    pub client: ClientConfig,
    /// Gateway configuration
    pub gateway: GatewayConfig,
    /// Node link configuration
    pub node: NodeConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Last-will registration
#[derive(Debug, Clone, Deserialize)]
pub struct WillConfig {
    /// Will topic; must be non-empty
    pub topic: String,
    /// Will payload
    #[serde(default)]
    pub payload: String,
    /// Will retain flag
    #[serde(default)]
    pub retain: bool,
    /// Will QoS (0 or 1)
    #[serde(default)]
    pub qos: u8,
}

/// TLS handshake options
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsParams {
    /// Path to a PEM file of additional root certificates
    pub ca_file: Option<String>,
    /// Server name for SNI / certificate verification; defaults to `server`
    pub server_name: Option<String>,
    /// Skip certificate verification (testing only)
    pub insecure: bool,
}

/// MQTT client configuration
///
/// `clean_init` applies to the first connect of the process, `clean` to
/// every reconnect. `clean_init = false, clean = true` is accepted, but any
/// QoS-1 publications retained by the broker for the unclean first session
/// are discarded when the first reconnect opens a clean one.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker host
    pub server: String,
    /// Broker port; 0 selects 1883, or 8883 when `ssl` is set
    pub port: u16,
    /// Enable TLS
    pub ssl: bool,
    /// TLS handshake options
    pub ssl_params: TlsParams,
    /// CONNECT username
    pub user: Option<String>,
    /// CONNECT password
    pub password: Option<String>,
    /// MQTT keepalive in seconds; must fit the CONNECT 16-bit field
    #[serde(default = "default_keepalive")]
    pub keepalive: u32,
    /// Override for the internal ping cadence; zero means keepalive/4
    #[serde(default, with = "humantime_serde")]
    pub ping_interval: Duration,
    /// PUBACK/SUBACK wait before re-send or failure
    #[serde(default = "default_response_time", with = "humantime_serde")]
    pub response_time: Duration,
    /// Clean-session flag on the first connect
    #[serde(default = "default_true")]
    pub clean_init: bool,
    /// Clean-session flag on reconnects
    #[serde(default = "default_true")]
    pub clean: bool,
    /// QoS-1 re-publish attempts before NoAck
    #[serde(default = "default_max_repubs")]
    pub max_repubs: u32,
    /// Last-will registration
    pub will: Option<WillConfig>,
    /// MQTT client identifier; defaults to the host unique id
    pub client_id: Option<String>,
    /// Inbound message queue capacity
    #[serde(default = "default_queue_len")]
    pub queue_len: usize,
}

fn default_keepalive() -> u32 {
    60
}
fn default_response_time() -> Duration {
    Duration::from_secs(10)
}
fn default_true() -> bool {
    true
}
fn default_max_repubs() -> u32 {
    4
}
fn default_queue_len() -> usize {
    10
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 0,
            ssl: false,
            ssl_params: TlsParams::default(),
            user: None,
            password: None,
            keepalive: default_keepalive(),
            ping_interval: Duration::ZERO,
            response_time: default_response_time(),
            clean_init: true,
            clean: true,
            max_repubs: default_max_repubs(),
            will: None,
            client_id: None,
            queue_len: default_queue_len(),
        }
    }
}

impl ClientConfig {
    /// Broker port after applying the TLS-sensitive default
    pub fn effective_port(&self) -> u16 {
        if self.port != 0 {
            self.port
        } else if self.ssl {
            8883
        } else {
            1883
        }
    }

    /// Client identifier, derived from the host name when unset
    pub fn effective_client_id(&self) -> String {
        if let Some(ref id) = self.client_id {
            return id.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "nowmq".to_string())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.is_empty() {
            return Err(ConfigError::Validation("no server specified".into()));
        }
        if self.keepalive >= 65536 {
            return Err(ConfigError::Validation(
                "keepalive must be below 65536 seconds".into(),
            ));
        }
        if self.queue_len == 0 {
            return Err(ConfigError::Validation(
                "queue_len must be non-zero".into(),
            ));
        }
        if let Some(ref will) = self.will {
            if will.topic.is_empty() {
                return Err(ConfigError::Validation("empty will topic".into()));
            }
            if QoS::from_u8(will.qos).is_none() {
                return Err(ConfigError::Validation(
                    "will qos must be 0 or 1".into(),
                ));
            }
        }
        Ok(())
    }
}

/// A topic plus publication options, used for gateway operational topics
#[derive(Debug, Clone, Deserialize)]
pub struct PubTopic {
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

fn default_pub_all() -> PubTopic {
    PubTopic {
        topic: "allnodes".to_string(),
        qos: 1,
        retain: false,
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Per-peer downstream queue depth
    #[serde(default = "default_qlen")]
    pub qlen: usize,
    /// Low-power mode: always queue, assume nodes sleep
    pub lpmode: bool,
    /// Fan-out topic every peer is subscribed to
    #[serde(default = "default_pub_all")]
    pub pub_all: PubTopic,
    /// Topic for operational error publications; absent suppresses them
    pub errors: Option<PubTopic>,
    /// Topic for operational status publications; absent suppresses them
    pub status: Option<PubTopic>,
    /// Status-request topic; recognized but answered as unimplemented
    pub statreq: Option<PubTopic>,
    /// Publication queue depth between peer ingest and the broker
    #[serde(default = "default_pubq_len")]
    pub pubq_len: usize,
    /// Queue depth above which peers receive NAK instead of ACK
    #[serde(default = "default_pub_threshold")]
    pub pub_threshold: usize,
    /// SNTP host; absent disables time sync
    pub ntp_host: Option<String>,
    /// Local time offset in hours relative to UTC
    pub ntp_offset: i32,
}

fn default_qlen() -> usize {
    10
}
fn default_pubq_len() -> usize {
    10
}
fn default_pub_threshold() -> usize {
    5
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            qlen: default_qlen(),
            lpmode: false,
            pub_all: default_pub_all(),
            errors: None,
            status: None,
            statreq: None,
            pubq_len: default_pubq_len(),
            pub_threshold: default_pub_threshold(),
            ntp_host: None,
            ntp_offset: 0,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.qlen == 0 {
            return Err(ConfigError::Validation("qlen must be non-zero".into()));
        }
        if self.pubq_len == 0 {
            return Err(ConfigError::Validation("pubq_len must be non-zero".into()));
        }
        for pt in [Some(&self.pub_all), self.errors.as_ref(), self.status.as_ref(), self.statreq.as_ref()]
            .into_iter()
            .flatten()
        {
            if pt.topic.is_empty() {
                return Err(ConfigError::Validation("empty gateway topic".into()));
            }
            if QoS::from_u8(pt.qos).is_none() {
                return Err(ConfigError::Validation(
                    "gateway topic qos must be 0 or 1".into(),
                ));
            }
        }
        Ok(())
    }
}

/// WiFi credentials for channel acquisition by AP connect
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

/// Node link configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Gateway MAC as 12 hex digits
    pub gateway: String,
    /// Fixed radio channel; absent means learn from credentials or scan
    pub channel: Option<u8>,
    /// WiFi credentials; used to learn the channel when no fixed channel is set
    pub credentials: Option<Credentials>,
    /// Reply window for each request/response exchange
    #[serde(default = "default_reply_timeout", with = "humantime_serde")]
    pub reply_timeout: Duration,
    /// Subscription poll cadence for the asynchronous link
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Consecutive publish failures before a cached channel is discarded
    #[serde(default = "default_chan_fails_max")]
    pub chan_fails_max: u32,
    /// Inbound application frame queue capacity
    #[serde(default = "default_queue_len")]
    pub queue_len: usize,
}

fn default_reply_timeout() -> Duration {
    Duration::from_millis(200)
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_chan_fails_max() -> u32 {
    5
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            gateway: String::new(),
            channel: None,
            credentials: None,
            reply_timeout: default_reply_timeout(),
            poll_interval: default_poll_interval(),
            chan_fails_max: default_chan_fails_max(),
            queue_len: default_queue_len(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `NOWMQ__` prefix with double underscores for nesting:
    ///    - `NOWMQ__CLIENT__SERVER=test.mosquitto.org` overrides `client.server`
    ///    - `NOWMQ__GATEWAY__QLEN=20` overrides `gateway.qlen`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (NOWMQ__CLIENT__SERVER, etc.)
        // Double underscore separates nested keys, single underscore preserved
        let cfg = builder
            .add_source(
                Environment::with_prefix("NOWMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.client.validate()?;
        self.gateway.validate()?;
        Ok(())
    }
}
