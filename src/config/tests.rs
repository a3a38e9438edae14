//! Configuration tests

use std::io::Write;
use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;

fn minimal() -> &'static str {
    r#"
        [client]
        server = "broker.local"
    "#
}

#[test]
fn defaults_from_minimal_file() {
    let cfg = Config::parse(minimal()).unwrap();
    assert_eq!(cfg.client.server, "broker.local");
    assert_eq!(cfg.client.effective_port(), 1883);
    assert_eq!(cfg.client.keepalive, 60);
    assert_eq!(cfg.client.max_repubs, 4);
    assert_eq!(cfg.client.response_time, Duration::from_secs(10));
    assert!(cfg.client.clean_init);
    assert!(cfg.client.clean);
    assert_eq!(cfg.gateway.qlen, 10);
    assert_eq!(cfg.gateway.pubq_len, 10);
    assert_eq!(cfg.gateway.pub_threshold, 5);
    assert_eq!(cfg.gateway.pub_all.topic, "allnodes");
    assert_eq!(cfg.gateway.pub_all.qos, 1);
    assert_eq!(cfg.node.reply_timeout, Duration::from_millis(200));
    assert_eq!(cfg.node.chan_fails_max, 5);
}

#[test]
fn ssl_flag_switches_default_port() {
    let cfg = Config::parse(
        r#"
        [client]
        server = "broker.local"
        ssl = true
    "#,
    )
    .unwrap();
    assert_eq!(cfg.client.effective_port(), 8883);
}

#[test]
fn explicit_port_wins() {
    let cfg = Config::parse(
        r#"
        [client]
        server = "broker.local"
        port = 1884
        ssl = true
    "#,
    )
    .unwrap();
    assert_eq!(cfg.client.effective_port(), 1884);
}

#[test]
fn keepalive_boundary() {
    let ok = Config::parse(
        r#"
        [client]
        server = "b"
        keepalive = 65535
    "#,
    );
    assert!(ok.is_ok());

    let too_big = Config::parse(
        r#"
        [client]
        server = "b"
        keepalive = 65536
    "#,
    );
    assert!(matches!(too_big, Err(ConfigError::Validation(_))));
}

#[test]
fn empty_will_topic_rejected() {
    let cfg = Config::parse(
        r#"
        [client]
        server = "b"
        [client.will]
        topic = ""
        payload = "gone"
    "#,
    );
    assert!(matches!(cfg, Err(ConfigError::Validation(_))));
}

#[test]
fn will_qos2_rejected() {
    let cfg = Config::parse(
        r#"
        [client]
        server = "b"
        [client.will]
        topic = "status"
        qos = 2
    "#,
    );
    assert!(matches!(cfg, Err(ConfigError::Validation(_))));
}

#[test]
fn missing_server_rejected() {
    assert!(matches!(
        Config::parse("[client]\n"),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn durations_accept_humantime() {
    let cfg = Config::parse(
        r#"
        [client]
        server = "b"
        response_time = "5s"
        ping_interval = "30s"
        [node]
        reply_timeout = "250ms"
        poll_interval = "2s"
    "#,
    )
    .unwrap();
    assert_eq!(cfg.client.response_time, Duration::from_secs(5));
    assert_eq!(cfg.client.ping_interval, Duration::from_secs(30));
    assert_eq!(cfg.node.reply_timeout, Duration::from_millis(250));
    assert_eq!(cfg.node.poll_interval, Duration::from_secs(2));
}

#[test]
fn gateway_operational_topics() {
    let cfg = Config::parse(
        r#"
        [client]
        server = "b"
        [gateway]
        lpmode = true
        qlen = 4
        [gateway.errors]
        topic = "gw/errors"
        qos = 1
        [gateway.status]
        topic = "gw/status"
        retain = true
    "#,
    )
    .unwrap();
    assert!(cfg.gateway.lpmode);
    assert_eq!(cfg.gateway.qlen, 4);
    assert_eq!(cfg.gateway.errors.as_ref().unwrap().topic, "gw/errors");
    assert!(cfg.gateway.status.as_ref().unwrap().retain);
    assert!(cfg.gateway.statreq.is_none());
}

#[test]
fn env_substitution_with_default() {
    let content = r#"
        [client]
        server = "${NOWMQ_TEST_NO_SUCH_VAR:-fallback.local}"
    "#;
    let substituted = substitute_env_vars(content);
    assert!(substituted.contains("fallback.local"));
}

#[test]
fn load_from_file_with_overrides() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        [client]
        server = "file.local"
        keepalive = 120
    "#
    )
    .unwrap();
    let cfg = Config::load(file.path()).unwrap();
    assert_eq!(cfg.client.server, "file.local");
    assert_eq!(cfg.client.keepalive, 120);
}

#[test]
fn missing_file_falls_back_to_defaults_and_fails_validation() {
    // No file and no env: no server, so validation refuses
    let res = Config::load("/definitely/not/a/real/path.toml");
    assert!(matches!(res, Err(ConfigError::Validation(_))));
}
