//! Radio frame shapes
//!
//! Upstream (peer to gateway) frames are JSON lists whose length selects
//! the meaning: 1 = command, 2 = subscribe, 4 = publish. Downstream
//! publications are the JSON 3-list `[topic, payload, retained]`; control
//! replies are bare ASCII tags.

use serde_json::Value;

use crate::protocol::QoS;

/// Control replies sent from gateway to peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTag {
    /// Publish queued, room available
    Ack,
    /// Publish queued but the queue is past its soft limit
    Nak,
    /// Publish queue full; the message was dropped
    Bad,
    /// Broker reachable
    Up,
    /// Broker unreachable
    Down,
}

impl ReplyTag {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            ReplyTag::Ack => b"ACK",
            ReplyTag::Nak => b"NAK",
            ReplyTag::Bad => b"BAD",
            ReplyTag::Up => b"UP",
            ReplyTag::Down => b"DOWN",
        }
    }

    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        match frame {
            b"ACK" => Some(ReplyTag::Ack),
            b"NAK" => Some(ReplyTag::Nak),
            b"BAD" => Some(ReplyTag::Bad),
            b"UP" => Some(ReplyTag::Up),
            b"DOWN" => Some(ReplyTag::Down),
            _ => None,
        }
    }
}

/// Single-element command frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Report the gateway's WiFi channel
    Chan,
    /// Report broker state (UP/DOWN)
    Ping,
    /// Flush this peer's downstream queue
    Get,
    /// Ping and flush, for the asynchronous link's poll loop
    Aget,
    /// Anything else; logged and otherwise ignored
    Unknown(String),
}

impl Command {
    fn parse(name: &str) -> Self {
        match name {
            "chan" => Command::Chan,
            "ping" => Command::Ping,
            "get" => Command::Get,
            "aget" => Command::Aget,
            other => Command::Unknown(other.to_string()),
        }
    }

    /// Render as the single-element JSON list the peers send
    pub fn to_frame(&self) -> Vec<u8> {
        let name = match self {
            Command::Chan => "chan",
            Command::Ping => "ping",
            Command::Get => "get",
            Command::Aget => "aget",
            Command::Unknown(s) => s.as_str(),
        };
        serde_json::to_vec(&(name,)).expect("command frame serializes")
    }
}

/// A peer's publish request, queued towards the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubRequest {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
    pub qos: QoS,
}

/// A parsed upstream frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFrame {
    Command(Command),
    Subscribe { topic: String, qos: QoS },
    Publish(PubRequest),
    /// JSON list of an unexpected length or with wrong element types
    Malformed,
}

/// Parse an upstream frame. `None` for frames that are not JSON at all;
/// no reply is owed for those.
pub fn parse_upstream(frame: &[u8]) -> Option<UpstreamFrame> {
    let value: Value = serde_json::from_slice(frame).ok()?;
    let items = match value {
        Value::Array(items) => items,
        _ => return Some(UpstreamFrame::Malformed),
    };

    let parsed = match items.as_slice() {
        [Value::String(cmd)] => UpstreamFrame::Command(Command::parse(cmd)),
        [Value::String(topic), Value::Number(qos)] => match number_qos(qos) {
            Some(qos) => UpstreamFrame::Subscribe {
                topic: topic.clone(),
                qos,
            },
            None => UpstreamFrame::Malformed,
        },
        [Value::String(topic), Value::String(payload), Value::Bool(retain), Value::Number(qos)] => {
            match number_qos(qos) {
                Some(qos) => UpstreamFrame::Publish(PubRequest {
                    topic: topic.clone(),
                    payload: payload.clone(),
                    retain: *retain,
                    qos,
                }),
                None => UpstreamFrame::Malformed,
            }
        }
        _ => UpstreamFrame::Malformed,
    };
    Some(parsed)
}

fn number_qos(n: &serde_json::Number) -> Option<QoS> {
    n.as_u64()
        .and_then(|v| u8::try_from(v).ok())
        .and_then(QoS::from_u8)
}

/// Render a subscribe frame the way peers send it
pub fn render_subscribe(topic: &str, qos: QoS) -> Vec<u8> {
    serde_json::to_vec(&(topic, qos as u8)).expect("subscribe frame serializes")
}

/// Render a publish frame the way peers send it
pub fn render_publish(topic: &str, payload: &str, retain: bool, qos: QoS) -> Vec<u8> {
    serde_json::to_vec(&(topic, payload, retain, qos as u8)).expect("publish frame serializes")
}

/// Render a downstream publication for a peer
pub fn render_downstream(topic: &str, payload: &str, retained: bool) -> Vec<u8> {
    serde_json::to_vec(&(topic, payload, retained)).expect("downstream frame serializes")
}

/// Parse a downstream publication on the node side
pub fn parse_downstream(frame: &[u8]) -> Option<(String, String, bool)> {
    serde_json::from_slice(frame).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn commands_roundtrip() {
        for cmd in [Command::Chan, Command::Ping, Command::Get, Command::Aget] {
            let frame = cmd.to_frame();
            assert_eq!(
                parse_upstream(&frame),
                Some(UpstreamFrame::Command(cmd.clone()))
            );
        }
    }

    #[test]
    fn unknown_command_is_preserved() {
        let frame = br#"["reboot"]"#;
        assert_eq!(
            parse_upstream(frame),
            Some(UpstreamFrame::Command(Command::Unknown("reboot".into())))
        );
    }

    #[test]
    fn subscribe_frame_parses() {
        let frame = render_subscribe("weather", QoS::AtLeastOnce);
        assert_eq!(
            parse_upstream(&frame),
            Some(UpstreamFrame::Subscribe {
                topic: "weather".into(),
                qos: QoS::AtLeastOnce,
            })
        );
    }

    #[test]
    fn publish_frame_parses() {
        let frame = render_publish("shed", "hi", false, QoS::AtLeastOnce);
        assert_eq!(
            parse_upstream(&frame),
            Some(UpstreamFrame::Publish(PubRequest {
                topic: "shed".into(),
                payload: "hi".into(),
                retain: false,
                qos: QoS::AtLeastOnce,
            }))
        );
    }

    #[test]
    fn qos2_publish_is_malformed() {
        let frame = br#"["t", "p", false, 2]"#;
        assert_eq!(parse_upstream(frame), Some(UpstreamFrame::Malformed));
    }

    #[test]
    fn wrong_length_is_malformed() {
        let frame = br#"["a", "b", "c"]"#;
        assert_eq!(parse_upstream(frame), Some(UpstreamFrame::Malformed));
    }

    #[test]
    fn non_json_yields_none() {
        assert_eq!(parse_upstream(b"ACK"), None);
        assert_eq!(parse_upstream(b"\xff\xfe"), None);
    }

    #[test]
    fn downstream_roundtrip() {
        let frame = render_downstream("weather", "sunny", false);
        assert_eq!(
            std::str::from_utf8(&frame).unwrap(),
            r#"["weather","sunny",false]"#
        );
        assert_eq!(
            parse_downstream(&frame),
            Some(("weather".into(), "sunny".into(), false))
        );
    }

    #[test]
    fn reply_tags_roundtrip() {
        for tag in [
            ReplyTag::Ack,
            ReplyTag::Nak,
            ReplyTag::Bad,
            ReplyTag::Up,
            ReplyTag::Down,
        ] {
            assert_eq!(ReplyTag::from_frame(tag.as_bytes()), Some(tag));
        }
        assert_eq!(ReplyTag::from_frame(b"WAT"), None);
    }
}
