//! MQTT Packet Decoder
//!
//! Incremental decoder for the v3.1.1 packet subset. Packet types outside
//! the subset are skipped, not errored: the reader just moves to the next
//! frame. A QoS 2 PUBLISH is a protocol error.

use bytes::Bytes;

use super::{read_string, read_u16, read_variable_int, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, PacketType, PubAck, Publish, QoS, SubAck, Subscribe,
    UnsubAck, Unsubscribe, Will,
};

/// MQTT Packet Decoder
pub struct Decoder {
    /// Maximum packet size accepted
    max_packet_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Decode the next packet from the buffer.
    ///
    /// Returns `Ok(None)` while the buffer holds no complete packet. On
    /// `Ok(Some((packet, consumed)))` the caller must drain `consumed`
    /// bytes, which includes any skipped unknown-type frames.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let mut pos = 0;

        loop {
            if buf.len() - pos < 2 {
                return Ok(None);
            }

            let first_byte = buf[pos];
            let packet_type = first_byte >> 4;
            let flags = first_byte & 0x0F;

            let (remaining_length, len_bytes) = match read_variable_int(&buf[pos + 1..]) {
                Ok(r) => r,
                Err(DecodeError::InsufficientData) => return Ok(None),
                Err(e) => return Err(e),
            };

            if remaining_length as usize > self.max_packet_size {
                return Err(DecodeError::PacketTooLarge);
            }

            let total_len = 1 + len_bytes + remaining_length as usize;
            if buf.len() - pos < total_len {
                return Ok(None);
            }

            let payload = &buf[pos + 1 + len_bytes..pos + total_len];

            let packet = match PacketType::from_u8(packet_type) {
                // Unknown top nibble: skip the frame and keep going
                None => {
                    pos += total_len;
                    continue;
                }
                Some(PacketType::Connect) => decode_connect(payload)?,
                Some(PacketType::ConnAck) => decode_connack(flags, payload)?,
                Some(PacketType::Publish) => decode_publish(flags, payload)?,
                Some(PacketType::PubAck) => decode_puback(flags, payload)?,
                Some(PacketType::Subscribe) => decode_subscribe(flags, payload)?,
                Some(PacketType::SubAck) => decode_suback(flags, payload)?,
                Some(PacketType::Unsubscribe) => decode_unsubscribe(flags, payload)?,
                Some(PacketType::UnsubAck) => decode_unsuback(flags, payload)?,
                Some(PacketType::PingReq) => {
                    if flags != 0 {
                        return Err(DecodeError::InvalidFlags);
                    }
                    Packet::PingReq
                }
                Some(PacketType::PingResp) => {
                    if flags != 0 {
                        return Err(DecodeError::InvalidFlags);
                    }
                    Packet::PingResp
                }
                Some(PacketType::Disconnect) => {
                    if flags != 0 {
                        return Err(DecodeError::InvalidFlags);
                    }
                    Packet::Disconnect
                }
            };

            return Ok(Some((packet, pos + total_len)));
        }
    }
}

fn decode_connect(payload: &[u8]) -> Result<Packet, DecodeError> {
    let mut pos = 0;

    let (protocol_name, len) = read_string(&payload[pos..])?;
    pos += len;
    if protocol_name != "MQTT" {
        return Err(DecodeError::MalformedPacket("bad protocol name"));
    }

    if payload.len() < pos + 4 {
        return Err(DecodeError::InsufficientData);
    }
    let level = payload[pos];
    pos += 1;
    if level != crate::protocol::PROTOCOL_LEVEL {
        return Err(DecodeError::MalformedPacket("unsupported protocol level"));
    }

    let connect_flags = payload[pos];
    pos += 1;
    if (connect_flags & 0x01) != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    let keep_alive = read_u16(&payload[pos..])?;
    pos += 2;

    let (client_id, len) = read_string(&payload[pos..])?;
    let client_id = client_id.to_string();
    pos += len;

    let will = if will_flag {
        let (topic, len) = read_string(&payload[pos..])?;
        let topic = topic.to_string();
        pos += len;
        let (data, len) = super::read_binary(&payload[pos..])?;
        let payload_bytes = Bytes::copy_from_slice(data);
        pos += len;
        Some(Will {
            topic,
            payload: payload_bytes,
            qos: QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        let (s, len) = read_string(&payload[pos..])?;
        let s = s.to_string();
        pos += len;
        Some(s)
    } else {
        None
    };

    let password = if password_flag {
        let (data, _len) = super::read_binary(&payload[pos..])?;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

    Ok(Packet::Connect(Box::new(Connect {
        client_id,
        clean_session,
        keep_alive,
        username,
        password,
        will,
    })))
}

fn decode_connack(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() != 2 {
        return Err(DecodeError::MalformedPacket("connack length"));
    }
    if (payload[0] & 0xFE) != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    Ok(Packet::ConnAck(ConnAck {
        session_present: (payload[0] & 0x01) != 0,
        return_code: payload[1],
    }))
}

fn decode_publish(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let retain = (flags & 0x01) != 0;
    let qos = match (flags >> 1) & 0x03 {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => return Err(DecodeError::QoS2NotSupported),
        q => return Err(DecodeError::InvalidQoS(q)),
    };

    let mut pos = 0;
    let (topic, len) = read_string(&payload[pos..])?;
    let topic = topic.to_string();
    pos += len;

    let packet_id = if qos != QoS::AtMostOnce {
        let pid = read_u16(&payload[pos..])?;
        pos += 2;
        if pid == 0 {
            return Err(DecodeError::MalformedPacket("zero packet id"));
        }
        Some(pid)
    } else {
        None
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(&payload[pos..]),
    }))
}

fn decode_puback(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() != 2 {
        return Err(DecodeError::MalformedPacket("puback length"));
    }
    Ok(Packet::PubAck(PubAck {
        packet_id: read_u16(payload)?,
    }))
}

fn decode_subscribe(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }
    let mut pos = 0;
    let packet_id = read_u16(&payload[pos..])?;
    pos += 2;
    let (topic, len) = read_string(&payload[pos..])?;
    let topic = topic.to_string();
    pos += len;
    if pos >= payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let qos_byte = payload[pos];
    pos += 1;
    let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;
    if pos != payload.len() {
        return Err(DecodeError::MalformedPacket("multiple topic filters"));
    }
    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        topic,
        qos,
    }))
}

fn decode_suback(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() != 3 {
        return Err(DecodeError::MalformedPacket("suback length"));
    }
    Ok(Packet::SubAck(SubAck {
        packet_id: read_u16(payload)?,
        return_code: payload[2],
    }))
}

fn decode_unsubscribe(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }
    let mut pos = 0;
    let packet_id = read_u16(&payload[pos..])?;
    pos += 2;
    let (topic, len) = read_string(&payload[pos..])?;
    let topic = topic.to_string();
    pos += len;
    if pos != payload.len() {
        return Err(DecodeError::MalformedPacket("multiple topic filters"));
    }
    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, topic }))
}

fn decode_unsuback(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() != 2 {
        return Err(DecodeError::MalformedPacket("unsuback length"));
    }
    Ok(Packet::UnsubAck(UnsubAck {
        packet_id: read_u16(payload)?,
    }))
}
