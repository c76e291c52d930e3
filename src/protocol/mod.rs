//! MQTT 3.1.1 control-packet model and wire codec, client side.
//!
//! Outbound packets are encoded to owned frames so the same bytes can be
//! persisted before they are written; inbound packets are read from the
//! transport one frame at a time.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

pub const PROTOCOL_NAME: &str = "MQTT";
pub const PROTOCOL_LEVEL: u8 = 4;

/// Delivery guarantee for a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(anyhow!("invalid QoS {other}")),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// An application message: the payload plus its delivery attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retained: bool,
    /// Set only on retransmission.
    #[serde(default)]
    pub duplicate: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: Qos, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retained,
            duplicate: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Connect {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub will: Option<Message>,
    pub user_name: Option<String>,
    pub password: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: u8,
}

#[derive(Debug, Clone)]
pub struct Publish {
    pub message: Message,
    /// Present for QoS 1/2.
    pub message_id: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Subscribe {
    pub message_id: u16,
    pub filters: Vec<(String, Qos)>,
}

#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub message_id: u16,
    pub filters: Vec<String>,
}

/// Union of every control packet the client writes or reads.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck { message_id: u16, granted: Vec<u8> },
    Unsubscribe(Unsubscribe),
    UnsubAck { message_id: u16 },
    PingReq,
    PingResp,
    Disconnect,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a packet into a complete wire frame.
pub fn encode(packet: &Packet) -> Vec<u8> {
    match packet {
        Packet::Connect(connect) => encode_connect(connect),
        Packet::ConnAck(ack) => frame(0x20, vec![u8::from(ack.session_present), ack.return_code]),
        Packet::Publish(publish) => encode_publish(publish),
        Packet::PubAck(id) => ack_frame(0x40, *id),
        Packet::PubRec(id) => ack_frame(0x50, *id),
        // PUBREL carries the mandated 0b0010 flag bits.
        Packet::PubRel(id) => ack_frame(0x62, *id),
        Packet::PubComp(id) => ack_frame(0x70, *id),
        Packet::Subscribe(subscribe) => encode_subscribe(subscribe),
        Packet::SubAck { message_id, granted } => {
            let mut body = message_id.to_be_bytes().to_vec();
            body.extend_from_slice(granted);
            frame(0x90, body)
        }
        Packet::Unsubscribe(unsubscribe) => encode_unsubscribe(unsubscribe),
        Packet::UnsubAck { message_id } => ack_frame(0xB0, *message_id),
        Packet::PingReq => vec![0xC0, 0x00],
        Packet::PingResp => vec![0xD0, 0x00],
        Packet::Disconnect => vec![0xE0, 0x00],
    }
}

fn encode_connect(connect: &Connect) -> Vec<u8> {
    let mut body = Vec::new();
    put_string(&mut body, PROTOCOL_NAME);
    body.push(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04;
        flags |= will.qos.bits() << 3;
        if will.retained {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.user_name.is_some() {
        flags |= 0x80;
    }
    body.push(flags);
    body.extend_from_slice(&connect.keep_alive.to_be_bytes());

    put_string(&mut body, &connect.client_id);
    if let Some(will) = &connect.will {
        put_string(&mut body, &will.topic);
        put_binary(&mut body, &will.payload);
    }
    if let Some(user) = &connect.user_name {
        put_string(&mut body, user);
    }
    if let Some(password) = &connect.password {
        put_binary(&mut body, password);
    }
    frame(0x10, body)
}

fn encode_publish(publish: &Publish) -> Vec<u8> {
    let message = &publish.message;
    let mut header = 0b0011_0000 | (message.qos.bits() << 1);
    if message.duplicate {
        header |= 0x08;
    }
    if message.retained {
        header |= 0x01;
    }
    let mut body = Vec::with_capacity(message.topic.len() + message.payload.len() + 4);
    put_string(&mut body, &message.topic);
    if message.qos != Qos::AtMostOnce {
        // Callers stamp the id before encoding; a missing one is a bug in
        // the in-flight engine, not recoverable at this layer.
        let id = publish.message_id.expect("QoS > 0 publish without message id");
        body.extend_from_slice(&id.to_be_bytes());
    }
    body.extend_from_slice(&message.payload);
    frame(header, body)
}

fn encode_subscribe(subscribe: &Subscribe) -> Vec<u8> {
    // SUBSCRIBE requires the 0b0010 flag bits.
    let mut body = subscribe.message_id.to_be_bytes().to_vec();
    for (filter, qos) in &subscribe.filters {
        put_string(&mut body, filter);
        body.push(qos.bits());
    }
    frame(0x82, body)
}

fn encode_unsubscribe(unsubscribe: &Unsubscribe) -> Vec<u8> {
    let mut body = unsubscribe.message_id.to_be_bytes().to_vec();
    for filter in &unsubscribe.filters {
        put_string(&mut body, filter);
    }
    frame(0xA2, body)
}

fn ack_frame(header: u8, id: u16) -> Vec<u8> {
    vec![header, 0x02, (id >> 8) as u8, (id & 0xFF) as u8]
}

fn frame(header: u8, mut body: Vec<u8>) -> Vec<u8> {
    let mut out = vec![header];
    out.extend(encode_remaining_length(body.len()));
    out.append(&mut body);
    out
}

pub(crate) fn encode_remaining_length(mut len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    out
}

/// Set the DUP bit on an encoded PUBLISH frame, for retransmission of
/// persisted wire bytes.
pub fn mark_duplicate(frame: &mut [u8]) {
    if !frame.is_empty() && frame[0] >> 4 == 3 {
        frame[0] |= 0x08;
    }
}

/// Message id carried in an encoded QoS > 0 PUBLISH frame.
pub fn publish_frame_message_id(frame: &[u8]) -> Option<u16> {
    parse_frame(frame).ok().and_then(|packet| match packet {
        Packet::Publish(publish) => publish.message_id,
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Read one control packet from the transport.
pub async fn read_packet<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<Packet> {
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;
    let remaining = decode_remaining_length_stream(stream).await?;
    let mut body = vec![0u8; remaining as usize];
    stream.read_exact(&mut body).await?;
    decode(first[0], &body)
}

/// Decode a complete frame (header byte + remaining length + body).
pub fn parse_frame(frame: &[u8]) -> Result<Packet> {
    let mut cursor = 1usize;
    if frame.is_empty() {
        bail!("empty frame");
    }
    let remaining = decode_varint(frame, &mut cursor).context("truncated remaining length")?;
    let end = cursor
        .checked_add(remaining as usize)
        .filter(|end| *end <= frame.len())
        .context("frame shorter than remaining length")?;
    decode(frame[0], &frame[cursor..end])
}

fn decode(first: u8, body: &[u8]) -> Result<Packet> {
    let packet_type = first >> 4;
    let flags = first & 0x0F;
    match packet_type {
        2 => parse_connack(body),
        3 => parse_publish(flags, body),
        4 => Ok(Packet::PubAck(parse_packet_id(body)?)),
        5 => Ok(Packet::PubRec(parse_packet_id(body)?)),
        6 => Ok(Packet::PubRel(parse_packet_id(body)?)),
        7 => Ok(Packet::PubComp(parse_packet_id(body)?)),
        9 => parse_suback(body),
        11 => Ok(Packet::UnsubAck {
            message_id: parse_packet_id(body)?,
        }),
        12 => Ok(Packet::PingReq),
        13 => Ok(Packet::PingResp),
        14 => Ok(Packet::Disconnect),
        other => Err(anyhow!("unexpected packet type {other}")),
    }
}

fn parse_connack(body: &[u8]) -> Result<Packet> {
    if body.len() != 2 {
        bail!("CONNACK body must be 2 bytes, got {}", body.len());
    }
    if body[0] & !0x01 != 0 {
        bail!("reserved CONNACK flags set");
    }
    Ok(Packet::ConnAck(ConnAck {
        session_present: body[0] & 0x01 != 0,
        return_code: body[1],
    }))
}

fn parse_publish(flags: u8, body: &[u8]) -> Result<Packet> {
    let duplicate = flags & 0x08 != 0;
    let retained = flags & 0x01 != 0;
    let qos = Qos::from_bits((flags & 0x06) >> 1)?;
    if qos == Qos::AtMostOnce && duplicate {
        bail!("DUP flag set on QoS 0 publish");
    }
    let mut cursor = 0usize;
    let topic = read_string(body, &mut cursor)?;
    let message_id = match qos {
        Qos::AtMostOnce => None,
        _ => Some(read_u16(body, &mut cursor)?),
    };
    let payload = body[cursor..].to_vec();
    Ok(Packet::Publish(Publish {
        message: Message {
            topic,
            payload,
            qos,
            retained,
            duplicate,
        },
        message_id,
    }))
}

fn parse_suback(body: &[u8]) -> Result<Packet> {
    let mut cursor = 0usize;
    let message_id = read_u16(body, &mut cursor)?;
    let granted = body[cursor..].to_vec();
    if granted.is_empty() {
        bail!("SUBACK with no return codes");
    }
    for code in &granted {
        if !matches!(code, 0 | 1 | 2 | 0x80) {
            bail!("invalid SUBACK return code {code:#x}");
        }
    }
    Ok(Packet::SubAck { message_id, granted })
}

fn parse_packet_id(body: &[u8]) -> Result<u16> {
    let mut cursor = 0usize;
    let id = read_u16(body, &mut cursor)?;
    if id == 0 {
        bail!("message id 0 is reserved");
    }
    Ok(id)
}

fn read_u16(buf: &[u8], cursor: &mut usize) -> Result<u16> {
    if *cursor + 1 >= buf.len() {
        bail!("unexpected end of buffer");
    }
    let value = u16::from_be_bytes([buf[*cursor], buf[*cursor + 1]]);
    *cursor += 2;
    Ok(value)
}

fn read_string(buf: &[u8], cursor: &mut usize) -> Result<String> {
    let len = read_u16(buf, cursor)? as usize;
    if *cursor + len > buf.len() {
        bail!("unexpected end of buffer");
    }
    let value = std::str::from_utf8(&buf[*cursor..*cursor + len])
        .context("invalid utf8 in mqtt string")?
        .to_string();
    *cursor += len;
    Ok(value)
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn put_binary(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
}

fn decode_varint(buf: &[u8], cursor: &mut usize) -> Option<u32> {
    let mut multiplier = 1u32;
    let mut value = 0u32;
    loop {
        if *cursor >= buf.len() {
            return None;
        }
        let byte = buf[*cursor];
        *cursor += 1;
        value = value.saturating_add(u32::from(byte & 0x7F) * multiplier);
        if byte & 0x80 == 0 {
            break;
        }
        multiplier = multiplier.checked_mul(128)?;
    }
    Some(value)
}

async fn decode_remaining_length_stream<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<u32> {
    let mut multiplier = 1u32;
    let mut value = 0u32;
    loop {
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await?;
        value = value.saturating_add(u32::from(buf[0] & 0x7F) * multiplier);
        if buf[0] & 0x80 == 0 {
            break;
        }
        multiplier = multiplier
            .checked_mul(128)
            .context("remaining length overflow")?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frame_layout() {
        let connect = Connect {
            client_id: "c1".into(),
            clean_session: true,
            keep_alive: 30,
            will: None,
            user_name: Some("alice".into()),
            password: Some(b"secret".to_vec()),
        };
        let bytes = encode(&Packet::Connect(connect));
        assert_eq!(bytes[0], 0x10);
        // variable header: "MQTT", level 4
        assert_eq!(&bytes[2..8], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);
        assert_eq!(bytes[8], 4);
        // flags: clean session + user name + password
        assert_eq!(bytes[9], 0x02 | 0x80 | 0x40);
        // keep alive
        assert_eq!(&bytes[10..12], &[0, 30]);
        // client id
        assert_eq!(&bytes[12..16], &[0x00, 0x02, b'c', b'1']);
    }

    #[test]
    fn connect_frame_carries_will() {
        let connect = Connect {
            client_id: "c".into(),
            clean_session: false,
            keep_alive: 0,
            will: Some(Message::new("dead", b"gone".to_vec(), Qos::AtLeastOnce, true)),
            user_name: None,
            password: None,
        };
        let bytes = encode(&Packet::Connect(connect));
        // will flag + will qos 1 + will retain
        assert_eq!(bytes[9], 0x04 | 0x08 | 0x20);
    }

    #[test]
    fn publish_round_trips_through_parse() {
        let publish = Publish {
            message: Message::new("sensors/temp", b"21.5".to_vec(), Qos::AtLeastOnce, false),
            message_id: Some(7),
        };
        let bytes = encode(&Packet::Publish(publish));
        match parse_frame(&bytes).unwrap() {
            Packet::Publish(parsed) => {
                assert_eq!(parsed.message.topic, "sensors/temp");
                assert_eq!(parsed.message.payload, b"21.5");
                assert_eq!(parsed.message_id, Some(7));
                assert!(!parsed.message.duplicate);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn mark_duplicate_sets_dup_bit_only_on_publish() {
        let publish = Publish {
            message: Message::new("x", Vec::new(), Qos::ExactlyOnce, false),
            message_id: Some(3),
        };
        let mut bytes = encode(&Packet::Publish(publish));
        mark_duplicate(&mut bytes);
        match parse_frame(&bytes).unwrap() {
            Packet::Publish(parsed) => assert!(parsed.message.duplicate),
            other => panic!("unexpected packet {other:?}"),
        }

        let mut ping = encode(&Packet::PingReq);
        mark_duplicate(&mut ping);
        assert_eq!(ping, vec![0xC0, 0x00]);
    }

    #[test]
    fn suback_rejects_bad_grant() {
        // id 1, grant 0x03 is not a valid return code
        assert!(parse_frame(&[0x90, 0x03, 0x00, 0x01, 0x03]).is_err());
        match parse_frame(&[0x90, 0x04, 0x00, 0x01, 0x01, 0x80]).unwrap() {
            Packet::SubAck { message_id, granted } => {
                assert_eq!(message_id, 1);
                assert_eq!(granted, vec![0x01, 0x80]);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn message_id_zero_is_rejected() {
        assert!(parse_frame(&[0x40, 0x02, 0x00, 0x00]).is_err());
    }

    #[tokio::test]
    async fn read_packet_reassembles_split_frames() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let frame = encode(&Packet::PubAck(513));
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for byte in frame {
                server.write_all(&[byte]).await.unwrap();
            }
        });
        match read_packet(&mut client).await.unwrap() {
            Packet::PubAck(id) => assert_eq!(id, 513),
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn remaining_length_multi_byte() {
        assert_eq!(encode_remaining_length(0), vec![0x00]);
        assert_eq!(encode_remaining_length(127), vec![0x7F]);
        assert_eq!(encode_remaining_length(128), vec![0x80, 0x01]);
        assert_eq!(encode_remaining_length(16_384), vec![0x80, 0x80, 0x01]);
    }
}
