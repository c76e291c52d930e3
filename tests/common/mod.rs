//! Scripted-broker helpers: a connector backed by in-memory duplex pipes
//! and just enough server-side frame handling to drive client scenarios.
#![allow(dead_code)]

use parking_lot::Mutex;
use photon::net::transport::ConnectFuture;
use photon::{BoxedStream, Connector, Endpoint, MqttError, Persistence, PersistenceError, ReasonCode};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Route test logs through tracing when RUST_LOG is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Hands out pre-arranged duplex streams, one per connect attempt. `None`
/// entries simulate endpoints that refuse the transport.
pub struct ScriptedConnector {
    streams: Mutex<VecDeque<Option<DuplexStream>>>,
    attempts: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(streams: Vec<Option<DuplexStream>>) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(streams.into()),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn open(&self, _endpoint: &Endpoint, _timeout: Duration) -> ConnectFuture<'_> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.streams.lock().pop_front();
        Box::pin(async move {
            match next.flatten() {
                Some(stream) => Ok(Box::new(stream) as BoxedStream),
                None => Err(MqttError::new(ReasonCode::ServerConnectError)),
            }
        })
    }
}

/// In-memory persistence whose backing map outlives the client, for
/// crash-and-restart scenarios.
#[derive(Clone, Default)]
pub struct SharedMemoryStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl SharedMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for SharedMemoryStore {
    fn open(&mut self, _client_id: &str, _server_uri: &str) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn remove(&mut self, key: &str) -> Result<(), PersistenceError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    fn clear(&mut self) -> Result<(), PersistenceError> {
        self.entries.lock().clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Broker-side frame plumbing
// ---------------------------------------------------------------------------

pub const CONNECT: u8 = 1;
pub const PUBLISH: u8 = 3;
pub const PUBREL: u8 = 6;
pub const SUBSCRIBE: u8 = 8;
pub const UNSUBSCRIBE: u8 = 10;
pub const PINGREQ: u8 = 12;
pub const DISCONNECT: u8 = 14;

/// Read one frame: (first header byte, body).
pub async fn read_frame(stream: &mut DuplexStream) -> (u8, Vec<u8>) {
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await.expect("frame header");
    let mut multiplier = 1u32;
    let mut remaining = 0u32;
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.expect("remaining length");
        remaining += u32::from(byte[0] & 0x7F) * multiplier;
        if byte[0] & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }
    let mut body = vec![0u8; remaining as usize];
    stream.read_exact(&mut body).await.expect("frame body");
    (first[0], body)
}

/// Read a frame and assert its packet type.
pub async fn expect_frame(stream: &mut DuplexStream, packet_type: u8) -> (u8, Vec<u8>) {
    let (first, body) = read_frame(stream).await;
    assert_eq!(first >> 4, packet_type, "unexpected packet type");
    (first, body)
}

pub async fn send(stream: &mut DuplexStream, frame: &[u8]) {
    stream.write_all(frame).await.expect("broker write");
}

/// Accept the CONNECT handshake and answer with a CONNACK.
pub async fn accept_connect(stream: &mut DuplexStream, session_present: bool, return_code: u8) {
    expect_frame(stream, CONNECT).await;
    send(
        stream,
        &[0x20, 0x02, u8::from(session_present), return_code],
    )
    .await;
}

pub fn puback(id: u16) -> Vec<u8> {
    vec![0x40, 0x02, (id >> 8) as u8, (id & 0xFF) as u8]
}

pub fn pubrec(id: u16) -> Vec<u8> {
    vec![0x50, 0x02, (id >> 8) as u8, (id & 0xFF) as u8]
}

pub fn pubcomp(id: u16) -> Vec<u8> {
    vec![0x70, 0x02, (id >> 8) as u8, (id & 0xFF) as u8]
}

pub fn pubrel(id: u16) -> Vec<u8> {
    vec![0x62, 0x02, (id >> 8) as u8, (id & 0xFF) as u8]
}

pub fn suback(id: u16, grants: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x90, (2 + grants.len()) as u8, (id >> 8) as u8, (id & 0xFF) as u8];
    frame.extend_from_slice(grants);
    frame
}

pub fn unsuback(id: u16) -> Vec<u8> {
    vec![0xB0, 0x02, (id >> 8) as u8, (id & 0xFF) as u8]
}

/// PUBLISH the broker delivers to the client.
pub fn broker_publish(topic: &str, payload: &[u8], qos: u8, id: Option<u16>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    if let Some(id) = id {
        body.extend_from_slice(&id.to_be_bytes());
    }
    body.extend_from_slice(payload);
    let mut frame = vec![0b0011_0000 | (qos << 1), body.len() as u8];
    frame.append(&mut body);
    frame
}

/// Client-side PUBLISH as seen by the broker.
pub struct SeenPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub dup: bool,
    pub message_id: Option<u16>,
}

pub fn parse_publish(first: u8, body: &[u8]) -> SeenPublish {
    assert_eq!(first >> 4, PUBLISH);
    let dup = first & 0x08 != 0;
    let qos = (first & 0x06) >> 1;
    let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
    let topic = String::from_utf8(body[2..2 + topic_len].to_vec()).expect("utf8 topic");
    let mut cursor = 2 + topic_len;
    let message_id = if qos > 0 {
        let id = u16::from_be_bytes([body[cursor], body[cursor + 1]]);
        cursor += 2;
        Some(id)
    } else {
        None
    };
    SeenPublish {
        topic,
        payload: body[cursor..].to_vec(),
        qos,
        dup,
        message_id,
    }
}

/// SUBSCRIBE payload: (message id, requested filters with QoS).
pub fn parse_subscribe(body: &[u8]) -> (u16, Vec<(String, u8)>) {
    let id = u16::from_be_bytes([body[0], body[1]]);
    let mut cursor = 2;
    let mut filters = Vec::new();
    while cursor < body.len() {
        let len = usize::from(u16::from_be_bytes([body[cursor], body[cursor + 1]]));
        cursor += 2;
        let filter = String::from_utf8(body[cursor..cursor + len].to_vec()).expect("utf8 filter");
        cursor += len;
        let qos = body[cursor];
        cursor += 1;
        filters.push((filter, qos));
    }
    (id, filters)
}

pub fn message_id_of(body: &[u8]) -> u16 {
    u16::from_be_bytes([body[0], body[1]])
}
