//! Pluggable key-value persistence for in-flight and buffered messages.
//!
//! The store holds opaque wire bytes keyed by string. Key prefixes encode
//! the delivery phase:
//!
//! - `s-<id>`  outbound publish, not yet fully acknowledged
//! - `sc-<id>` outbound QoS 2 publish, PUBREC received
//! - `sb-<id>` outbound PUBREL awaiting PUBCOMP (retransmitted on reconnect)
//! - `r-<id>`  inbound QoS 2 publish awaiting PUBREL
//! - `b-<n>`   offline-buffered publish

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub const SEND_PREFIX: &str = "s-";
pub const SEND_CONFIRMED_PREFIX: &str = "sc-";
pub const SEND_RELEASE_PREFIX: &str = "sb-";
pub const RECEIVED_PREFIX: &str = "r-";
pub const BUFFERED_PREFIX: &str = "b-";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("store is not open")]
    NotOpen,
    #[error("persisted record is corrupt: {0}")]
    Corrupt(String),
    #[error("i/o failure")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Backend(String),
}

/// Key-value store contract the in-flight engine persists through.
///
/// The engine serializes its own access; implementations only need to be
/// `Send`. Values are opaque byte sequences (wire frames or serialized
/// buffer entries).
pub trait Persistence: Send {
    fn open(&mut self, client_id: &str, server_uri: &str) -> Result<(), PersistenceError>;
    fn close(&mut self) -> Result<(), PersistenceError>;
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), PersistenceError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
    fn remove(&mut self, key: &str) -> Result<(), PersistenceError>;
    fn contains_key(&self, key: &str) -> bool;
    fn keys(&self) -> Vec<String>;
    fn clear(&mut self) -> Result<(), PersistenceError>;
}

/// Store handle shared between the client, the in-flight engine and the
/// offline buffer. The mutex is never held across I/O on the transport.
pub type SharedPersistence = Arc<Mutex<Box<dyn Persistence>>>;

pub fn shared(persistence: Box<dyn Persistence>) -> SharedPersistence {
    Arc::new(Mutex::new(persistence))
}

pub fn send_key(id: u16) -> String {
    format!("{SEND_PREFIX}{id}")
}

pub fn send_confirmed_key(id: u16) -> String {
    format!("{SEND_CONFIRMED_PREFIX}{id}")
}

pub fn send_release_key(id: u16) -> String {
    format!("{SEND_RELEASE_PREFIX}{id}")
}

pub fn received_key(id: u16) -> String {
    format!("{RECEIVED_PREFIX}{id}")
}

pub fn buffered_key(index: u64) -> String {
    format!("{BUFFERED_PREFIX}{index}")
}

/// Message id encoded in a prefixed key, if the key carries that prefix.
pub fn key_message_id(key: &str, prefix: &str) -> Option<u16> {
    key.strip_prefix(prefix)?.parse().ok()
}

/// Volatile store. State is lost when the client is dropped, which is safe
/// with clean sessions or QoS 0 traffic.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    entries: HashMap<String, Vec<u8>>,
    open: bool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn require_open(&self) -> Result<(), PersistenceError> {
        if self.open {
            Ok(())
        } else {
            Err(PersistenceError::NotOpen)
        }
    }
}

impl Persistence for MemoryPersistence {
    fn open(&mut self, _client_id: &str, _server_uri: &str) -> Result<(), PersistenceError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        self.open = false;
        Ok(())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        self.require_open()?;
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.require_open()?;
        Ok(self.entries.get(key).cloned())
    }

    fn remove(&mut self, key: &str) -> Result<(), PersistenceError> {
        self.require_open()?;
        self.entries.remove(key);
        Ok(())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.open && self.entries.contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        if !self.open {
            return Vec::new();
        }
        self.entries.keys().cloned().collect()
    }

    fn clear(&mut self) -> Result<(), PersistenceError> {
        self.require_open()?;
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let mut store = MemoryPersistence::new();
        store.open("c1", "tcp://localhost:1883").unwrap();
        store.put("s-1", b"frame").unwrap();
        assert!(store.contains_key("s-1"));
        assert_eq!(store.get("s-1").unwrap().unwrap(), b"frame");
        store.remove("s-1").unwrap();
        assert!(!store.contains_key("s-1"));
        assert_eq!(store.get("s-1").unwrap(), None);
    }

    #[test]
    fn operations_fail_before_open() {
        let mut store = MemoryPersistence::new();
        assert!(matches!(store.put("s-1", b"x"), Err(PersistenceError::NotOpen)));
        assert!(store.keys().is_empty());
    }

    #[test]
    fn clear_removes_every_record() {
        let mut store = MemoryPersistence::new();
        store.open("c1", "tcp://localhost:1883").unwrap();
        store.put("s-1", b"a").unwrap();
        store.put("r-2", b"b").unwrap();
        store.clear().unwrap();
        assert!(store.keys().is_empty());
    }

    #[test]
    fn key_helpers_round_trip_ids() {
        assert_eq!(send_key(12), "s-12");
        assert_eq!(key_message_id("s-12", SEND_PREFIX), Some(12));
        assert_eq!(key_message_id("sc-65535", SEND_CONFIRMED_PREFIX), Some(65535));
        assert_eq!(key_message_id("sb-9", SEND_PREFIX), None);
        assert_eq!(key_message_id("junk", RECEIVED_PREFIX), None);
    }
}
