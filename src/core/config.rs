use crate::protocol::{Message, Qos};
use serde::Deserialize;
use std::time::Duration;

fn default_clean_session() -> bool {
    true
}

fn default_keep_alive_interval() -> u16 {
    60
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_max_reconnect_delay() -> u64 {
    128_000
}

fn default_max_inflight() -> u16 {
    10
}

fn default_buffer_size() -> usize {
    5000
}

/// Options governing a single connect attempt and the session it creates.
///
/// Deserializable so deployments can keep connect profiles in config files;
/// every field has the protocol-conventional default.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectOptions {
    /// Ask the broker to discard session state on connect and disconnect.
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Keepalive interval in seconds; 0 disables the keepalive scheduler.
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval: u16,
    /// Per-endpoint handshake timeout in seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Reconnect automatically after a lost connection.
    #[serde(default)]
    pub automatic_reconnect: bool,
    /// Ceiling for the doubling reconnect delay, in milliseconds.
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay: u64,
    /// Maximum number of QoS 1/2 publishes in non-terminal ack phases.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: u16,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub password: Option<Vec<u8>>,
    /// Will message the broker publishes if this client vanishes.
    #[serde(default)]
    pub will: Option<Message>,
    /// Candidate endpoints tried in order; overrides the constructor URI
    /// when non-empty.
    #[serde(default)]
    pub server_uris: Vec<String>,
    #[serde(default)]
    pub buffer: BufferOptions,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            clean_session: default_clean_session(),
            keep_alive_interval: default_keep_alive_interval(),
            connection_timeout: default_connection_timeout(),
            automatic_reconnect: false,
            max_reconnect_delay: default_max_reconnect_delay(),
            max_inflight: default_max_inflight(),
            user_name: None,
            password: None,
            will: None,
            server_uris: Vec::new(),
            buffer: BufferOptions::default(),
        }
    }
}

impl ConnectOptions {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_interval))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn reconnect_delay_cap(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay)
    }

    /// Will message carried in the CONNECT payload, if any.
    pub fn will(&self) -> Option<&Message> {
        self.will.as_ref()
    }
}

/// Policy for buffering publishes submitted while disconnected.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferOptions {
    #[serde(default)]
    pub enabled: bool,
    /// Maximum number of buffered publishes.
    #[serde(default = "default_buffer_size")]
    pub size: usize,
    /// Mirror buffered publishes into the persistence store (`b-<n>` keys).
    #[serde(default)]
    pub persist_buffer: bool,
    /// When full, evict the oldest entry instead of rejecting the new one.
    #[serde(default)]
    pub delete_oldest_on_full: bool,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            size: default_buffer_size(),
            persist_buffer: false,
            delete_oldest_on_full: false,
        }
    }
}

impl BufferOptions {
    /// Enabled buffer keeping `size` most recent publishes.
    pub fn enabled(size: usize, delete_oldest_on_full: bool) -> Self {
        Self {
            enabled: true,
            size,
            persist_buffer: false,
            delete_oldest_on_full,
        }
    }
}

/// Builder-style helpers for a will message.
pub fn will_message(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: Qos, retained: bool) -> Message {
    Message {
        topic: topic.into(),
        payload: payload.into(),
        qos,
        retained,
        duplicate: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_conventions() {
        let opts = ConnectOptions::default();
        assert!(opts.clean_session);
        assert_eq!(opts.keep_alive_interval, 60);
        assert_eq!(opts.connection_timeout, 30);
        assert_eq!(opts.max_inflight, 10);
        assert!(!opts.automatic_reconnect);
        assert_eq!(opts.reconnect_delay_cap(), Duration::from_secs(128));
        assert!(!opts.buffer.enabled);
        assert_eq!(opts.buffer.size, 5000);
    }

    #[test]
    fn deserializes_sparse_profile() {
        let opts: ConnectOptions = serde_json::from_str("{\"keep_alive_interval\": 15}").unwrap();
        assert_eq!(opts.keep_alive_interval, 15);
        assert!(opts.clean_session);
    }
}
