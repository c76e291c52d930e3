#![warn(clippy::all)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_arguments)]

//! Photon - asynchronous MQTT 3.1.1 client.
//!
//! The client turns user operations (connect, publish, subscribe,
//! unsubscribe, disconnect) into a correctly ordered stream of MQTT
//! control packets over a reconnect-capable transport, and routes inbound
//! messages back to the application honoring the QoS contracts.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - connect options and buffer policy
//! - `core::error` - stable reason codes and the client error type
//! - `core::time` - deterministic time seam
//!
//! ## Protocol
//! - `protocol` - MQTT 3.1.1 packet model and wire codec
//!
//! ## Persistence
//! - `persist` - pluggable key-value store for in-flight state
//!
//! ## Session
//! - `session` - lifecycle state machine
//! - `session::inflight` - id allocation, ack tracking, replay
//! - `session::dispatch` - wildcard matching and handler routing
//!
//! ## Networking
//! - `net::transport` - endpoint parsing, TCP and TLS connectors
//! - `net::comms` - sender/receiver loops and keepalive
//! - `net::reconnect` - backoff controller
//!
//! ## Client
//! - `client` - the `AsyncClient` surface and completion tokens
//!
//! # Example
//!
//! ```no_run
//! use photon::{AsyncClient, ConnectOptions, Qos};
//!
//! # async fn run() -> Result<(), photon::MqttError> {
//! let client = AsyncClient::new("tcp://localhost:1883", "thermostat-1")?;
//! client.connect(ConnectOptions::default())?.wait().await?;
//! client.subscribe(&[("house/+/temp", Qos::AtLeastOnce)])?.wait().await?;
//! client.publish("house/hall/temp", "21.5", Qos::AtLeastOnce, false)?
//!     .wait()
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod core;
pub mod net;
pub mod persist;
pub mod protocol;
pub mod session;

// Re-exports for the common surface
pub use client::token::{ActionListener, OperationKind, Token};
pub use client::{AsyncClient, ClientEvents};
pub use self::core::config::{BufferOptions, ConnectOptions};
pub use self::core::error::{MqttError, MqttResult, ReasonCode};
pub use self::core::time::{Clock, SystemClock};
pub use net::transport::{
    tls_config_from_ca_pem, BoxedStream, Connector, Endpoint, NetConnector, Scheme,
};
pub use persist::{MemoryPersistence, Persistence, PersistenceError};
pub use protocol::{Message, Qos};
pub use session::dispatch::{filter_matches, MessageHandler};
pub use session::SessionState;
