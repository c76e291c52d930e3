use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Stable failure identities surfaced through tokens and API results.
///
/// The numeric values are part of the public contract and never change
/// between releases; applications match on them across language bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ReasonCode {
    /// Broker rejected the CONNECT: unacceptable protocol version.
    InvalidProtocolVersion,
    /// Broker rejected the CONNECT: client identifier not allowed.
    InvalidClientId,
    /// Broker rejected the CONNECT: service unavailable.
    BrokerUnavailable,
    /// Broker rejected the CONNECT: bad user name or password.
    FailedAuthentication,
    /// Broker rejected the CONNECT: not authorized.
    NotAuthorized,
    /// SUBACK carried a 0x80 failure grant for at least one filter.
    SubscribeFailed,
    /// No response from the broker within the expected window.
    ClientTimeout,
    /// All 65535 message ids are assigned to outstanding messages.
    NoMessageIdsAvailable,
    /// A wire write did not complete within its allowed time.
    WriteTimeout,
    /// The client is already connected.
    ClientConnected,
    /// The client is currently disconnecting.
    ClientDisconnecting,
    /// The transport could not be established on any candidate endpoint.
    ServerConnectError,
    /// The operation requires a connected client.
    ClientNotConnected,
    /// Topic name or filter violates the MQTT grammar.
    InvalidTopic,
    /// The broker sent a malformed or state-inconsistent packet.
    ProtocolError,
    /// The connection to the broker was lost.
    ConnectionLost,
    /// A connect attempt is already in progress.
    ConnectInProgress,
    /// The client has been closed and can no longer be used.
    ClientClosed,
    /// The persistence store rejected an operation.
    PersistenceFailure,
    /// The disconnected-publish buffer is full.
    DisconnectedBufferFull,
}

impl ReasonCode {
    /// Numeric identity of this code.
    pub fn code(self) -> u32 {
        match self {
            ReasonCode::InvalidProtocolVersion => 1,
            ReasonCode::InvalidClientId => 2,
            ReasonCode::BrokerUnavailable => 3,
            ReasonCode::FailedAuthentication => 4,
            ReasonCode::NotAuthorized => 5,
            ReasonCode::SubscribeFailed => 128,
            ReasonCode::ClientTimeout => 32000,
            ReasonCode::NoMessageIdsAvailable => 32001,
            ReasonCode::WriteTimeout => 32002,
            ReasonCode::ClientConnected => 32100,
            ReasonCode::ClientDisconnecting => 32102,
            ReasonCode::ServerConnectError => 32103,
            ReasonCode::ClientNotConnected => 32104,
            ReasonCode::InvalidTopic => 32105,
            ReasonCode::ProtocolError => 32108,
            ReasonCode::ConnectionLost => 32109,
            ReasonCode::ConnectInProgress => 32110,
            ReasonCode::ClientClosed => 32111,
            ReasonCode::PersistenceFailure => 32200,
            ReasonCode::DisconnectedBufferFull => 32203,
        }
    }

    fn message(self) -> &'static str {
        match self {
            ReasonCode::InvalidProtocolVersion => "unacceptable protocol version",
            ReasonCode::InvalidClientId => "client identifier rejected",
            ReasonCode::BrokerUnavailable => "broker unavailable",
            ReasonCode::FailedAuthentication => "bad user name or password",
            ReasonCode::NotAuthorized => "not authorized",
            ReasonCode::SubscribeFailed => "subscription not granted",
            ReasonCode::ClientTimeout => "timed out waiting for the broker",
            ReasonCode::NoMessageIdsAvailable => "no message ids available",
            ReasonCode::WriteTimeout => "wire write timed out",
            ReasonCode::ClientConnected => "client is already connected",
            ReasonCode::ClientDisconnecting => "client is disconnecting",
            ReasonCode::ServerConnectError => "unable to connect to server",
            ReasonCode::ClientNotConnected => "client is not connected",
            ReasonCode::InvalidTopic => "invalid topic name or filter",
            ReasonCode::ProtocolError => "protocol violation",
            ReasonCode::ConnectionLost => "connection lost",
            ReasonCode::ConnectInProgress => "connect already in progress",
            ReasonCode::ClientClosed => "client is closed",
            ReasonCode::PersistenceFailure => "persistence store failure",
            ReasonCode::DisconnectedBufferFull => "disconnected buffer is full",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// Error carried by failed tokens and returned from the client API.
///
/// Clones share the underlying cause, which lets a token hand the same
/// error to its awaiter and its action callback.
#[derive(Debug, Clone, Error)]
#[error("{code}")]
pub struct MqttError {
    code: ReasonCode,
    #[source]
    cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl MqttError {
    pub fn new(code: ReasonCode) -> Self {
        Self { code, cause: None }
    }

    pub fn with_cause<E>(code: ReasonCode, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            code,
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn reason_code(&self) -> ReasonCode {
        self.code
    }

    /// Numeric identity, stable across releases.
    pub fn code(&self) -> u32 {
        self.code.code()
    }
}

pub type MqttResult<T> = Result<T, MqttError>;
