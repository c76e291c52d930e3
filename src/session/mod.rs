//! Session lifecycle: the five-state machine every user operation is
//! checked against.

pub mod dispatch;
pub(crate) mod inflight;

use crate::core::error::{MqttError, MqttResult, ReasonCode};
use parking_lot::Mutex;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

struct Lifecycle {
    state: SessionState,
    /// Connection lost with reconnect pending; tables and persisted
    /// records are preserved while no I/O tasks run.
    resting: bool,
}

/// Serializes state transitions and the API prechecks that read them.
pub(crate) struct SessionGuard {
    lifecycle: Mutex<Lifecycle>,
}

impl SessionGuard {
    pub fn new() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Disconnected,
                resting: false,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == SessionState::Connecting
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn is_resting(&self) -> bool {
        self.lifecycle.lock().resting
    }

    /// DISCONNECTED -> CONNECTING, or the reason the connect is illegal.
    pub fn begin_connect(&self) -> MqttResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            SessionState::Disconnected => {
                lifecycle.state = SessionState::Connecting;
                Ok(())
            }
            SessionState::Connected => Err(MqttError::new(ReasonCode::ClientConnected)),
            SessionState::Connecting => Err(MqttError::new(ReasonCode::ConnectInProgress)),
            SessionState::Disconnecting => Err(MqttError::new(ReasonCode::ClientDisconnecting)),
            SessionState::Closed => Err(MqttError::new(ReasonCode::ClientClosed)),
        }
    }

    /// CONNECTING -> CONNECTED after a successful handshake.
    pub fn connected(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = SessionState::Connected;
        lifecycle.resting = false;
    }

    /// CONNECTING -> DISCONNECTED after every candidate endpoint failed.
    pub fn connect_failed(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == SessionState::Connecting {
            lifecycle.state = SessionState::Disconnected;
        }
    }

    /// CONNECTED -> DISCONNECTING on user disconnect.
    pub fn begin_disconnect(&self) -> MqttResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            SessionState::Connected => {
                lifecycle.state = SessionState::Disconnecting;
                Ok(())
            }
            SessionState::Disconnecting => Err(MqttError::new(ReasonCode::ClientDisconnecting)),
            SessionState::Closed => Err(MqttError::new(ReasonCode::ClientClosed)),
            _ => Err(MqttError::new(ReasonCode::ClientNotConnected)),
        }
    }

    /// Any -> DISCONNECTED, optionally entering the resting state.
    pub fn disconnected(&self, resting: bool) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != SessionState::Closed {
            lifecycle.state = SessionState::Disconnected;
            lifecycle.resting = resting;
        }
    }

    /// DISCONNECTED -> CLOSED; `force` closes from any state.
    pub fn close(&self, force: bool) -> MqttResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            SessionState::Closed => Ok(()),
            SessionState::Disconnected => {
                lifecycle.state = SessionState::Closed;
                Ok(())
            }
            _ if force => {
                lifecycle.state = SessionState::Closed;
                Ok(())
            }
            SessionState::Connected => Err(MqttError::new(ReasonCode::ClientConnected)),
            SessionState::Connecting => Err(MqttError::new(ReasonCode::ConnectInProgress)),
            SessionState::Disconnecting => Err(MqttError::new(ReasonCode::ClientDisconnecting)),
        }
    }
}
