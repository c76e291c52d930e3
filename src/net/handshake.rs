//! Connect handshake: iterate candidate endpoints, send CONNECT, validate
//! the CONNACK.

use crate::core::error::{MqttError, MqttResult, ReasonCode};
use crate::net::transport::{BoxedStream, Connector, Endpoint};
use crate::protocol::{self, ConnAck, Connect, Packet};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// A connected, CONNACK-validated transport.
pub(crate) struct HandshakeOutcome {
    pub stream: BoxedStream,
    pub connack: ConnAck,
    /// Index of the winning endpoint in the candidate list.
    pub endpoint_index: usize,
}

impl std::fmt::Debug for HandshakeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeOutcome")
            .field("connack", &self.connack)
            .field("endpoint_index", &self.endpoint_index)
            .finish()
    }
}

/// Try each candidate in order. A transport failure or timeout moves on to
/// the next candidate; a broker rejection fails immediately with the
/// classified reason.
pub(crate) async fn run(
    connector: &dyn Connector,
    endpoints: &[Endpoint],
    connect: &Connect,
    timeout: Duration,
) -> MqttResult<HandshakeOutcome> {
    let mut last_error = MqttError::new(ReasonCode::ServerConnectError);
    for (endpoint_index, endpoint) in endpoints.iter().enumerate() {
        match attempt(connector, endpoint, connect, timeout).await {
            Ok((stream, connack)) => {
                if connack.return_code != 0 {
                    return Err(classify_return_code(connack.return_code));
                }
                debug!(uri = endpoint.uri(), "handshake accepted");
                return Ok(HandshakeOutcome {
                    stream,
                    connack,
                    endpoint_index,
                });
            }
            Err(err) => {
                warn!(uri = endpoint.uri(), error = %err, "handshake attempt failed");
                last_error = err;
            }
        }
    }
    Err(last_error)
}

async fn attempt(
    connector: &dyn Connector,
    endpoint: &Endpoint,
    connect: &Connect,
    timeout: Duration,
) -> MqttResult<(BoxedStream, ConnAck)> {
    let mut stream = connector.open(endpoint, timeout).await?;
    let frame = protocol::encode(&Packet::Connect(connect.clone()));
    stream
        .write_all(&frame)
        .await
        .map_err(|err| MqttError::with_cause(ReasonCode::ServerConnectError, err))?;
    stream
        .flush()
        .await
        .map_err(|err| MqttError::with_cause(ReasonCode::ServerConnectError, err))?;

    let packet = tokio::time::timeout(timeout, protocol::read_packet(&mut stream))
        .await
        .map_err(|_| MqttError::new(ReasonCode::ClientTimeout))?
        .map_err(|err| {
            MqttError::with_cause(ReasonCode::ServerConnectError, ProtocolFailure(err.to_string()))
        })?;
    match packet {
        Packet::ConnAck(connack) => Ok((stream, connack)),
        other => Err(MqttError::with_cause(
            ReasonCode::ProtocolError,
            ProtocolFailure(format!("expected CONNACK, got {other:?}")),
        )),
    }
}

/// Map a non-zero CONNACK return code onto its stable reason.
fn classify_return_code(code: u8) -> MqttError {
    let reason = match code {
        1 => ReasonCode::InvalidProtocolVersion,
        2 => ReasonCode::InvalidClientId,
        3 => ReasonCode::BrokerUnavailable,
        4 => ReasonCode::FailedAuthentication,
        5 => ReasonCode::NotAuthorized,
        _ => ReasonCode::ProtocolError,
    };
    MqttError::new(reason)
}

#[derive(Debug)]
struct ProtocolFailure(String);

impl std::fmt::Display for ProtocolFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ProtocolFailure {}
