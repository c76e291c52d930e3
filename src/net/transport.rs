//! Transport provider: endpoint parsing and byte-duplex stream creation.

use crate::core::error::{MqttError, MqttResult, ReasonCode};
use rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use std::fmt;
use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

pub const TCP_DEFAULT_PORT: u16 = 1883;
pub const SSL_DEFAULT_PORT: u16 = 8883;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Ssl,
}

/// A parsed candidate server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    uri: String,
}

impl Endpoint {
    /// Parse a `tcp://` or `ssl://` URI, applying the scheme's default
    /// port. Any other scheme (including `local://`) is rejected.
    pub fn parse(uri: &str) -> MqttResult<Self> {
        let (scheme, rest) = if let Some(rest) = uri.strip_prefix("tcp://") {
            (Scheme::Tcp, rest)
        } else if let Some(rest) = uri.strip_prefix("ssl://") {
            (Scheme::Ssl, rest)
        } else {
            return Err(MqttError::with_cause(
                ReasonCode::ServerConnectError,
                UnsupportedScheme(uri.to_string()),
            ));
        };
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(MqttError::with_cause(
                ReasonCode::ServerConnectError,
                UnsupportedScheme(uri.to_string()),
            ));
        }
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|err| {
                    MqttError::with_cause(ReasonCode::ServerConnectError, err)
                })?;
                (host.to_string(), port)
            }
            None => {
                let port = match scheme {
                    Scheme::Tcp => TCP_DEFAULT_PORT,
                    Scheme::Ssl => SSL_DEFAULT_PORT,
                };
                (rest.to_string(), port)
            }
        };
        Ok(Self {
            scheme,
            host,
            port,
            uri: uri.to_string(),
        })
    }

    /// The URI this endpoint was parsed from.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
struct UnsupportedScheme(String);

impl fmt::Display for UnsupportedScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported server URI {:?} (expected tcp:// or ssl://)", self.0)
    }
}

impl std::error::Error for UnsupportedScheme {}

/// Byte-duplex stream the sender and receiver halves are split from.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TransportStream for T {}

pub type BoxedStream = Box<dyn TransportStream>;

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = MqttResult<BoxedStream>> + Send + 'a>>;

/// Opens transport streams for candidate endpoints. Custom implementations
/// supply alternate transports (loopback pipes in tests, proxies, ...).
pub trait Connector: Send + Sync {
    fn open(&self, endpoint: &Endpoint, timeout: Duration) -> ConnectFuture<'_>;
}

/// Default connector: plain TCP for `tcp://`, rustls for `ssl://`.
///
/// TLS configuration is supplied by the caller; without one, `ssl://`
/// endpoints fail the connect attempt.
#[derive(Default)]
pub struct NetConnector {
    tls: Option<Arc<ClientConfig>>,
}

impl NetConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tls(tls: Arc<ClientConfig>) -> Self {
        Self { tls: Some(tls) }
    }
}

impl Connector for NetConnector {
    fn open(&self, endpoint: &Endpoint, timeout: Duration) -> ConnectFuture<'_> {
        let endpoint = endpoint.clone();
        let tls = self.tls.clone();
        Box::pin(async move {
            debug!(uri = endpoint.uri(), "opening transport");
            let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint.address()))
                .await
                .map_err(|_| MqttError::new(ReasonCode::ClientTimeout))?
                .map_err(|err| MqttError::with_cause(ReasonCode::ServerConnectError, err))?;
            let _ = stream.set_nodelay(true);
            match endpoint.scheme {
                Scheme::Tcp => Ok(Box::new(stream) as BoxedStream),
                Scheme::Ssl => {
                    let config = tls.ok_or_else(|| {
                        MqttError::with_cause(
                            ReasonCode::ServerConnectError,
                            MissingTlsConfig(endpoint.uri().to_string()),
                        )
                    })?;
                    let name = ServerName::try_from(endpoint.host.as_str())
                        .map_err(|err| MqttError::with_cause(ReasonCode::ServerConnectError, err))?;
                    let connector = TlsConnector::from(config);
                    let tls_stream =
                        tokio::time::timeout(timeout, connector.connect(name, stream))
                            .await
                            .map_err(|_| MqttError::new(ReasonCode::ClientTimeout))?
                            .map_err(|err| {
                                MqttError::with_cause(ReasonCode::ServerConnectError, err)
                            })?;
                    Ok(Box::new(tls_stream) as BoxedStream)
                }
            }
        })
    }
}

/// Build a client TLS configuration trusting the CAs in a PEM bundle.
/// Suitable for brokers with a private CA; richer setups construct their
/// own `ClientConfig` and pass it to [`NetConnector::with_tls`].
pub fn tls_config_from_ca_pem(ca_bundle: &Path) -> MqttResult<Arc<ClientConfig>> {
    let file = File::open(ca_bundle)
        .map_err(|err| MqttError::with_cause(ReasonCode::ServerConnectError, err))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|err| MqttError::with_cause(ReasonCode::ServerConnectError, err))?;
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(&Certificate(cert))
            .map_err(|err| MqttError::with_cause(ReasonCode::ServerConnectError, err))?;
    }
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct MissingTlsConfig(String);

impl fmt::Display for MissingTlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no TLS configuration supplied for {}", self.0)
    }
}

impl std::error::Error for MissingTlsConfig {}
