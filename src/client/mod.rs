//! The asynchronous client: user-facing operations returning completion
//! tokens, backed by the session state machine, the in-flight engine and
//! the connected-session I/O tasks.

pub mod token;

pub(crate) mod buffer;

use crate::client::buffer::DisconnectedBuffer;
use crate::client::token::{OperationKind, Token};
use crate::core::config::{BufferOptions, ConnectOptions};
use crate::core::error::{MqttError, MqttResult, ReasonCode};
use crate::core::time::{Clock, SystemClock};
use crate::net::comms::{self, CommsContext, CommsHandle, ConnectionObserver, Notification, PingAction};
use crate::net::reconnect::{self, ConnectionLostEvent, ReconnectTarget};
use crate::net::transport::{Connector, Endpoint, NetConnector};
use crate::persist::{self, MemoryPersistence, Persistence, SharedPersistence};
use crate::protocol::{Connect, Message, Qos};
use crate::session::dispatch::{self, DispatchTable, MessageHandler};
use crate::session::inflight::InflightEngine;
use crate::session::{SessionGuard, SessionState};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const QUIESCE_TIMEOUT: Duration = Duration::from_millis(30_000);
const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);
const CLIENT_ID_PREFIX: &str = "photon";
const MAX_CLIENT_ID_CHARS: usize = 65_535;

/// Global event callback. Handlers run on the dispatcher task, never on
/// the wire loops.
pub trait ClientEvents: Send + Sync {
    /// Fired exactly once per involuntary transition out of CONNECTED.
    fn connection_lost(&self, _error: &MqttError) {}
    /// Fired for inbound messages no per-filter handler claimed.
    fn message_arrived(&self, _message: &Message) {}
    /// Fired when a publish reaches its terminal ack.
    fn delivery_complete(&self, _token: &Token) {}
    /// Fired after every successful connect, with `reconnect` set for
    /// automatic and manual reconnects.
    fn connect_complete(&self, _reconnect: bool, _server_uri: &str) {}
}

type SharedEvents = Arc<Mutex<Option<Arc<dyn ClientEvents>>>>;

struct ClientCore<C: Clock> {
    self_ref: Weak<ClientCore<C>>,
    client_id: String,
    server_uri: String,
    clock: C,
    connector: Arc<dyn Connector>,
    store: SharedPersistence,
    session: SessionGuard,
    engine: Arc<InflightEngine>,
    dispatch: Arc<Mutex<DispatchTable>>,
    buffer: Mutex<DisconnectedBuffer>,
    options: Mutex<ConnectOptions>,
    endpoints: Mutex<Vec<Endpoint>>,
    current_endpoint: AtomicUsize,
    comms: Mutex<Option<CommsHandle>>,
    manual_acks: Arc<AtomicBool>,
    callback: SharedEvents,
    notifications: mpsc::UnboundedSender<Notification>,
    lost_events: mpsc::UnboundedSender<ConnectionLostEvent>,
}

/// Asynchronous MQTT 3.1.1 client.
///
/// Operations return a [`Token`] immediately; await the token for the
/// outcome. One client drives at most one connection at a time.
pub struct AsyncClient<C: Clock = SystemClock> {
    core: Arc<ClientCore<C>>,
    dispatcher: JoinHandle<()>,
    controller: JoinHandle<()>,
}

impl AsyncClient<SystemClock> {
    /// Client with in-memory persistence and the TCP/TLS connector.
    pub fn new(server_uri: &str, client_id: &str) -> MqttResult<Self> {
        Self::with_persistence(server_uri, client_id, Box::new(MemoryPersistence::new()))
    }

    /// Client with a caller-supplied persistence store, opened on
    /// `(client_id, server_uri)`.
    pub fn with_persistence(
        server_uri: &str,
        client_id: &str,
        persistence: Box<dyn Persistence>,
    ) -> MqttResult<Self> {
        Self::with_connector(
            server_uri,
            client_id,
            persistence,
            Arc::new(NetConnector::new()),
            SystemClock,
        )
    }
}

impl<C: Clock> AsyncClient<C> {
    /// Fully parameterized constructor: custom transport and clock.
    pub fn with_connector(
        server_uri: &str,
        client_id: &str,
        mut persistence: Box<dyn Persistence>,
        connector: Arc<dyn Connector>,
        clock: C,
    ) -> MqttResult<Self> {
        if client_id.chars().count() > MAX_CLIENT_ID_CHARS {
            return Err(MqttError::new(ReasonCode::InvalidClientId));
        }
        Endpoint::parse(server_uri)?;
        persistence
            .open(client_id, server_uri)
            .map_err(|err| MqttError::with_cause(ReasonCode::PersistenceFailure, err))?;
        let store = persist::shared(persistence);

        let (notifications, notification_rx) = mpsc::unbounded_channel();
        let (lost_events, lost_rx) = mpsc::unbounded_channel();
        let dispatch = Arc::new(Mutex::new(DispatchTable::new()));
        let callback: SharedEvents = Arc::new(Mutex::new(None));

        let core = Arc::new_cyclic(|self_ref| ClientCore {
            self_ref: self_ref.clone(),
            client_id: client_id.to_string(),
            server_uri: server_uri.to_string(),
            clock: clock.clone(),
            connector,
            store,
            session: SessionGuard::new(),
            engine: Arc::new(InflightEngine::new()),
            dispatch: dispatch.clone(),
            buffer: Mutex::new(DisconnectedBuffer::new(BufferOptions::default())),
            options: Mutex::new(ConnectOptions::default()),
            endpoints: Mutex::new(Vec::new()),
            current_endpoint: AtomicUsize::new(0),
            comms: Mutex::new(None),
            manual_acks: Arc::new(AtomicBool::new(false)),
            callback: callback.clone(),
            notifications,
            lost_events,
        });

        let dispatcher = tokio::spawn(dispatcher_loop(notification_rx, dispatch, callback));
        let controller = reconnect::spawn(clock, core.clone() as Arc<dyn ReconnectTarget>, lost_rx);

        Ok(Self {
            core,
            dispatcher,
            controller,
        })
    }

    /// Random client identifier, unique enough for broker-side state.
    pub fn generate_client_id() -> String {
        format!("{CLIENT_ID_PREFIX}-{}", Uuid::new_v4().simple())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start connecting with the given options. The returned token
    /// completes when the handshake (and session replay) finishes.
    pub fn connect(&self, options: ConnectOptions) -> MqttResult<Token> {
        self.core.session.begin_connect()?;

        let uris = if options.server_uris.is_empty() {
            vec![self.core.server_uri.clone()]
        } else {
            options.server_uris.clone()
        };
        let mut endpoints = Vec::with_capacity(uris.len());
        for uri in &uris {
            match Endpoint::parse(uri) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(err) => {
                    self.core.session.connect_failed();
                    return Err(err);
                }
            }
        }
        *self.core.endpoints.lock() = endpoints;
        self.core.engine.set_max_inflight(usize::from(options.max_inflight));
        if options.buffer.enabled && !self.core.buffer.lock().is_enabled() {
            self.set_buffer_opts(options.buffer.clone());
        }
        *self.core.options.lock() = options;

        let token = Token::new(OperationKind::Connect);
        let core = self.core.clone();
        let completion = token.clone();
        tokio::spawn(async move {
            match core.establish(false).await {
                Ok(session_present) => {
                    completion.set_session_present(session_present);
                    completion.complete();
                }
                Err(err) => {
                    core.session.connect_failed();
                    completion.fail(err);
                }
            }
        });
        Ok(token)
    }

    /// Manual reconnect with the options from the previous connect.
    pub fn reconnect(&self) -> MqttResult<Token> {
        self.core.session.begin_connect()?;
        let token = Token::new(OperationKind::Connect);
        let core = self.core.clone();
        let completion = token.clone();
        tokio::spawn(async move {
            match core.establish(true).await {
                Ok(session_present) => {
                    completion.set_session_present(session_present);
                    completion.complete();
                }
                Err(err) => {
                    core.session.connect_failed();
                    // Hand the failure to the backoff cycle when enabled.
                    if core.options.lock().automatic_reconnect {
                        let _ = core.lost_events.send(ConnectionLostEvent);
                    }
                    completion.fail(err);
                }
            }
        });
        Ok(token)
    }

    /// Graceful disconnect with the default 30 s quiesce window.
    pub fn disconnect(&self) -> MqttResult<Token> {
        self.disconnect_after(QUIESCE_TIMEOUT)
    }

    /// Graceful disconnect: stop accepting publishes, wait up to `quiesce`
    /// for in-flight work, send DISCONNECT, close the transport.
    pub fn disconnect_after(&self, quiesce: Duration) -> MqttResult<Token> {
        self.core.session.begin_disconnect()?;
        let token = Token::new(OperationKind::Disconnect);
        let core = self.core.clone();
        let completion = token.clone();
        tokio::spawn(async move {
            core.shutdown(quiesce, DISCONNECT_TIMEOUT, true).await;
            completion.complete();
        });
        Ok(token)
    }

    /// Disconnect with explicit quiesce and DISCONNECT-write deadlines.
    pub async fn disconnect_forcibly(
        &self,
        quiesce: Duration,
        disconnect_timeout: Duration,
        send_disconnect_packet: bool,
    ) -> MqttResult<()> {
        self.core.session.begin_disconnect()?;
        self.core
            .shutdown(quiesce, disconnect_timeout, send_disconnect_packet)
            .await;
        Ok(())
    }

    /// Release the client. Legal in DISCONNECTED; `force` tears down from
    /// any state.
    pub fn close(&self, force: bool) -> MqttResult<()> {
        self.core.session.close(force)?;
        if let Some(handle) = self.core.comms.lock().take() {
            handle.abort();
        }
        self.core.engine.on_connection_lost();
        if let Err(err) = self.core.store.lock().close() {
            warn!(error = %err, "persistence close failed");
        }
        self.dispatcher.abort();
        self.controller.abort();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Publish a message. While disconnected, the message is buffered when
    /// offline buffering is enabled; otherwise the call fails.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: Qos,
        retained: bool,
    ) -> MqttResult<Token> {
        self.publish_message(Message::new(topic, payload, qos, retained))
    }

    pub fn publish_message(&self, message: Message) -> MqttResult<Token> {
        dispatch::validate_topic(&message.topic)?;
        let token = Token::new(OperationKind::Publish);
        match self.core.session.state() {
            SessionState::Connected => {
                if let Err(err) = self.core.engine.send_publish(&self.core.store, message, &token) {
                    token.fail(err);
                }
            }
            SessionState::Closed => return Err(MqttError::new(ReasonCode::ClientClosed)),
            SessionState::Disconnecting => {
                return Err(MqttError::new(ReasonCode::ClientDisconnecting))
            }
            SessionState::Disconnected | SessionState::Connecting => {
                let mut buffer = self.core.buffer.lock();
                if !buffer.is_enabled() {
                    return Err(MqttError::new(ReasonCode::ClientNotConnected));
                }
                if let Err(err) = buffer.append(&self.core.store, message, &token) {
                    token.fail(err);
                }
            }
        }
        Ok(token)
    }

    /// Subscribe to filters without per-filter handlers. Any handlers an
    /// earlier subscribe registered for these filters are dropped.
    pub fn subscribe(&self, filters: &[(&str, Qos)]) -> MqttResult<Token> {
        let handlers = vec![None; filters.len()];
        self.subscribe_with_handlers(filters, handlers)
    }

    /// Subscribe with an optional handler per filter. The dispatch table is
    /// updated before the SUBSCRIBE is sent and unwound if it fails.
    pub fn subscribe_with_handlers(
        &self,
        filters: &[(&str, Qos)],
        handlers: Vec<Option<MessageHandler>>,
    ) -> MqttResult<Token> {
        if handlers.len() != filters.len() {
            return Err(MqttError::new(ReasonCode::InvalidTopic));
        }
        for (filter, _) in filters {
            dispatch::validate_filter(filter)?;
        }
        if !self.core.session.is_connected() {
            return Err(MqttError::new(ReasonCode::ClientNotConnected));
        }

        {
            let mut table = self.core.dispatch.lock();
            for ((filter, qos), handler) in filters.iter().zip(handlers) {
                table.insert(filter, *qos, handler);
            }
        }

        let token = Token::new(OperationKind::Subscribe);
        token.set_topics(filters.iter().map(|(f, _)| (*f).to_string()).collect());
        let request: Vec<(String, Qos)> = filters
            .iter()
            .map(|(filter, qos)| ((*filter).to_string(), *qos))
            .collect();
        if let Err(err) = self.core.engine.send_subscribe(request, &token) {
            let mut table = self.core.dispatch.lock();
            for (filter, _) in filters {
                table.remove(filter);
            }
            drop(table);
            token.fail(err);
        }
        Ok(token)
    }

    /// Unsubscribe. Handlers are removed immediately, before the
    /// UNSUBSCRIBE is sent.
    pub fn unsubscribe(&self, filters: &[&str]) -> MqttResult<Token> {
        for filter in filters {
            dispatch::validate_filter(filter)?;
        }
        if !self.core.session.is_connected() {
            return Err(MqttError::new(ReasonCode::ClientNotConnected));
        }
        {
            let mut table = self.core.dispatch.lock();
            for filter in filters {
                table.remove(filter);
            }
        }
        let token = Token::new(OperationKind::Unsubscribe);
        token.set_topics(filters.iter().map(|f| (*f).to_string()).collect());
        let request: Vec<String> = filters.iter().map(|f| (*f).to_string()).collect();
        if let Err(err) = self.core.engine.send_unsubscribe(request, &token) {
            token.fail(err);
        }
        Ok(token)
    }

    // -----------------------------------------------------------------------
    // Callbacks & acknowledgement control
    // -----------------------------------------------------------------------

    pub fn set_callback(&self, callback: Arc<dyn ClientEvents>) {
        *self.core.callback.lock() = Some(callback);
    }

    /// When enabled, inbound QoS 1/2 messages are not acknowledged until
    /// [`AsyncClient::message_arrived_complete`] is called.
    pub fn set_manual_acks(&self, manual: bool) {
        self.core.manual_acks.store(manual, Ordering::SeqCst);
    }

    pub fn message_arrived_complete(&self, message_id: u16, qos: Qos) -> MqttResult<()> {
        self.core
            .engine
            .message_arrived_complete(&self.core.store, message_id, qos)
    }

    /// Host-driven keepalive step for platforms without internal timers.
    pub fn check_ping(&self) -> MqttResult<()> {
        let action = {
            let guard = self.core.comms.lock();
            let handle = guard
                .as_ref()
                .ok_or_else(|| MqttError::new(ReasonCode::ClientNotConnected))?;
            handle.check_ping(self.core.clock.now(), &self.core.engine)
        };
        if matches!(action, PingAction::Timeout) {
            let error = MqttError::new(ReasonCode::ClientTimeout);
            self.core.connection_lost(error.clone(), true);
            return Err(error);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Offline buffer
    // -----------------------------------------------------------------------

    /// Install (or replace) the disconnected-publish buffer, reloading any
    /// persisted entries.
    pub fn set_buffer_opts(&self, options: BufferOptions) {
        let mut buffer = DisconnectedBuffer::new(options);
        buffer.restore(&self.core.store);
        *self.core.buffer.lock() = buffer;
    }

    pub fn buffered_message_count(&self) -> usize {
        self.core.buffer.lock().len()
    }

    pub fn buffered_message(&self, index: usize) -> Option<Message> {
        self.core.buffer.lock().message_at(index)
    }

    pub fn delete_buffered_message(&self, index: usize) -> bool {
        self.core.buffer.lock().delete_at(&self.core.store, index)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.core.session.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.core.session.is_connecting()
    }

    /// True while a lost connection is waiting on the automatic reconnect
    /// cycle; in-flight state is preserved in the meantime.
    pub fn is_resting(&self) -> bool {
        self.core.session.is_resting()
    }

    pub fn client_id(&self) -> &str {
        &self.core.client_id
    }

    pub fn server_uri(&self) -> &str {
        &self.core.server_uri
    }

    /// URI of the endpoint the current (or last) connection used.
    pub fn current_server_uri(&self) -> Option<String> {
        let endpoints = self.core.endpoints.lock();
        endpoints
            .get(self.core.current_endpoint.load(Ordering::SeqCst))
            .map(|endpoint| endpoint.uri().to_string())
    }

    pub fn in_flight_message_count(&self) -> usize {
        self.core.engine.in_flight_count()
    }

    /// Tokens for publishes that have not reached a terminal ack.
    pub fn pending_delivery_tokens(&self) -> Vec<Token> {
        self.core.engine.pending_delivery_tokens()
    }

    /// Discard a queued publish that has not reached the wire.
    pub fn remove_message(&self, token: &Token) -> bool {
        let id = token.message_id();
        id != 0 && self.core.engine.remove_unsent(&self.core.store, id)
    }
}

impl<C: Clock> Drop for AsyncClient<C> {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.controller.abort();
        if let Some(handle) = self.core.comms.lock().take() {
            handle.abort();
        }
    }
}

impl<C: Clock> ClientCore<C> {
    /// Handshake, session restore, comms start, replay, buffer drain.
    /// Returns the broker's session-present flag.
    async fn establish(&self, reconnect: bool) -> MqttResult<bool> {
        let options = self.options.lock().clone();
        let endpoints = self.endpoints.lock().clone();
        let connect = Connect {
            client_id: self.client_id.clone(),
            clean_session: options.clean_session,
            keep_alive: options.keep_alive_interval,
            will: options.will.clone(),
            user_name: options.user_name.clone(),
            password: options.password.clone(),
        };
        let outcome = crate::net::handshake::run(
            self.connector.as_ref(),
            &endpoints,
            &connect,
            options.connect_timeout(),
        )
        .await?;
        self.current_endpoint
            .store(outcome.endpoint_index, Ordering::SeqCst);
        let server_uri = endpoints[outcome.endpoint_index].uri().to_string();
        info!(
            uri = %server_uri,
            session_present = outcome.connack.session_present,
            reconnect,
            "connected"
        );

        if options.clean_session {
            self.engine
                .clear_session(&self.store, ReasonCode::ConnectionLost);
        } else {
            self.engine.restore(&self.store)?;
        }

        let handle = comms::start(
            outcome.stream,
            CommsContext {
                engine: self.engine.clone(),
                store: self.store.clone(),
                dispatch: self.dispatch.clone(),
                notifications: self.notifications.clone(),
                observer: self.observer()?,
                manual_acks: self.manual_acks.clone(),
            },
            self.clock.clone(),
            options.keep_alive(),
        );
        *self.comms.lock() = Some(handle);

        if !options.clean_session {
            self.engine.replay(&self.store)?;
        }
        let drained = self.buffer.lock().drain(&self.store);
        for (message, token) in drained {
            if let Err(err) = self.engine.send_publish(&self.store, message, &token) {
                token.fail(err);
            }
        }

        // The receiver may have lost the transport while we were replaying;
        // in that case the comms slot is already empty and this connect
        // attempt has failed.
        if self.comms.lock().is_none() {
            return Err(MqttError::new(ReasonCode::ConnectionLost));
        }
        self.session.connected();
        let _ = self.notifications.send(Notification::ConnectComplete {
            reconnect,
            server_uri,
        });
        Ok(outcome.connack.session_present)
    }

    async fn shutdown(&self, quiesce: Duration, disconnect_timeout: Duration, send_packet: bool) {
        if tokio::time::timeout(quiesce, self.engine.wait_quiesced())
            .await
            .is_err()
        {
            debug!("quiesce window elapsed with work still in flight");
        }
        if send_packet {
            let written = Arc::new(Notify::new());
            self.engine.enqueue_disconnect(written.clone());
            if tokio::time::timeout(disconnect_timeout, written.notified())
                .await
                .is_err()
            {
                warn!("DISCONNECT was not written within {:?}", disconnect_timeout);
            }
        }
        if let Some(handle) = self.comms.lock().take() {
            handle.abort();
        }
        self.engine.on_connection_lost();
        self.session.disconnected(false);
    }

    fn observer(&self) -> MqttResult<Arc<dyn ConnectionObserver>> {
        self.self_ref
            .upgrade()
            .map(|core| core as Arc<dyn ConnectionObserver>)
            .ok_or_else(|| MqttError::new(ReasonCode::ClientClosed))
    }
}

impl<C: Clock> ConnectionObserver for ClientCore<C> {
    fn connection_lost(&self, error: MqttError, reconnectable: bool) {
        // First reporter wins; everyone else finds the slot empty.
        let Some(handle) = self.comms.lock().take() else {
            return;
        };
        handle.abort();

        let was_connected = self.session.is_connected();
        let automatic =
            was_connected && reconnectable && self.options.lock().automatic_reconnect;
        self.session.disconnected(automatic);

        let failed = self.engine.on_connection_lost();
        {
            // Optimistically-registered filters from unfinished subscribes
            // fall back to "no handler".
            let mut table = self.dispatch.lock();
            for token in &failed {
                if token.kind() == OperationKind::Subscribe {
                    for filter in token.topics() {
                        table.remove(&filter);
                    }
                }
            }
        }

        if was_connected {
            warn!(error = %error, "connection lost");
            let _ = self
                .notifications
                .send(Notification::ConnectionLost(error));
        }
        if automatic {
            let _ = self.lost_events.send(ConnectionLostEvent);
        }
    }
}

impl<C: Clock> ReconnectTarget for ClientCore<C> {
    fn automatic_reconnect(&self) -> bool {
        self.options.lock().automatic_reconnect && !self.session.is_closed()
    }

    fn max_reconnect_delay(&self) -> Duration {
        self.options.lock().reconnect_delay_cap()
    }

    fn reconnect(&self) -> Pin<Box<dyn Future<Output = MqttResult<()>> + Send + '_>> {
        Box::pin(async move {
            let core = self
                .self_ref
                .upgrade()
                .ok_or_else(|| MqttError::new(ReasonCode::ClientClosed))?;
            match core.session.begin_connect() {
                Ok(()) => {}
                // Someone else already connected; the cycle is done.
                Err(err) if err.reason_code() == ReasonCode::ClientConnected => return Ok(()),
                Err(err) => return Err(err),
            }
            match core.establish(true).await {
                Ok(_) => Ok(()),
                Err(err) => {
                    core.session.connect_failed();
                    Err(err)
                }
            }
        })
    }
}

async fn dispatcher_loop(
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    dispatch: Arc<Mutex<DispatchTable>>,
    callback: SharedEvents,
) {
    while let Some(notification) = notifications.recv().await {
        let events = callback.lock().clone();
        match notification {
            Notification::MessageArrived(message) => {
                let handlers = dispatch.lock().matching_handlers(&message.topic);
                if handlers.is_empty() {
                    if let Some(events) = &events {
                        events.message_arrived(&message);
                    }
                } else {
                    for handler in handlers {
                        handler(&message);
                    }
                }
            }
            Notification::DeliveryComplete(token) => {
                if let Some(events) = &events {
                    events.delivery_complete(&token);
                }
            }
            Notification::ConnectionLost(error) => {
                if let Some(events) = &events {
                    events.connection_lost(&error);
                }
            }
            Notification::ConnectComplete {
                reconnect,
                server_uri,
            } => {
                if let Some(events) = &events {
                    events.connect_complete(reconnect, &server_uri);
                }
            }
        }
    }
}
