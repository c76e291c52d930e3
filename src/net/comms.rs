//! Connected-session I/O: the sender and receiver loops sharing one duplex
//! transport, plus the keepalive scheduler.
//!
//! Exactly one of the loops wins the race to report a lost connection; the
//! observer tears the others down.

use crate::client::token::Token;
use crate::core::error::{MqttError, ReasonCode};
use crate::core::time::Clock;
use crate::net::transport::BoxedStream;
use crate::persist::SharedPersistence;
use crate::protocol::{self, Message, Packet};
use crate::session::dispatch::DispatchTable;
use crate::session::inflight::{InboundOutcome, InflightEngine, PostWrite};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Callback work routed off the receiver so application code never blocks
/// the wire.
pub(crate) enum Notification {
    MessageArrived(Message),
    DeliveryComplete(Token),
    ConnectionLost(MqttError),
    ConnectComplete { reconnect: bool, server_uri: String },
}

/// Sink for the first connection-loss report of a session.
pub(crate) trait ConnectionObserver: Send + Sync + 'static {
    /// `reconnectable` is false for fatal conditions (protocol violations,
    /// persistence corruption) that automatic reconnect must not retry.
    fn connection_lost(&self, error: MqttError, reconnectable: bool);
}

// ---------------------------------------------------------------------------
// Keepalive bookkeeping
// ---------------------------------------------------------------------------

pub(crate) enum PingAction {
    None,
    SendPing,
    Timeout,
}

struct ActivityState {
    last_write: Instant,
    ping_outstanding: bool,
    ping_sent_at: Instant,
}

/// Tracks sender activity and the PINGREQ response window.
pub(crate) struct ActivityTracker {
    state: Mutex<ActivityState>,
}

impl ActivityTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            state: Mutex::new(ActivityState {
                last_write: now,
                ping_outstanding: false,
                ping_sent_at: now,
            }),
        }
    }

    /// Any wire write resets the idle clock.
    pub fn record_write(&self, now: Instant) {
        self.state.lock().last_write = now;
    }

    /// PINGREQ hit the wire; the response window opens now.
    pub fn ping_sent(&self, now: Instant) {
        let mut state = self.state.lock();
        state.ping_outstanding = true;
        state.ping_sent_at = now;
    }

    /// PINGRESP arrived. Late responses are treated as activity only.
    pub fn pong(&self) {
        self.state.lock().ping_outstanding = false;
    }

    /// One keepalive scheduling step.
    pub fn check(&self, now: Instant, keep_alive: Duration) -> PingAction {
        let mut state = self.state.lock();
        if state.ping_outstanding {
            if now.saturating_duration_since(state.ping_sent_at) >= keep_alive {
                return PingAction::Timeout;
            }
            return PingAction::None;
        }
        if now.saturating_duration_since(state.last_write) >= keep_alive {
            // Claim the slot so back-to-back checks queue a single ping.
            state.ping_outstanding = true;
            state.ping_sent_at = now;
            return PingAction::SendPing;
        }
        PingAction::None
    }

    /// Time until the next check is worthwhile.
    pub fn next_deadline(&self, now: Instant, keep_alive: Duration) -> Duration {
        let state = self.state.lock();
        let reference = if state.ping_outstanding {
            state.ping_sent_at
        } else {
            state.last_write
        };
        keep_alive
            .checked_sub(now.saturating_duration_since(reference))
            .unwrap_or_default()
            .max(Duration::from_millis(10))
    }
}

// ---------------------------------------------------------------------------
// Session tasks
// ---------------------------------------------------------------------------

/// Handles for one connected session's tasks.
pub(crate) struct CommsHandle {
    tasks: Vec<JoinHandle<()>>,
    activity: Arc<ActivityTracker>,
    keep_alive: Duration,
}

impl CommsHandle {
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Externally-driven keepalive step, for hosts that schedule pings
    /// themselves instead of relying on the internal timer.
    pub fn check_ping(&self, now: Instant, engine: &InflightEngine) -> PingAction {
        if self.keep_alive.is_zero() {
            return PingAction::None;
        }
        let action = self.activity.check(now, self.keep_alive);
        if matches!(action, PingAction::SendPing) {
            engine.enqueue_ping();
        }
        action
    }
}

pub(crate) struct CommsContext {
    pub engine: Arc<InflightEngine>,
    pub store: SharedPersistence,
    pub dispatch: Arc<Mutex<DispatchTable>>,
    pub notifications: mpsc::UnboundedSender<Notification>,
    pub observer: Arc<dyn ConnectionObserver>,
    pub manual_acks: Arc<AtomicBool>,
}

/// Split the transport and start the sender, receiver and (when keepalive
/// is configured) the ping scheduler.
pub(crate) fn start<C: Clock>(
    stream: BoxedStream,
    context: CommsContext,
    clock: C,
    keep_alive: Duration,
) -> CommsHandle {
    let (reader, writer) = tokio::io::split(stream);
    let activity = Arc::new(ActivityTracker::new(clock.now()));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(sender_loop(
        writer,
        context.engine.clone(),
        activity.clone(),
        context.notifications.clone(),
        context.observer.clone(),
        clock.clone(),
    )));
    if !keep_alive.is_zero() {
        tasks.push(tokio::spawn(keepalive_loop(
            clock,
            keep_alive,
            activity.clone(),
            context.engine.clone(),
            context.observer.clone(),
        )));
    }
    tasks.push(tokio::spawn(receiver_loop(reader, context, activity.clone())));

    CommsHandle {
        tasks,
        activity,
        keep_alive,
    }
}

async fn sender_loop<C: Clock>(
    mut writer: WriteHalf<BoxedStream>,
    engine: Arc<InflightEngine>,
    activity: Arc<ActivityTracker>,
    notifications: mpsc::UnboundedSender<Notification>,
    observer: Arc<dyn ConnectionObserver>,
    clock: C,
) {
    loop {
        let item = engine.next().await;
        let write = async {
            writer.write_all(&item.frame).await?;
            writer.flush().await
        };
        if let Err(err) = write.await {
            debug!(error = %err, "sender write failed");
            if let PostWrite::Signal(notify) = &item.post {
                notify.notify_one();
            }
            observer.connection_lost(
                MqttError::with_cause(ReasonCode::ConnectionLost, err),
                true,
            );
            return;
        }
        activity.record_write(clock.now());
        match item.post {
            PostWrite::None => {}
            PostWrite::CompleteToken(token) => {
                token.complete();
                let _ = notifications.send(Notification::DeliveryComplete(token));
            }
            PostWrite::MarkSent(id) => engine.mark_sent(id),
            PostWrite::PingSent => activity.ping_sent(clock.now()),
            PostWrite::Signal(notify) => notify.notify_one(),
        }
    }
}

async fn receiver_loop(
    mut reader: ReadHalf<BoxedStream>,
    context: CommsContext,
    activity: Arc<ActivityTracker>,
) {
    loop {
        let packet = match protocol::read_packet(&mut reader).await {
            Ok(packet) => packet,
            Err(err) => {
                let (reason, reconnectable) = if err.downcast_ref::<std::io::Error>().is_some() {
                    (ReasonCode::ConnectionLost, true)
                } else {
                    (ReasonCode::ProtocolError, false)
                };
                context.observer.connection_lost(
                    MqttError::with_cause(reason, ReceiveFailure(err.to_string())),
                    reconnectable,
                );
                return;
            }
        };
        if let Packet::PingResp = packet {
            activity.pong();
            continue;
        }
        if let Err(error) = handle_packet(&context, packet) {
            let reconnectable = error.reason_code() == ReasonCode::ConnectionLost;
            context.observer.connection_lost(error, reconnectable);
            return;
        }
    }
}

fn handle_packet(context: &CommsContext, packet: Packet) -> Result<(), MqttError> {
    match packet {
        Packet::Publish(publish) => {
            let manual = context.manual_acks.load(Ordering::SeqCst);
            match context
                .engine
                .handle_inbound_publish(&context.store, publish, manual)?
            {
                InboundOutcome::Deliver(message) => {
                    let _ = context
                        .notifications
                        .send(Notification::MessageArrived(message));
                }
                InboundOutcome::Ignore => {}
            }
            Ok(())
        }
        Packet::PubAck(id) => {
            if let Some(token) = context.engine.handle_puback(&context.store, id) {
                token.complete();
                let _ = context
                    .notifications
                    .send(Notification::DeliveryComplete(token));
            }
            Ok(())
        }
        Packet::PubRec(id) => {
            context.engine.handle_pubrec(&context.store, id);
            Ok(())
        }
        Packet::PubRel(id) => {
            context.engine.handle_pubrel(&context.store, id);
            Ok(())
        }
        Packet::PubComp(id) => {
            if let Some(token) = context.engine.handle_pubcomp(&context.store, id) {
                token.complete();
                let _ = context
                    .notifications
                    .send(Notification::DeliveryComplete(token));
            }
            Ok(())
        }
        Packet::SubAck { message_id, granted } => {
            if let Some(token) = context.engine.handle_suback(message_id) {
                token.set_granted_qos(granted.clone());
                if granted.contains(&0x80) {
                    // Fail-open: drop the handlers this subscribe installed;
                    // earlier registrations are not restored.
                    let mut table = context.dispatch.lock();
                    for filter in token.topics() {
                        table.remove(&filter);
                    }
                    drop(table);
                    token.fail(MqttError::new(ReasonCode::SubscribeFailed));
                } else {
                    token.complete();
                }
            } else {
                warn!(message_id, "SUBACK for unknown operation");
            }
            Ok(())
        }
        Packet::UnsubAck { message_id } => {
            if let Some(token) = context.engine.handle_unsuback(message_id) {
                token.complete();
            }
            Ok(())
        }
        Packet::PingResp => Ok(()),
        other => Err(MqttError::with_cause(
            ReasonCode::ProtocolError,
            ReceiveFailure(format!("unexpected {other:?} from broker")),
        )),
    }
}

async fn keepalive_loop<C: Clock>(
    clock: C,
    keep_alive: Duration,
    activity: Arc<ActivityTracker>,
    engine: Arc<InflightEngine>,
    observer: Arc<dyn ConnectionObserver>,
) {
    loop {
        let delay = activity.next_deadline(clock.now(), keep_alive);
        clock.sleep(delay).await;
        match activity.check(clock.now(), keep_alive) {
            PingAction::None => {}
            PingAction::SendPing => {
                debug!("keepalive interval reached, queueing PINGREQ");
                engine.enqueue_ping();
            }
            PingAction::Timeout => {
                observer.connection_lost(MqttError::new(ReasonCode::ClientTimeout), true);
                return;
            }
        }
    }
}

#[derive(Debug)]
struct ReceiveFailure(String);

impl std::fmt::Display for ReceiveFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ReceiveFailure {}
