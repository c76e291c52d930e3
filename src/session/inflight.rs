//! In-flight message engine: id allocation, pending-ack tables, the
//! outbound packet queue and reconnect replay.
//!
//! The engine sits between the user API and the sender/receiver loops.
//! Table state lives behind one mutex that is held only for table
//! operations; persistence is always called with that mutex released.

use crate::core::error::{MqttError, MqttResult, ReasonCode};
use crate::persist::{
    self, SharedPersistence, RECEIVED_PREFIX, SEND_CONFIRMED_PREFIX, SEND_PREFIX,
    SEND_RELEASE_PREFIX,
};
use crate::protocol::{self, Message, Packet, Publish, Qos};
use crate::client::token::Token;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

/// Allocates message ids from [1, 65535], tracking which are outstanding.
pub struct MessageIdAllocator {
    words: Box<[u64; 1024]>,
    cursor: u16,
    used: usize,
}

impl Default for MessageIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageIdAllocator {
    pub fn new() -> Self {
        Self {
            words: Box::new([0u64; 1024]),
            cursor: 1,
            used: 0,
        }
    }

    /// Next free id, scanning forward from the previous allocation and
    /// wrapping once.
    pub fn allocate(&mut self) -> MqttResult<u16> {
        if self.used >= u16::MAX as usize {
            return Err(MqttError::new(ReasonCode::NoMessageIdsAvailable));
        }
        loop {
            let id = self.cursor;
            self.cursor = if id == u16::MAX { 1 } else { id + 1 };
            if !self.in_use(id) {
                self.set(id, true);
                self.used += 1;
                return Ok(id);
            }
        }
    }

    /// Mark an id allocated out-of-band (restored from persistence).
    pub fn reserve(&mut self, id: u16) {
        if id != 0 && !self.in_use(id) {
            self.set(id, true);
            self.used += 1;
        }
    }

    pub fn release(&mut self, id: u16) {
        if id != 0 && self.in_use(id) {
            self.set(id, false);
            self.used -= 1;
        }
    }

    pub fn in_use(&self, id: u16) -> bool {
        self.words[usize::from(id) / 64] & (1u64 << (usize::from(id) % 64)) != 0
    }

    fn set(&mut self, id: u16, value: bool) {
        let mask = 1u64 << (usize::from(id) % 64);
        if value {
            self.words[usize::from(id) / 64] |= mask;
        } else {
            self.words[usize::from(id) / 64] &= !mask;
        }
    }

    /// Reset to a fresh allocator.
    pub fn clear(&mut self) {
        self.words.fill(0);
        self.cursor = 1;
        self.used = 0;
    }
}

/// Outbound delivery phase for a QoS 1/2 publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundPhase {
    /// Admitted to the queue, not yet on the wire.
    Queued,
    /// Written; awaiting PUBACK (QoS 1) or PUBREC (QoS 2).
    Sent,
    /// PUBREC received; PUBREL sent, awaiting PUBCOMP.
    PubRecReceived,
}

struct OutboundRecord {
    message: Message,
    token: Token,
    phase: OutboundPhase,
}

struct InboundRecord {
    /// PUBREL received from the broker.
    released: bool,
    /// Application finished with the message (always true unless manual
    /// acks are enabled).
    completed: bool,
}

/// Work handed to the sender loop: a complete frame plus what to do once
/// it is on the wire.
pub(crate) struct OutboundItem {
    pub frame: Vec<u8>,
    pub post: PostWrite,
}

pub(crate) enum PostWrite {
    None,
    /// QoS 0 publish: the token completes as soon as the write finishes.
    CompleteToken(Token),
    /// QoS 1/2 publish: move the record to the Sent phase.
    MarkSent(u16),
    /// PINGREQ written; the keepalive response window opens now.
    PingSent,
    /// DISCONNECT written; wake whoever is waiting to close the transport.
    Signal(Arc<Notify>),
}

/// What the receiver should do with an inbound PUBLISH.
pub(crate) enum InboundOutcome {
    Deliver(Message),
    /// Duplicate QoS 2 publish; the ack was re-sent but nothing is
    /// dispatched.
    Ignore,
}

struct EngineState {
    allocator: MessageIdAllocator,
    outbound: HashMap<u16, OutboundRecord>,
    pending_ops: HashMap<u16, Token>,
    inbound: HashMap<u16, InboundRecord>,
    ack_queue: VecDeque<OutboundItem>,
    data_queue: VecDeque<OutboundItem>,
    deferred: VecDeque<OutboundItem>,
    inflight: usize,
    max_inflight: usize,
}

impl EngineState {
    /// Admit deferred publishes freed up by a terminal ack.
    fn promote_deferred(&mut self) -> bool {
        let mut promoted = false;
        while self.inflight < self.max_inflight {
            match self.deferred.pop_front() {
                Some(item) => {
                    self.inflight += 1;
                    self.data_queue.push_back(item);
                    promoted = true;
                }
                None => break,
            }
        }
        promoted
    }

    fn quiesced(&self) -> bool {
        self.outbound.is_empty() && self.pending_ops.is_empty()
    }
}

/// Shared in-flight engine. One instance lives for the whole client and
/// survives reconnects; only the queues are rebuilt per connection.
pub(crate) struct InflightEngine {
    state: Mutex<EngineState>,
    readable: Notify,
    // watch instead of Notify: a drain completing between the quiesce
    // check and the await must not be lost.
    drained: watch::Sender<()>,
}

impl InflightEngine {
    pub fn new() -> Self {
        let (drained, _) = watch::channel(());
        Self {
            state: Mutex::new(EngineState {
                allocator: MessageIdAllocator::new(),
                outbound: HashMap::new(),
                pending_ops: HashMap::new(),
                inbound: HashMap::new(),
                ack_queue: VecDeque::new(),
                data_queue: VecDeque::new(),
                deferred: VecDeque::new(),
                inflight: 0,
                max_inflight: 10,
            }),
            readable: Notify::new(),
            drained,
        }
    }

    pub fn set_max_inflight(&self, max: usize) {
        let mut state = self.state.lock();
        state.max_inflight = max.max(1);
    }

    // -----------------------------------------------------------------------
    // Outbound path
    // -----------------------------------------------------------------------

    /// Queue a publish. QoS > 0 allocates an id and persists the frame
    /// before it can reach the wire.
    pub fn send_publish(
        &self,
        store: &SharedPersistence,
        message: Message,
        token: &Token,
    ) -> MqttResult<()> {
        token.set_topics(vec![message.topic.clone()]);
        token.set_message(message.clone());
        if message.qos == Qos::AtMostOnce {
            let frame = protocol::encode(&Packet::Publish(Publish {
                message,
                message_id: None,
            }));
            self.state.lock().data_queue.push_back(OutboundItem {
                frame,
                post: PostWrite::CompleteToken(token.clone()),
            });
            self.readable.notify_one();
            return Ok(());
        }

        let id = self.state.lock().allocator.allocate()?;
        token.set_message_id(id);
        let frame = protocol::encode(&Packet::Publish(Publish {
            message: message.clone(),
            message_id: Some(id),
        }));
        if let Err(err) = store.lock().put(&persist::send_key(id), &frame) {
            self.state.lock().allocator.release(id);
            return Err(MqttError::with_cause(ReasonCode::PersistenceFailure, err));
        }

        let mut state = self.state.lock();
        state.outbound.insert(
            id,
            OutboundRecord {
                message,
                token: token.clone(),
                phase: OutboundPhase::Queued,
            },
        );
        let item = OutboundItem {
            frame,
            post: PostWrite::MarkSent(id),
        };
        if state.inflight < state.max_inflight {
            state.inflight += 1;
            state.data_queue.push_back(item);
        } else {
            state.deferred.push_back(item);
        }
        drop(state);
        self.readable.notify_one();
        Ok(())
    }

    pub fn send_subscribe(&self, filters: Vec<(String, Qos)>, token: &Token) -> MqttResult<()> {
        let id = self.state.lock().allocator.allocate()?;
        token.set_message_id(id);
        let frame = protocol::encode(&Packet::Subscribe(protocol::Subscribe {
            message_id: id,
            filters,
        }));
        let mut state = self.state.lock();
        state.pending_ops.insert(id, token.clone());
        state.data_queue.push_back(OutboundItem {
            frame,
            post: PostWrite::None,
        });
        drop(state);
        self.readable.notify_one();
        Ok(())
    }

    pub fn send_unsubscribe(&self, filters: Vec<String>, token: &Token) -> MqttResult<()> {
        let id = self.state.lock().allocator.allocate()?;
        token.set_message_id(id);
        let frame = protocol::encode(&Packet::Unsubscribe(protocol::Unsubscribe {
            message_id: id,
            filters,
        }));
        let mut state = self.state.lock();
        state.pending_ops.insert(id, token.clone());
        state.data_queue.push_back(OutboundItem {
            frame,
            post: PostWrite::None,
        });
        drop(state);
        self.readable.notify_one();
        Ok(())
    }

    pub fn enqueue_ping(&self) {
        self.state.lock().ack_queue.push_back(OutboundItem {
            frame: protocol::encode(&Packet::PingReq),
            post: PostWrite::PingSent,
        });
        self.readable.notify_one();
    }

    pub fn enqueue_disconnect(&self, written: Arc<Notify>) {
        self.state.lock().data_queue.push_back(OutboundItem {
            frame: protocol::encode(&Packet::Disconnect),
            post: PostWrite::Signal(written),
        });
        self.readable.notify_one();
    }

    fn enqueue_ack(&self, packet: Packet) {
        self.state.lock().ack_queue.push_back(OutboundItem {
            frame: protocol::encode(&packet),
            post: PostWrite::None,
        });
        self.readable.notify_one();
    }

    /// Next packet for the sender. Acks and pings bypass the data FIFO.
    pub async fn next(&self) -> OutboundItem {
        loop {
            let notified = self.readable.notified();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.ack_queue.pop_front() {
                    return item;
                }
                if let Some(item) = state.data_queue.pop_front() {
                    return item;
                }
            }
            notified.await;
        }
    }

    /// Sender callback after a QoS 1/2 publish frame hit the wire.
    pub fn mark_sent(&self, id: u16) {
        let mut state = self.state.lock();
        if let Some(record) = state.outbound.get_mut(&id) {
            if record.phase == OutboundPhase::Queued {
                record.phase = OutboundPhase::Sent;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Outbound ack cycle
    // -----------------------------------------------------------------------

    /// PUBACK: terminal for QoS 1. Returns the completed token.
    pub fn handle_puback(&self, store: &SharedPersistence, id: u16) -> Option<Token> {
        if let Err(err) = store.lock().remove(&persist::send_key(id)) {
            warn!(id, error = %err, "failed to delete acked publish record");
        }
        self.finish_outbound(id)
    }

    /// PUBREC: move to the release phase and send PUBREL. The PUBREL is
    /// persisted first so it can be retransmitted after a reconnect.
    pub fn handle_pubrec(&self, store: &SharedPersistence, id: u16) {
        let known = {
            let mut state = self.state.lock();
            match state.outbound.get_mut(&id) {
                Some(record) => {
                    record.phase = OutboundPhase::PubRecReceived;
                    true
                }
                None => false,
            }
        };
        if !known {
            debug!(id, "PUBREC for unknown message id");
            return;
        }
        let pubrel = protocol::encode(&Packet::PubRel(id));
        {
            let mut store = store.lock();
            match store.get(&persist::send_key(id)) {
                Ok(Some(bytes)) => {
                    if let Err(err) = store.put(&persist::send_confirmed_key(id), &bytes) {
                        warn!(id, error = %err, "failed to re-key publish record");
                    }
                    let _ = store.remove(&persist::send_key(id));
                }
                // Duplicate PUBREC: the record has already been re-keyed.
                Ok(None) => {}
                Err(err) => warn!(id, error = %err, "failed to read publish record"),
            }
            if let Err(err) = store.put(&persist::send_release_key(id), &pubrel) {
                warn!(id, error = %err, "failed to persist PUBREL");
            }
        }
        self.enqueue_ack(Packet::PubRel(id));
    }

    /// PUBCOMP: terminal for QoS 2. Returns the completed token.
    pub fn handle_pubcomp(&self, store: &SharedPersistence, id: u16) -> Option<Token> {
        {
            let mut store = store.lock();
            let _ = store.remove(&persist::send_confirmed_key(id));
            let _ = store.remove(&persist::send_release_key(id));
        }
        self.finish_outbound(id)
    }

    fn finish_outbound(&self, id: u16) -> Option<Token> {
        let (token, promoted, quiesced) = {
            let mut state = self.state.lock();
            let record = state.outbound.remove(&id)?;
            state.allocator.release(id);
            state.inflight = state.inflight.saturating_sub(1);
            let promoted = state.promote_deferred();
            (record.token, promoted, state.quiesced())
        };
        if promoted {
            self.readable.notify_one();
        }
        if quiesced {
            self.drained.send_replace(());
        }
        Some(token)
    }

    pub fn handle_suback(&self, id: u16) -> Option<Token> {
        self.finish_op(id)
    }

    pub fn handle_unsuback(&self, id: u16) -> Option<Token> {
        self.finish_op(id)
    }

    fn finish_op(&self, id: u16) -> Option<Token> {
        let (token, quiesced) = {
            let mut state = self.state.lock();
            let token = state.pending_ops.remove(&id)?;
            state.allocator.release(id);
            (token, state.quiesced())
        };
        if quiesced {
            self.drained.send_replace(());
        }
        Some(token)
    }

    // -----------------------------------------------------------------------
    // Inbound path
    // -----------------------------------------------------------------------

    /// Handle an inbound PUBLISH, persisting and acking per its QoS.
    pub fn handle_inbound_publish(
        &self,
        store: &SharedPersistence,
        publish: Publish,
        manual_acks: bool,
    ) -> MqttResult<InboundOutcome> {
        let qos = publish.message.qos;
        match qos {
            Qos::AtMostOnce => Ok(InboundOutcome::Deliver(publish.message)),
            Qos::AtLeastOnce => {
                let id = publish
                    .message_id
                    .ok_or_else(|| MqttError::new(ReasonCode::ProtocolError))?;
                if !manual_acks {
                    self.enqueue_ack(Packet::PubAck(id));
                }
                Ok(InboundOutcome::Deliver(publish.message))
            }
            Qos::ExactlyOnce => {
                let id = publish
                    .message_id
                    .ok_or_else(|| MqttError::new(ReasonCode::ProtocolError))?;
                let duplicate = self.state.lock().inbound.contains_key(&id);
                if duplicate {
                    // Already recorded; ack again, dispatch nothing.
                    self.enqueue_ack(Packet::PubRec(id));
                    return Ok(InboundOutcome::Ignore);
                }
                let frame = protocol::encode(&Packet::Publish(publish.clone()));
                store
                    .lock()
                    .put(&persist::received_key(id), &frame)
                    .map_err(|err| MqttError::with_cause(ReasonCode::PersistenceFailure, err))?;
                self.state.lock().inbound.insert(
                    id,
                    InboundRecord {
                        released: false,
                        completed: !manual_acks,
                    },
                );
                self.enqueue_ack(Packet::PubRec(id));
                Ok(InboundOutcome::Deliver(publish.message))
            }
        }
    }

    /// PUBREL from the broker: release the inbound record and respond with
    /// PUBCOMP once the application side is done with the message.
    pub fn handle_pubrel(&self, store: &SharedPersistence, id: u16) {
        let respond = {
            let mut state = self.state.lock();
            let respond = match state.inbound.get_mut(&id) {
                Some(record) => {
                    record.released = true;
                    record.completed
                }
                // PUBREL retransmitted after we already completed the cycle.
                None => true,
            };
            if respond {
                state.inbound.remove(&id);
            }
            respond
        };
        if respond {
            if let Err(err) = store.lock().remove(&persist::received_key(id)) {
                warn!(id, error = %err, "failed to delete inbound record");
            }
            self.enqueue_ack(Packet::PubComp(id));
        }
    }

    /// Manual-ack completion from the application.
    pub fn message_arrived_complete(
        &self,
        store: &SharedPersistence,
        id: u16,
        qos: Qos,
    ) -> MqttResult<()> {
        match qos {
            Qos::AtMostOnce => Ok(()),
            Qos::AtLeastOnce => {
                self.enqueue_ack(Packet::PubAck(id));
                Ok(())
            }
            Qos::ExactlyOnce => {
                let respond = {
                    let mut state = self.state.lock();
                    let respond = match state.inbound.get_mut(&id) {
                        Some(record) => {
                            record.completed = true;
                            record.released
                        }
                        None => false,
                    };
                    if respond {
                        state.inbound.remove(&id);
                    }
                    respond
                };
                if respond {
                    if let Err(err) = store.lock().remove(&persist::received_key(id)) {
                        warn!(id, error = %err, "failed to delete inbound record");
                    }
                    self.enqueue_ack(Packet::PubComp(id));
                }
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Session restore, replay and teardown
    // -----------------------------------------------------------------------

    /// Rebuild tables from persisted records, for a durable session. Ids
    /// found in the store are reserved; records without a live token get an
    /// orphan token so delivery still completes internally.
    pub fn restore(&self, store: &SharedPersistence) -> MqttResult<()> {
        let keys = store.lock().keys();
        let mut state = self.state.lock();
        for key in keys {
            if let Some(id) = persist::key_message_id(&key, SEND_PREFIX)
                .or_else(|| persist::key_message_id(&key, SEND_CONFIRMED_PREFIX))
            {
                let phase = if key.starts_with(SEND_CONFIRMED_PREFIX) {
                    OutboundPhase::PubRecReceived
                } else {
                    OutboundPhase::Sent
                };
                state.allocator.reserve(id);
                let record = state.outbound.entry(id).or_insert_with(|| {
                    let token = Token::new(crate::client::token::OperationKind::Publish);
                    token.set_message_id(id);
                    OutboundRecord {
                        message: Message::new(String::new(), Vec::new(), Qos::AtLeastOnce, false),
                        token,
                        phase,
                    }
                });
                record.phase = phase;
            } else if let Some(id) = persist::key_message_id(&key, SEND_RELEASE_PREFIX) {
                state.allocator.reserve(id);
                let record = state.outbound.entry(id).or_insert_with(|| {
                    let token = Token::new(crate::client::token::OperationKind::Publish);
                    token.set_message_id(id);
                    OutboundRecord {
                        message: Message::new(String::new(), Vec::new(), Qos::ExactlyOnce, false),
                        token,
                        phase: OutboundPhase::PubRecReceived,
                    }
                });
                record.phase = OutboundPhase::PubRecReceived;
            } else if let Some(id) = persist::key_message_id(&key, RECEIVED_PREFIX) {
                // Already dispatched before the restart; never re-deliver.
                state.inbound.entry(id).or_insert(InboundRecord {
                    released: false,
                    completed: true,
                });
            } else if !key.starts_with(persist::BUFFERED_PREFIX) {
                return Err(MqttError::with_cause(
                    ReasonCode::PersistenceFailure,
                    crate::persist::PersistenceError::Corrupt(format!("unrecognized key {key}")),
                ));
            }
        }
        Ok(())
    }

    /// Queue retransmissions after a reconnect with a durable session:
    /// PUBRELs first, then un-confirmed publishes with the DUP flag, ahead
    /// of any new user traffic.
    pub fn replay(&self, store: &SharedPersistence) -> MqttResult<()> {
        let (mut release_ids, mut publish_ids) = {
            let state = self.state.lock();
            let mut release_ids: Vec<u16> = Vec::new();
            let mut publish_ids: Vec<u16> = Vec::new();
            for (id, record) in &state.outbound {
                match record.phase {
                    OutboundPhase::PubRecReceived => release_ids.push(*id),
                    OutboundPhase::Queued | OutboundPhase::Sent => publish_ids.push(*id),
                }
            }
            (release_ids, publish_ids)
        };
        release_ids.sort_unstable();
        publish_ids.sort_unstable();

        let mut items = Vec::new();
        for id in &release_ids {
            items.push(OutboundItem {
                frame: protocol::encode(&Packet::PubRel(*id)),
                post: PostWrite::None,
            });
        }
        for id in &publish_ids {
            let bytes = store
                .lock()
                .get(&persist::send_key(*id))
                .map_err(|err| MqttError::with_cause(ReasonCode::PersistenceFailure, err))?;
            let mut frame = bytes.ok_or_else(|| {
                MqttError::with_cause(
                    ReasonCode::PersistenceFailure,
                    crate::persist::PersistenceError::Corrupt(format!(
                        "missing record for in-flight id {id}"
                    )),
                )
            })?;
            protocol::mark_duplicate(&mut frame);
            items.push(OutboundItem {
                frame,
                post: PostWrite::MarkSent(*id),
            });
        }

        let mut state = self.state.lock();
        state.inflight = release_ids.len() + publish_ids.len();
        for item in items.into_iter().rev() {
            state.data_queue.push_front(item);
        }
        drop(state);
        self.readable.notify_one();
        Ok(())
    }

    /// Discard all session state: clean-session connect or close. Pending
    /// publish tokens fail with the given reason.
    pub fn clear_session(&self, store: &SharedPersistence, reason: ReasonCode) {
        let tokens: Vec<Token> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let tokens = state
                .outbound
                .drain()
                .map(|(_, record)| record.token)
                .chain(state.pending_ops.drain().map(|(_, token)| token))
                .collect();
            state.inbound.clear();
            state.allocator.clear();
            state.ack_queue.clear();
            state.data_queue.clear();
            state.deferred.clear();
            state.inflight = 0;
            tokens
        };
        {
            let mut store = store.lock();
            for key in store.keys() {
                if !key.starts_with(persist::BUFFERED_PREFIX) {
                    let _ = store.remove(&key);
                }
            }
        }
        for token in tokens {
            token.fail(MqttError::new(reason));
        }
        self.drained.send_replace(());
    }

    /// Tear down the wire queues after a lost connection, keeping pending
    /// publish records for replay. Non-replayable tokens (subscribes,
    /// unsubscribes, unwritten QoS 0 publishes) fail; the failed tokens are
    /// returned so the client can roll back optimistic dispatch entries.
    pub fn on_connection_lost(&self) -> Vec<Token> {
        let (failed, quiesced) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut failed: Vec<Token> = Vec::new();
            for queue in [&mut state.ack_queue, &mut state.data_queue, &mut state.deferred] {
                for item in queue.drain(..) {
                    match item.post {
                        PostWrite::CompleteToken(token) => failed.push(token),
                        PostWrite::Signal(notify) => notify.notify_one(),
                        _ => {}
                    }
                }
            }
            let ops: Vec<u16> = state.pending_ops.keys().copied().collect();
            for id in ops {
                if let Some(token) = state.pending_ops.remove(&id) {
                    state.allocator.release(id);
                    failed.push(token);
                }
            }
            state.inflight = 0;
            (failed, state.quiesced())
        };
        let error = MqttError::new(ReasonCode::ConnectionLost);
        for token in &failed {
            token.fail(error.clone());
        }
        if quiesced {
            self.drained.send_replace(());
        }
        failed
    }

    /// Wait until every ack-bearing operation reached a terminal state.
    pub async fn wait_quiesced(&self) {
        let mut drained = self.drained.subscribe();
        loop {
            if self.state.lock().quiesced() {
                return;
            }
            if drained.changed().await.is_err() {
                return;
            }
        }
    }

    /// Remove a queued, not-yet-written publish. Returns false once the
    /// message reached the wire.
    pub fn remove_unsent(&self, store: &SharedPersistence, id: u16) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let unsent = matches!(
                state.outbound.get(&id),
                Some(record) if record.phase == OutboundPhase::Queued
            );
            if unsent {
                state.outbound.remove(&id);
                state.allocator.release(id);
                let keep = |item: &OutboundItem| {
                    !matches!(item.post, PostWrite::MarkSent(item_id) if item_id == id)
                };
                state.data_queue.retain(keep);
                state.deferred.retain(keep);
                state.inflight = state.inflight.saturating_sub(1);
                state.promote_deferred();
            }
            unsent
        };
        if removed {
            let _ = store.lock().remove(&persist::send_key(id));
        }
        removed
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().outbound.len()
    }

    pub fn pending_delivery_tokens(&self) -> Vec<Token> {
        self.state
            .lock()
            .outbound
            .values()
            .map(|record| record.token.clone())
            .collect()
    }
}
