//! Buffer for publishes submitted while the client is not connected.

use crate::client::token::Token;
use crate::core::config::BufferOptions;
use crate::core::error::{MqttError, MqttResult, ReasonCode};
use crate::persist::{self, SharedPersistence, BUFFERED_PREFIX};
use crate::protocol::Message;
use std::collections::VecDeque;
use tracing::warn;

struct BufferedEntry {
    message: Message,
    token: Token,
    /// Persistence key index, when the buffer is persisted.
    index: Option<u64>,
}

/// FIFO of disconnected publishes, drained in order on reconnect.
pub(crate) struct DisconnectedBuffer {
    options: BufferOptions,
    entries: VecDeque<BufferedEntry>,
    next_index: u64,
}

impl DisconnectedBuffer {
    pub fn new(options: BufferOptions) -> Self {
        Self {
            options,
            entries: VecDeque::new(),
            next_index: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn message_at(&self, index: usize) -> Option<Message> {
        self.entries.get(index).map(|entry| entry.message.clone())
    }

    /// Drop the entry at `index`. The entry's token is left untouched; the
    /// caller chose to abandon the delivery.
    pub fn delete_at(&mut self, store: &SharedPersistence, index: usize) -> bool {
        match self.entries.remove(index) {
            Some(entry) => {
                Self::unpersist(store, &entry);
                true
            }
            None => false,
        }
    }

    /// Append a publish, applying the full-buffer policy.
    pub fn append(
        &mut self,
        store: &SharedPersistence,
        message: Message,
        token: &Token,
    ) -> MqttResult<()> {
        if self.entries.len() >= self.options.size {
            if !self.options.delete_oldest_on_full {
                return Err(MqttError::new(ReasonCode::DisconnectedBufferFull));
            }
            if let Some(evicted) = self.entries.pop_front() {
                Self::unpersist(store, &evicted);
                evicted
                    .token
                    .fail(MqttError::new(ReasonCode::DisconnectedBufferFull));
            }
        }

        let mut index = None;
        if self.options.persist_buffer {
            let bytes = bincode::serialize(&message)
                .map_err(|err| MqttError::with_cause(ReasonCode::PersistenceFailure, err))?;
            let key_index = self.next_index;
            store
                .lock()
                .put(&persist::buffered_key(key_index), &bytes)
                .map_err(|err| MqttError::with_cause(ReasonCode::PersistenceFailure, err))?;
            self.next_index += 1;
            index = Some(key_index);
        }

        self.entries.push_back(BufferedEntry {
            message,
            token: token.clone(),
            index,
        });
        Ok(())
    }

    /// Reload persisted entries, oldest first, giving each an orphan token.
    pub fn restore(&mut self, store: &SharedPersistence) {
        if !self.options.persist_buffer {
            return;
        }
        let mut indexed: Vec<(u64, Vec<u8>)> = Vec::new();
        {
            let store = store.lock();
            for key in store.keys() {
                let Some(index) = key
                    .strip_prefix(BUFFERED_PREFIX)
                    .and_then(|raw| raw.parse::<u64>().ok())
                else {
                    continue;
                };
                if let Ok(Some(bytes)) = store.get(&key) {
                    indexed.push((index, bytes));
                }
            }
        }
        indexed.sort_unstable_by_key(|(index, _)| *index);
        for (index, bytes) in indexed {
            match bincode::deserialize::<Message>(&bytes) {
                Ok(message) => {
                    self.next_index = self.next_index.max(index + 1);
                    self.entries.push_back(BufferedEntry {
                        message,
                        token: Token::new(crate::client::token::OperationKind::Publish),
                        index: Some(index),
                    });
                }
                Err(err) => {
                    warn!(index, error = %err, "dropping corrupt buffered publish");
                    let _ = store.lock().remove(&persist::buffered_key(index));
                }
            }
        }
    }

    /// Take every buffered publish for replay, oldest first.
    pub fn drain(&mut self, store: &SharedPersistence) -> Vec<(Message, Token)> {
        let mut drained = Vec::with_capacity(self.entries.len());
        while let Some(entry) = self.entries.pop_front() {
            Self::unpersist(store, &entry);
            drained.push((entry.message, entry.token));
        }
        drained
    }

    fn unpersist(store: &SharedPersistence, entry: &BufferedEntry) {
        if let Some(index) = entry.index {
            if let Err(err) = store.lock().remove(&persist::buffered_key(index)) {
                warn!(index, error = %err, "failed to delete buffered record");
            }
        }
    }
}
