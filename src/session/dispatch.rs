//! Topic grammar, wildcard matching and the filter-to-handler table.

use crate::core::error::{MqttError, MqttResult, ReasonCode};
use crate::protocol::{Message, Qos};
use std::sync::Arc;

/// Per-subscription message handler. Invoked from the dispatcher task;
/// must not assume any particular thread.
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

const MAX_TOPIC_LEN: usize = 65_535;

/// Validate a topic name for publishing. Wildcards are not allowed.
pub fn validate_topic(topic: &str) -> MqttResult<()> {
    validate_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(MqttError::new(ReasonCode::InvalidTopic));
    }
    Ok(())
}

/// Validate a subscription filter: `+` must occupy a whole level and `#`
/// must be the final level.
pub fn validate_filter(filter: &str) -> MqttResult<()> {
    validate_common(filter)?;
    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('+') && *level != "+" {
            return Err(MqttError::new(ReasonCode::InvalidTopic));
        }
        if level.contains('#') && (*level != "#" || index + 1 != levels.len()) {
            return Err(MqttError::new(ReasonCode::InvalidTopic));
        }
    }
    Ok(())
}

fn validate_common(value: &str) -> MqttResult<()> {
    if value.is_empty() || value.len() > MAX_TOPIC_LEN || value.contains('\0') {
        return Err(MqttError::new(ReasonCode::InvalidTopic));
    }
    Ok(())
}

/// Level-by-level wildcard match.
///
/// `+` consumes exactly one level, `#` the remainder (including zero
/// levels, so `a/#` matches `a`). Filters starting with a wildcard never
/// match `$`-prefixed topics.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(level)) if expected == level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct FilterEntry {
    filter: String,
    qos: Qos,
    handler: Option<MessageHandler>,
}

/// Ordered mapping of subscription filters to handlers.
///
/// Updated optimistically when a SUBSCRIBE is sent and rolled back if it
/// fails; rollback does not restore handlers an earlier subscribe had
/// registered for the same filters.
#[derive(Default)]
pub struct DispatchTable {
    entries: Vec<FilterEntry>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter, replacing any existing entry for it in place.
    pub fn insert(&mut self, filter: &str, qos: Qos, handler: Option<MessageHandler>) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.filter == filter) {
            entry.qos = qos;
            entry.handler = handler;
            return;
        }
        self.entries.push(FilterEntry {
            filter: filter.to_string(),
            qos,
            handler,
        });
    }

    /// Drop a filter entirely (unsubscribe path).
    pub fn remove(&mut self, filter: &str) {
        self.entries.retain(|entry| entry.filter != filter);
    }

    /// Drop only the handler, keeping the subscription known.
    pub fn remove_handler(&mut self, filter: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.filter == filter) {
            entry.handler = None;
        }
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.entries.iter().any(|entry| entry.filter == filter)
    }

    /// Handlers whose filters match the topic, one per matching filter, in
    /// registration order.
    pub fn matching_handlers(&self, topic: &str) -> Vec<MessageHandler> {
        self.entries
            .iter()
            .filter(|entry| filter_matches(&entry.filter, topic))
            .filter_map(|entry| entry.handler.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
