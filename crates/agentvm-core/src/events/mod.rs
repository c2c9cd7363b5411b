//! Lifecycle event bus
//!
//! Named topics with ordered handler lists. `publish` runs every handler
//! of the topic synchronously on the caller's task, in subscription
//! order. A handler that returns an error or panics is logged and
//! skipped; the remaining handlers still run.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

/// Topics emitted by the registry
pub mod topics {
    pub const AGENT_CREATED: &str = "agent_created";
    pub const AGENT_DESTROYED: &str = "agent_destroyed";
    pub const AGENT_STATE_CHANGED: &str = "agent_state_changed";
    pub const TASK_COMPLETED: &str = "task_completed";
    pub const TASK_FAILED: &str = "task_failed";
    pub const CONVERSATION_STARTED: &str = "conversation_started";
    pub const CONVERSATION_ENDED: &str = "conversation_ended";
}

pub type EventPayload = serde_json::Map<String, Value>;

/// Object payload from a `json!` literal; anything else becomes empty
pub fn payload(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub topic: String,
    pub payload: EventPayload,
    pub emitted_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }
}

pub type EventHandler = Arc<dyn Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync>;

/// Identifies one subscription so it can be removed later
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl fmt::Debug for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandlerId({})", self.0)
    }
}

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

impl HandlerId {
    fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, EventHandler)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: &str, handler: F) -> HandlerId
    where
        F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId::next();
        self.handlers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        trace!("Subscribed {:?} to {}", id, topic);
        id
    }

    /// Remove one handler, or every handler of the topic when `handler`
    /// is `None`. Returns how many were removed.
    pub fn unsubscribe(&self, topic: &str, handler: Option<HandlerId>) -> usize {
        let mut handlers = self.handlers.write();
        match handler {
            None => handlers.remove(topic).map(|list| list.len()).unwrap_or(0),
            Some(id) => {
                let Some(list) = handlers.get_mut(topic) else {
                    return 0;
                };
                let before = list.len();
                list.retain(|(existing, _)| *existing != id);
                let removed = before - list.len();
                if list.is_empty() {
                    handlers.remove(topic);
                }
                removed
            }
        }
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.handlers.read().get(topic).map(Vec::len).unwrap_or(0)
    }

    /// Deliver to the topic's current subscribers and return how many
    /// handled the event without fault.
    pub fn publish(&self, topic: &str, payload: EventPayload) -> usize {
        // Snapshot so handlers may subscribe/unsubscribe without deadlock
        let snapshot: Vec<(HandlerId, EventHandler)> = match self.handlers.read().get(topic) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let event = LifecycleEvent {
            topic: topic.to_string(),
            payload,
            emitted_at: Utc::now(),
        };

        let mut delivered = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => error!("Event handler {:?} for {} failed: {:#}", id, topic, e),
                Err(_) => error!("Event handler {:?} for {} panicked", id, topic),
            }
        }
        delivered
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        let mut topics: Vec<_> = handlers.keys().cloned().collect();
        topics.sort();
        f.debug_struct("EventBus").field("topics", &topics).finish()
    }
}
