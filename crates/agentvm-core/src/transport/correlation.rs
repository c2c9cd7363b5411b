//! Correlation table for multiplexing request/response pairs over one
//! duplex connection.
//!
//! Each outstanding operation registers a unique key and gets back a
//! [`Waiter`]. The connection's inbound dispatcher calls
//! [`CorrelationTable::resolve`] as replies arrive; timers call
//! [`CorrelationTable::expire`]. Both paths remove the entry through the
//! same check-and-remove under the table mutex, so exactly one of them
//! wins for any key.

use crate::error::{Result, TransportError};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Correlation key builders.
///
/// The operation prefixes contain no `:`, so keys derived from the same
/// task id for different operations can never be equal.
pub struct CorrelationKey;

impl CorrelationKey {
    pub fn execute(task_id: &str) -> String {
        format!("execute:{}", task_id)
    }

    pub fn status(task_id: &str) -> String {
        format!("status:{}", task_id)
    }

    pub fn cancel(task_id: &str) -> String {
        format!("cancel:{}", task_id)
    }
}

/// What a waiter observed
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome<T> {
    Resolved(T),
    TimedOut,
    ConnectionClosed,
}

impl<T> WaitOutcome<T> {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// Resolved payload, or the matching transport error
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Resolved(payload) => Ok(payload),
            Self::TimedOut => Err(TransportError::Timeout.into()),
            Self::ConnectionClosed => Err(TransportError::ConnectionClosed.into()),
        }
    }
}

enum Delivery<T> {
    Payload(T),
    Expired,
    Closed,
}

impl<T> From<Delivery<T>> for WaitOutcome<T> {
    fn from(delivery: Delivery<T>) -> Self {
        match delivery {
            Delivery::Payload(payload) => WaitOutcome::Resolved(payload),
            Delivery::Expired => WaitOutcome::TimedOut,
            Delivery::Closed => WaitOutcome::ConnectionClosed,
        }
    }
}

struct PendingEntry<T> {
    slot: oneshot::Sender<Delivery<T>>,
    deadline: Instant,
    /// Distinguishes successive registrations of the same key
    serial: u64,
}

struct TableState<T> {
    entries: HashMap<String, PendingEntry<T>>,
    next_serial: u64,
    closed: bool,
}

/// Pending request table shared between callers and the dispatcher
pub struct CorrelationTable<T> {
    state: Arc<Mutex<TableState<T>>>,
}

impl<T> Clone for CorrelationTable<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CorrelationTable<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TableState {
                entries: HashMap::new(),
                next_serial: 0,
                closed: false,
            })),
        }
    }

    /// Register a pending operation under `key`.
    ///
    /// Must happen before the request is sent; a reply that arrives
    /// before registration is treated as unmatched.
    pub fn register(&self, key: impl Into<String>, timeout: Duration) -> Result<Waiter<T>> {
        let key = key.into();
        let deadline = Instant::now() + timeout;
        let (slot, rx) = oneshot::channel();

        let serial = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::ConnectionClosed.into());
            }
            let serial = state.next_serial;
            match state.entries.entry(key.clone()) {
                Entry::Occupied(_) => {
                    return Err(TransportError::DuplicateCorrelationKey(key).into());
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(PendingEntry {
                        slot,
                        deadline,
                        serial,
                    });
                }
            }
            state.next_serial += 1;
            serial
        };

        trace!("Registered correlation key {}", key);
        Ok(Waiter {
            key,
            deadline,
            serial,
            rx,
            table: self.clone(),
            settled: false,
        })
    }

    fn take(&self, key: &str) -> Option<PendingEntry<T>> {
        self.state.lock().entries.remove(key)
    }

    /// Deliver `payload` to the waiter registered under `key`.
    ///
    /// Returns false when no entry exists (stale, duplicate or
    /// never-registered delivery).
    pub fn resolve(&self, key: &str, payload: T) -> bool {
        self.try_resolve(key, payload).is_ok()
    }

    /// Like [`resolve`](Self::resolve), but hands an unmatched payload back
    pub fn try_resolve(&self, key: &str, payload: T) -> std::result::Result<(), T> {
        match self.take(key) {
            Some(entry) => {
                let _ = entry.slot.send(Delivery::Payload(payload));
                Ok(())
            }
            None => Err(payload),
        }
    }

    /// Expire the entry for `key`, unblocking its waiter with `TimedOut`
    pub fn expire(&self, key: &str) -> bool {
        match self.take(key) {
            Some(entry) => {
                let _ = entry.slot.send(Delivery::Expired);
                true
            }
            None => false,
        }
    }

    /// Expire every entry whose deadline has passed
    pub fn expire_overdue(&self) -> usize {
        let now = Instant::now();
        let overdue: Vec<(String, PendingEntry<T>)> = {
            let mut state = self.state.lock();
            let keys: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| state.entries.remove(&key).map(|entry| (key, entry)))
                .collect()
        };

        let count = overdue.len();
        for (key, entry) in overdue {
            debug!("Expiring overdue correlation key {}", key);
            let _ = entry.slot.send(Delivery::Expired);
        }
        count
    }

    /// Drain every pending entry with a connection-closed outcome.
    ///
    /// The table stays closed afterwards; further registrations fail.
    pub fn close_all(&self) -> usize {
        let drained: Vec<PendingEntry<T>> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for entry in drained {
            let _ = entry.slot.send(Delivery::Closed);
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Remove `key` only if it still belongs to registration `serial`
    fn take_registration(&self, key: &str, serial: u64) -> Option<PendingEntry<T>> {
        let mut state = self.state.lock();
        match state.entries.entry(key.to_string()) {
            Entry::Occupied(entry) if entry.get().serial == serial => Some(entry.remove()),
            _ => None,
        }
    }

    /// Expire `key` for one registration; a newer entry under the same key
    /// is left alone
    fn expire_registration(&self, key: &str, serial: u64) -> bool {
        match self.take_registration(key, serial) {
            Some(entry) => {
                let _ = entry.slot.send(Delivery::Expired);
                true
            }
            None => false,
        }
    }

    fn discard(&self, key: &str, serial: u64) {
        if self.take_registration(key, serial).is_some() {
            trace!("Discarded abandoned correlation key {}", key);
        }
    }
}

/// Handle for one registered operation
pub struct Waiter<T> {
    key: String,
    deadline: Instant,
    serial: u64,
    rx: oneshot::Receiver<Delivery<T>>,
    table: CorrelationTable<T>,
    settled: bool,
}

impl<T> Waiter<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Suspend until the entry is resolved, expired or drained
    pub async fn wait(mut self) -> WaitOutcome<T> {
        let outcome = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(delivery)) => delivery.into(),
            Ok(Err(_)) => WaitOutcome::ConnectionClosed,
            Err(_) => {
                if self.table.expire_registration(&self.key, self.serial) {
                    WaitOutcome::TimedOut
                } else {
                    // Another path already removed the entry and is about
                    // to fill (or has filled) the slot.
                    match (&mut self.rx).await {
                        Ok(delivery) => delivery.into(),
                        Err(_) => WaitOutcome::ConnectionClosed,
                    }
                }
            }
        };
        self.settled = true;
        outcome
    }
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        if !self.settled {
            self.table.discard(&self.key, self.serial);
        }
    }
}
