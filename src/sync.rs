//! Response synchronizer for the PTS runner.
//!
//! The remote engine and the IUT emit protocol events on their own schedule,
//! disjoint from the test driver's control flow. Each engine connection has a
//! read task that calls [`ResponseSync::deliver`]; the driver registers a
//! named expectation and blocks in [`ResponseSync::await_response`] until the
//! matching event arrives. One oneshot channel per registered expectation
//! gives exactly-once delivery; cleanup never blocks, so a failed test case
//! cannot deadlock the orchestrator.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{CaseError, SyncError};

/// Index of an engine session within the run (0-based connect order).
pub type SessionId = u32;

/// Events without a registered waiter are kept in a bounded queue; beyond
/// this many, the oldest is dropped.
const UNMATCHED_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    session: SessionId,
    kind: String,
}

/// An asynchronous protocol event routed from an engine connection.
#[derive(Debug, Clone)]
pub struct EventPayload {
    pub kind: String,
    pub data: Value,
}

/// Ownership token returned by [`ResponseSync::register_pending`].
///
/// Consumed by `await_response` or `clear_pending`; dropping it without
/// either leaves a stale entry that the end-of-case sweep removes.
#[derive(Debug)]
pub struct PendingToken {
    session: SessionId,
    kind: String,
    serial: u64,
    rx: oneshot::Receiver<EventPayload>,
}

struct Waiter {
    serial: u64,
    tx: oneshot::Sender<EventPayload>,
}

struct Inner {
    waiters: HashMap<PendingKey, Waiter>,
    unmatched: VecDeque<(PendingKey, EventPayload)>,
    next_serial: u64,
}

pub struct ResponseSync {
    inner: Mutex<Inner>,
}

impl Default for ResponseSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseSync {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                waiters: HashMap::new(),
                unmatched: VecDeque::new(),
                next_serial: 0,
            }),
        }
    }

    /// Record that the driver is now awaiting `kind` on `session`.
    ///
    /// Fails with [`SyncError::AlreadyPending`] if an unmatched entry exists
    /// for the same key. If a matching event was already buffered, the token
    /// is satisfied immediately.
    pub fn register_pending(
        &self,
        session: SessionId,
        kind: &str,
    ) -> Result<PendingToken, SyncError> {
        let mut inner = self.inner.lock().unwrap();
        let key = PendingKey {
            session,
            kind: kind.to_string(),
        };
        if inner.waiters.contains_key(&key) {
            return Err(SyncError::AlreadyPending {
                session,
                kind: kind.to_string(),
            });
        }

        let serial = inner.next_serial;
        inner.next_serial += 1;
        let (tx, rx) = oneshot::channel();

        if let Some(pos) = inner.unmatched.iter().position(|(k, _)| *k == key) {
            // A late registration still observes an already-delivered event.
            let (_, payload) = inner.unmatched.remove(pos).unwrap();
            debug!(session, kind, "buffered event satisfies new registration");
            let _ = tx.send(payload);
        } else {
            inner.waiters.insert(key, Waiter { serial, tx });
        }

        Ok(PendingToken {
            session,
            kind: kind.to_string(),
            serial,
            rx,
        })
    }

    /// Remove an expectation unconditionally. Never blocks.
    pub fn clear_pending(&self, token: PendingToken) {
        self.remove_entry(token.session, &token.kind, token.serial);
    }

    /// Route an event from the callback path.
    ///
    /// Wakes exactly one waiter if a matching pending entry exists; otherwise
    /// the event is buffered. Never blocks the calling context and never
    /// fails.
    pub fn deliver(&self, session: SessionId, kind: &str, data: Value) {
        let key = PendingKey {
            session,
            kind: kind.to_string(),
        };
        let payload = EventPayload {
            kind: kind.to_string(),
            data,
        };
        let mut inner = self.inner.lock().unwrap();
        match inner.waiters.remove(&key) {
            Some(waiter) => {
                if let Err(payload) = waiter.tx.send(payload) {
                    // Waiter gave up (timeout race); keep the event around.
                    Self::buffer(&mut inner, key, payload);
                }
            }
            None => {
                debug!(session, kind, "no waiter registered, buffering event");
                Self::buffer(&mut inner, key, payload);
            }
        }
    }

    fn buffer(inner: &mut Inner, key: PendingKey, payload: EventPayload) {
        if inner.unmatched.len() >= UNMATCHED_CAPACITY {
            if let Some((dropped_key, _)) = inner.unmatched.pop_front() {
                warn!(
                    session = dropped_key.session,
                    kind = %dropped_key.kind,
                    "unmatched event buffer full, dropping oldest"
                );
            }
        }
        inner.unmatched.push_back((key, payload));
    }

    /// Block the calling task until `deliver` satisfies the token or the
    /// timeout elapses. On timeout the entry is auto-cleared.
    pub async fn await_response(
        &self,
        token: PendingToken,
        timeout: Duration,
    ) -> Result<EventPayload, CaseError> {
        let PendingToken {
            session,
            kind,
            serial,
            rx,
        } = token;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            // Sender dropped: the entry was swept by a cancellation sweep.
            Ok(Err(_)) => Err(CaseError::Cancelled),
            Err(_) => {
                self.remove_entry(session, &kind, serial);
                Err(CaseError::ProtocolTimeout { session, kind })
            }
        }
    }

    /// Drop all entries for one session, waking its waiters with a
    /// cancellation error.
    pub fn clear_session(&self, session: SessionId) {
        let mut inner = self.inner.lock().unwrap();
        inner.waiters.retain(|key, _| key.session != session);
        inner.unmatched.retain(|(key, _)| key.session != session);
    }

    /// Drop every entry. Waiters wake with a cancellation error, so no task
    /// stays blocked in `await_response`.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.waiters.clear();
        inner.unmatched.clear();
    }

    /// Number of unmatched pending expectations.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }

    fn remove_entry(&self, session: SessionId, kind: &str, serial: u64) {
        let mut inner = self.inner.lock().unwrap();
        let key = PendingKey {
            session,
            kind: kind.to_string(),
        };
        if inner.waiters.get(&key).map(|w| w.serial) == Some(serial) {
            inner.waiters.remove(&key);
        }
    }
}
