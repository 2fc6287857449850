//! Pending-request table for correlating responses with waiting callers.
//!
//! Every outstanding request on a connection has exactly one entry keyed by its
//! [`CorrelationId`]. Entries leave the table exactly once: resolved by the
//! receive loop, timed out or cancelled by the caller, or failed by
//! [`PendingTable::fail_all`]. All transitions happen under one lock, so a
//! request can never be resolved twice nor be lost.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::protocol::{CorrelationId, DecodedFrame};

/// What the receive loop should do with a frame after [`PendingTable::resolve`].
#[derive(Debug)]
pub enum ResolveOutcome {
    /// A waiter received the frame. Carries the credit charge it reserved.
    Resolved {
        /// Credits reserved by the request.
        charge: u16,
    },
    /// The request had timed out or been cancelled; the frame is late.
    /// The credits it reserved can now be settled.
    Late {
        /// Credits reserved by the abandoned request.
        charge: u16,
    },
    /// No request with this id: the frame is unsolicited.
    Unknown(DecodedFrame),
}

struct Entry {
    sender: oneshot::Sender<Result<DecodedFrame>>,
    deadline: Instant,
    timeout: Duration,
    charge: u16,
}

struct Abandoned {
    charge: u16,
    since: Instant,
}

#[derive(Default)]
struct TableState {
    entries: HashMap<CorrelationId, Entry>,
    abandoned: HashMap<CorrelationId, Abandoned>,
    closed: Option<TransportError>,
}

/// Handle returned by [`PendingTable::register`]; pass it to [`PendingTable::wait`].
#[derive(Debug)]
pub struct PendingHandle {
    id: CorrelationId,
    receiver: oneshot::Receiver<Result<DecodedFrame>>,
}

impl PendingHandle {
    /// Correlation id of the registered request.
    pub fn id(&self) -> CorrelationId {
        self.id
    }
}

/// Table of outstanding requests on one connection.
pub struct PendingTable {
    state: Mutex<TableState>,
    drained: Notify,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        // A panic while holding the lock cannot leave the map half-updated:
        // every critical section is a single insert/remove.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a request that must be answered within `timeout`.
    ///
    /// Fails with [`TransportError::DuplicateCorrelation`] if `id` is still
    /// outstanding (including abandoned requests whose late answer may still
    /// arrive), or with the failure reason once the table has been failed.
    pub fn register(&self, id: CorrelationId, timeout: Duration, charge: u16) -> Result<PendingHandle> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }
        if state.entries.contains_key(&id) || state.abandoned.contains_key(&id) {
            return Err(TransportError::DuplicateCorrelation(id));
        }
        let (sender, receiver) = oneshot::channel();
        state.entries.insert(
            id,
            Entry { sender, deadline: Instant::now() + timeout, timeout, charge },
        );
        Ok(PendingHandle { id, receiver })
    }

    /// Delivers `frame` to the request it answers.
    pub fn resolve(&self, id: CorrelationId, frame: DecodedFrame) -> ResolveOutcome {
        let removed = {
            let mut state = self.lock();
            match state.entries.remove(&id) {
                Some(entry) => {
                    if state.entries.is_empty() {
                        self.drained.notify_waiters();
                    }
                    Ok(entry)
                }
                None => Err(state.abandoned.remove(&id).map(|a| a.charge)),
            }
        };
        match removed {
            Ok(entry) => {
                let charge = entry.charge;
                let _ = entry.sender.send(Ok(frame));
                ResolveOutcome::Resolved { charge }
            }
            Err(Some(charge)) => {
                debug!(id, "late response for abandoned request");
                ResolveOutcome::Late { charge }
            }
            Err(None) => ResolveOutcome::Unknown(frame),
        }
    }

    /// Fails a single request, e.g. because its response could not be decoded.
    ///
    /// Returns the credit charge of the failed request, or `None` if `id` was
    /// not outstanding.
    pub fn fail(&self, id: CorrelationId, error: TransportError) -> Option<u16> {
        let entry = {
            let mut state = self.lock();
            let entry = state.entries.remove(&id);
            if entry.is_some() && state.entries.is_empty() {
                self.drained.notify_waiters();
            }
            entry
        }?;
        let charge = entry.charge;
        let _ = entry.sender.send(Err(error));
        Some(charge)
    }

    /// Pushes the deadline of an outstanding request out by its original timeout.
    ///
    /// Used for interim (async pending) responses. Returns false if `id` is unknown.
    pub fn extend(&self, id: CorrelationId) -> bool {
        let mut state = self.lock();
        match state.entries.get_mut(&id) {
            Some(entry) => {
                entry.deadline = Instant::now() + entry.timeout;
                true
            }
            None => false,
        }
    }

    /// Removes a request on behalf of its caller. Late answers are still
    /// recognized so their credits can be settled.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        let mut state = self.lock();
        match state.entries.remove(&id) {
            Some(entry) => {
                state.abandoned.insert(id, Abandoned { charge: entry.charge, since: Instant::now() });
                if state.entries.is_empty() {
                    self.drained.notify_waiters();
                }
                true
            }
            None => false,
        }
    }

    /// Waits for the request behind `handle` to reach a terminal state.
    ///
    /// Returns [`TransportError::RequestTimeout`] once the deadline elapses and
    /// removes the entry. Never retries. Dropping the returned future cancels
    /// the request.
    pub async fn wait(&self, handle: PendingHandle) -> Result<DecodedFrame> {
        let PendingHandle { id, mut receiver } = handle;
        let mut guard = CancelOnDrop { table: self, id, armed: true };

        loop {
            let deadline = match self.lock().entries.get(&id) {
                Some(entry) => Some((entry.deadline, entry.timeout)),
                None => None,
            };

            let Some((deadline, timeout)) = deadline else {
                // Already resolved or failed; the outcome is in the channel.
                guard.armed = false;
                return receiver.await.unwrap_or(Err(TransportError::ConnectionReset));
            };

            tokio::select! {
                outcome = &mut receiver => {
                    guard.armed = false;
                    return outcome.unwrap_or(Err(TransportError::ConnectionReset));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let mut state = self.lock();
                    let expired = match state.entries.get(&id) {
                        Some(entry) => entry.deadline <= Instant::now(),
                        None => false,
                    };
                    if expired {
                        if let Some(entry) = state.entries.remove(&id) {
                            state.abandoned.insert(id, Abandoned { charge: entry.charge, since: Instant::now() });
                        }
                        if state.entries.is_empty() {
                            self.drained.notify_waiters();
                        }
                        guard.armed = false;
                        return Err(TransportError::RequestTimeout {
                            request_id: id,
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                    // Extended by an interim response, or resolved concurrently.
                }
            }
        }
    }

    /// Fails every outstanding request with `reason` and closes the table to new
    /// registrations. `mark` runs under the table lock, so the connection state
    /// change it performs is atomic with respect to resolution.
    ///
    /// Returns the number of requests failed.
    pub fn fail_all_with<F: FnOnce()>(&self, reason: TransportError, mark: F) -> usize {
        let drained: Vec<Entry> = {
            let mut state = self.lock();
            mark();
            if state.closed.is_none() {
                state.closed = Some(reason.clone());
            }
            state.abandoned.clear();
            state.entries.drain().map(|(_, e)| e).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.sender.send(Err(reason.clone()));
        }
        self.drained.notify_waiters();
        count
    }

    /// Fails every outstanding request with `reason`.
    pub fn fail_all(&self, reason: TransportError) -> usize {
        self.fail_all_with(reason, || {})
    }

    /// Closes the table to new registrations if nothing is outstanding.
    ///
    /// Used by the receive loop to retire an idle connection without racing a
    /// concurrent registration.
    pub fn close_if_idle(&self, reason: TransportError) -> bool {
        let mut state = self.lock();
        if !state.entries.is_empty() || state.closed.is_some() {
            return false;
        }
        state.closed = Some(reason);
        state.abandoned.clear();
        true
    }

    /// Forgets requests abandoned for at least `grace` whose answer never
    /// came. Returns the credit charge they held; their late answers, if any,
    /// are then treated as unknown.
    pub fn expire_abandoned(&self, grace: Duration) -> u32 {
        let now = Instant::now();
        let mut state = self.lock();
        let mut released = 0u32;
        state.abandoned.retain(|id, a| {
            if now.duration_since(a.since) < grace {
                return true;
            }
            debug!(id = *id, charge = a.charge, "giving up on late response");
            released += u32::from(a.charge);
            false
        });
        released
    }

    /// Number of abandoned requests still holding credits.
    pub fn abandoned_count(&self) -> usize {
        self.lock().abandoned.len()
    }

    /// Whether [`fail_all`](Self::fail_all) has run.
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` is outstanding.
    pub fn contains(&self, id: CorrelationId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    /// Waits until no requests are outstanding.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

struct CancelOnDrop<'a> {
    table: &'a PendingTable,
    id: CorrelationId,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.cancel(self.id);
        }
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use crate::protocol::FrameClass;
    use bytes::Bytes;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Slot {
        Free,
        Pending,
        Abandoned,
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(u64),
        Resolve(u64),
        Cancel(u64),
        Fail(u64),
    }

    fn frame(id: CorrelationId) -> DecodedFrame {
        DecodedFrame {
            id,
            command: 0x0D,
            credit_charge: 1,
            credits_granted: 1,
            status: 0,
            class: FrameClass::Response,
            interim: false,
            async_id: None,
            notification: None,
            payload: Bytes::new(),
        }
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..8).prop_map(Op::Register),
            (0u64..8).prop_map(Op::Resolve),
            (0u64..8).prop_map(Op::Cancel),
            (0u64..8).prop_map(Op::Fail),
        ]
    }

    proptest! {
        #[test]
        fn test_each_request_leaves_exactly_once(ops in proptest::collection::vec(op(), 1..200)) {
            let table = PendingTable::new();
            let mut model = [Slot::Free; 8];
            let mut handles = Vec::new();
            for op in ops {
                match op {
                    Op::Register(id) => {
                        let result = table.register(id, Duration::from_secs(60), 1);
                        prop_assert_eq!(result.is_ok(), model[id as usize] == Slot::Free);
                        if let Ok(handle) = result {
                            handles.push(handle);
                            model[id as usize] = Slot::Pending;
                        }
                    }
                    Op::Resolve(id) => {
                        let outcome = table.resolve(id, frame(id));
                        let expected = match model[id as usize] {
                            Slot::Pending => matches!(outcome, ResolveOutcome::Resolved { charge: 1 }),
                            Slot::Abandoned => matches!(outcome, ResolveOutcome::Late { charge: 1 }),
                            Slot::Free => matches!(outcome, ResolveOutcome::Unknown(_)),
                        };
                        prop_assert!(expected, "unexpected outcome {:?} for slot {:?}", outcome, model[id as usize]);
                        model[id as usize] = Slot::Free;
                    }
                    Op::Cancel(id) => {
                        let cancelled = table.cancel(id);
                        prop_assert_eq!(cancelled, model[id as usize] == Slot::Pending);
                        if cancelled {
                            model[id as usize] = Slot::Abandoned;
                        }
                    }
                    Op::Fail(id) => {
                        let failed = table.fail(id, TransportError::ConnectionReset);
                        prop_assert_eq!(failed.is_some(), model[id as usize] == Slot::Pending);
                        if failed.is_some() {
                            model[id as usize] = Slot::Free;
                        }
                    }
                }
                let pending = model.iter().filter(|s| **s == Slot::Pending).count();
                prop_assert_eq!(table.len(), pending);
            }
            let outstanding = table.len();
            prop_assert_eq!(table.fail_all(TransportError::NotConnected), outstanding);
            prop_assert!(table.is_empty());
        }
    }
}
