//! Rendezvous between blocked connection tasks and operator decisions.
//!
//! A connection task that holds a request registers a one-shot channel
//! under the request id and blocks on it; the control channel's read loop
//! delivers the matching decision from a different task entirely. Two maps
//! make the rendezvous race-free in both directions:
//!
//! - `waiting` holds the one-shot sender for each task currently blocked;
//! - `early` holds decisions that arrived before anyone registered, so a
//!   fast operator (or a queued message) is not lost.
//!
//! Each id is consumed at most once. A bounded ring of recently resolved
//! ids lets late or duplicate decisions be recognized and dropped instead
//! of parking in the early map forever.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::control::protocol::DecisionData;

/// How many resolved ids to remember for duplicate detection.
const RESOLVED_RING: usize = 256;

/// Where a delivered decision ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverOutcome {
    /// Handed directly to a waiting connection task.
    Delivered,
    /// No one was waiting yet; stored for a future registration.
    Stored,
    /// The id was already resolved; the decision was dropped.
    Ignored,
}

#[derive(Default)]
struct RegistryState {
    waiting: HashMap<Uuid, oneshot::Sender<DecisionData>>,
    early: HashMap<Uuid, DecisionData>,
    resolved: VecDeque<Uuid>,
}

/// Concurrency-safe map from request id to its decision rendezvous.
///
/// The lock is only ever held for map operations, never across an await.
#[derive(Default)]
pub struct DecisionRegistry {
    state: Mutex<RegistryState>,
}

impl DecisionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id` and return the receiving end.
    ///
    /// If a decision for `id` already arrived, it is delivered through the
    /// returned channel immediately.
    pub fn register(&self, id: Uuid) -> oneshot::Receiver<DecisionData> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();

        if let Some(decision) = state.early.remove(&id) {
            debug!("Request {} consumed an early decision", id);
            let _ = tx.send(decision);
        } else {
            state.waiting.insert(id, tx);
        }

        rx
    }

    /// Route a decision to the task waiting on its id.
    ///
    /// Exactly one of three things happens: the waiting task is unblocked,
    /// the decision is stored for a registration that has not happened yet,
    /// or (for an already-resolved id) the decision is ignored.
    pub fn deliver(&self, decision: DecisionData) -> DeliverOutcome {
        let id = decision.id;
        let mut state = self.state.lock().unwrap();

        if state.resolved.contains(&id) {
            debug!("Ignoring decision for already-resolved request {}", id);
            return DeliverOutcome::Ignored;
        }

        if let Some(tx) = state.waiting.remove(&id) {
            // A dropped receiver means the waiter timed out between our
            // lookup and the send; that counts as resolved either way.
            let _ = tx.send(decision);
            DeliverOutcome::Delivered
        } else {
            state.early.insert(id, decision);
            DeliverOutcome::Stored
        }
    }

    /// Mark `id` resolved and drop any leftover state for it.
    ///
    /// Called by the interception controller on every exit path (decision
    /// applied, timeout, channel loss), so no entry outlives its request.
    pub fn finish(&self, id: Uuid) {
        let mut state = self.state.lock().unwrap();
        state.waiting.remove(&id);
        state.early.remove(&id);

        state.resolved.push_back(id);
        while state.resolved.len() > RESOLVED_RING {
            state.resolved.pop_front();
        }
    }

    /// Number of tasks currently blocked on a decision.
    pub fn waiting_count(&self) -> usize {
        self.state.lock().unwrap().waiting.len()
    }

    /// Whether no waiters and no early decisions are held.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.waiting.is_empty() && state.early.is_empty()
    }
}
