//! Catch-up service implementation.
//!
//! Bounds the data a reconnecting client transfers to "since last known
//! state": a snapshot at (or near) the client's cursor plus the events
//! after it, never the whole history.

use crate::error::Result;
use crate::events::EventStore;
use crate::snapshots::fold_entries;
use crate::threads::ThreadManager;
use crate::types::{
    EventCursor, EventId, EventLogEntry, Sequence, ThreadId, ThreadSnapshot, Timestamp, UserId,
};
use std::sync::Arc;

/// Response to a snapshot-and-events request.
///
/// Applying `events` to `snapshot` in order reconstructs current state.
/// `gaps` lists event ids that exhausted their persist retries and are
/// missing from durable history.
#[derive(Clone, Debug)]
pub struct Replay {
    pub snapshot: ThreadSnapshot,
    pub events: Vec<EventLogEntry>,
    pub gaps: Vec<EventId>,
}

/// Answers "give me thread T's state" and "give me everything since E".
pub struct CatchupService {
    threads: Arc<ThreadManager>,
    store: Arc<EventStore>,
}

impl CatchupService {
    pub fn new(threads: Arc<ThreadManager>, store: Arc<EventStore>) -> Self {
        Self { threads, store }
    }

    /// The thread's current state as a snapshot.
    pub fn current_state(
        &self,
        thread_id: &ThreadId,
        requester: &UserId,
    ) -> Result<ThreadSnapshot> {
        self.threads.ensure_owner(thread_id, requester)?;
        self.state_up_to(thread_id, self.store.head(thread_id))
    }

    /// Snapshot at the caller's cursor plus the events after it.
    ///
    /// With no cursor, the latest persisted snapshot is used as the base.
    pub fn replay(
        &self,
        thread_id: &ThreadId,
        requester: &UserId,
        cursor: Option<&EventCursor>,
        limit: usize,
    ) -> Result<Replay> {
        self.threads.ensure_owner(thread_id, requester)?;

        let at = match cursor {
            Some(cursor) => self.store.resolve_cursor(thread_id, cursor)?,
            None => self
                .store
                .latest_snapshot(thread_id)?
                .map(|s| s.as_of)
                .unwrap_or_default(),
        };

        let snapshot = self.state_up_to(thread_id, at)?;
        let events = self.store.events_since(thread_id, snapshot.as_of, limit)?;
        let gaps = self.store.gaps(thread_id);

        Ok(Replay {
            snapshot,
            events,
            gaps,
        })
    }

    /// Build the thread's state as of `at`.
    ///
    /// Uses the latest persisted snapshot when it is at or before `at`;
    /// otherwise rebuilds from genesis while the log still holds the early
    /// events. Once pruning has removed them the latest snapshot is
    /// returned as-is (its `as_of` exceeds the request) and the caller
    /// resyncs from there.
    fn state_up_to(&self, thread_id: &ThreadId, at: Sequence) -> Result<ThreadSnapshot> {
        let base = match self.store.latest_snapshot(thread_id)? {
            Some(snapshot) if snapshot.as_of <= at => snapshot,
            Some(snapshot) => {
                if self.store.earliest(thread_id) != Some(Sequence(1)) {
                    return Ok(snapshot);
                }
                ThreadSnapshot::genesis(thread_id.clone())
            }
            None => ThreadSnapshot::genesis(thread_id.clone()),
        };

        if base.as_of == at {
            return Ok(base);
        }

        let span = (at.0 - base.as_of.0) as usize;
        let entries = self.store.events_since(thread_id, base.as_of, span)?;
        let as_of = entries.last().map(|e| e.sequence).unwrap_or(base.as_of);
        let state = fold_entries(base.state, &entries)?;

        Ok(ThreadSnapshot {
            thread_id: thread_id.clone(),
            as_of,
            state,
            created: Timestamp::now(),
        })
    }
}
