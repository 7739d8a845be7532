//! Ingestion endpoint implementation.
//!
//! The acknowledgment only means "accepted for processing": persistence
//! and broadcast run out of band on the dispatcher's workers, and once an
//! event is accepted it runs to completion (or exhausts its retry budget)
//! independently of the caller.

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::events::EventStore;
use crate::metrics::HubMetrics;
use crate::threads::ThreadManager;
use crate::types::{AgentEvent, EventId, EventInput, ThreadId, Timestamp, UserId};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Acknowledgment for a publish call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishAck {
    /// Queued for persistence and broadcast.
    Accepted(EventId),

    /// The event id was already seen; nothing was re-processed.
    Duplicate(EventId),
}

impl PublishAck {
    pub fn accepted(&self) -> bool {
        matches!(self, PublishAck::Accepted(_))
    }

    pub fn event_id(&self) -> &EventId {
        match self {
            PublishAck::Accepted(id) | PublishAck::Duplicate(id) => id,
        }
    }
}

/// Validates and hands events to the dispatcher.
pub struct IngestEndpoint {
    threads: Arc<ThreadManager>,
    store: Arc<EventStore>,
    metrics: Arc<HubMetrics>,

    /// Recently accepted event ids. Covers the window between accept and
    /// commit, when the store's index does not know the id yet.
    recent: Mutex<LruCache<EventId, ()>>,

    /// Nonce for generated event ids.
    nonce: AtomicU64,
}

impl IngestEndpoint {
    pub fn new(
        threads: Arc<ThreadManager>,
        store: Arc<EventStore>,
        metrics: Arc<HubMetrics>,
        dedup_cache_size: usize,
    ) -> Self {
        let dedup_cache_size = NonZeroUsize::new(dedup_cache_size.max(1)).unwrap();

        Self {
            threads,
            store,
            metrics,
            recent: Mutex::new(LruCache::new(dedup_cache_size)),
            nonce: AtomicU64::new(1),
        }
    }

    /// Validate and queue one event.
    pub fn publish(
        &self,
        dispatcher: &Dispatcher,
        producer: &UserId,
        thread_id: &ThreadId,
        input: EventInput,
    ) -> Result<PublishAck> {
        self.threads.ensure_owner(thread_id, producer)?;

        let timestamp = Timestamp::now();
        let event_id = match input.event_id {
            Some(id) => id,
            None => EventId::generate(
                thread_id,
                timestamp,
                self.nonce.fetch_add(1, Ordering::Relaxed),
            ),
        };

        {
            // Check-and-mark under one lock so concurrent publishes of the
            // same id cannot both pass.
            let mut recent = self.recent.lock();
            if recent.contains(&event_id) || self.store.contains_event(&event_id) {
                drop(recent);
                HubMetrics::incr(&self.metrics.events_duplicate);
                return Ok(PublishAck::Duplicate(event_id));
            }
            recent.put(event_id.clone(), ());
        }

        let event = AgentEvent {
            event_id: event_id.clone(),
            thread_id: thread_id.clone(),
            user_id: producer.clone(),
            timestamp,
            kind: input.kind,
            payload: input.payload,
            encoding: input.encoding,
        };

        dispatcher.enqueue(event)?;
        HubMetrics::incr(&self.metrics.events_accepted);

        Ok(PublishAck::Accepted(event_id))
    }
}
