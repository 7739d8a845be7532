//! Subscription types.

use crate::types::{ConnectionId, EventId, ThreadId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// A connection's interest in a thread's events.
///
/// `thread_filter = None` means "all threads owned by `user_id`". At most
/// one subscription exists per `(connection_id, thread_filter)` pair;
/// re-subscribing with the same filter updates the cursor in place.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscription {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub thread_filter: Option<ThreadId>,

    /// Last event the subscriber has seen, if it told us.
    pub last_event_id: Option<EventId>,

    pub subscribed_at: Timestamp,
}

impl Subscription {
    pub fn new(
        connection_id: ConnectionId,
        user_id: UserId,
        thread_filter: Option<ThreadId>,
        last_event_id: Option<EventId>,
    ) -> Self {
        Self {
            connection_id,
            user_id,
            thread_filter,
            last_event_id,
            subscribed_at: Timestamp::now(),
        }
    }
}
