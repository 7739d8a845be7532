//! Subscription registry implementation.

use crate::types::{ConnectionId, ThreadId, UserId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use super::types::Subscription;

/// Registry state behind one lock.
#[derive(Debug, Default)]
struct RegistryState {
    /// thread -> connections subscribed specifically to it.
    by_thread: HashMap<ThreadId, HashSet<ConnectionId>>,

    /// user -> connections subscribed to "all threads" for that user.
    by_user: HashMap<UserId, HashSet<ConnectionId>>,

    /// connection -> its subscriptions, keyed by filter.
    by_connection: HashMap<ConnectionId, HashMap<Option<ThreadId>, Subscription>>,
}

/// In-memory index of live subscriptions.
///
/// Ownership of a thread filter is checked by the caller before a
/// subscription reaches the registry; `recipients_for` re-filters by the
/// thread's owner anyway, so a misconfigured entry can never leak another
/// user's events.
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Insert or update a subscription.
    ///
    /// Re-subscribing with the same `(connection, filter)` updates the
    /// cursor in place.
    pub fn subscribe(&self, subscription: Subscription) {
        let mut state = self.state.write();

        match &subscription.thread_filter {
            Some(thread_id) => {
                state
                    .by_thread
                    .entry(thread_id.clone())
                    .or_default()
                    .insert(subscription.connection_id.clone());
            }
            None => {
                state
                    .by_user
                    .entry(subscription.user_id.clone())
                    .or_default()
                    .insert(subscription.connection_id.clone());
            }
        }

        state
            .by_connection
            .entry(subscription.connection_id.clone())
            .or_default()
            .insert(subscription.thread_filter.clone(), subscription);
    }

    /// Remove a subscription. Removing one that does not exist is a
    /// successful no-op; returns whether anything was removed.
    pub fn unsubscribe(&self, connection_id: &ConnectionId, thread_filter: Option<&ThreadId>) -> bool {
        let mut state = self.state.write();

        let filter_key = thread_filter.cloned();
        let Some(subs) = state.by_connection.get_mut(connection_id) else {
            return false;
        };
        let Some(removed) = subs.remove(&filter_key) else {
            return false;
        };
        if subs.is_empty() {
            state.by_connection.remove(connection_id);
        }

        Self::drop_from_indices(&mut state, &removed);
        true
    }

    /// Remove every subscription owned by a connection. Idempotent; safe to
    /// call from both a disconnect handler and a timeout sweep.
    pub fn remove_connection(&self, connection_id: &ConnectionId) {
        let mut state = self.state.write();

        let Some(subs) = state.by_connection.remove(connection_id) else {
            return;
        };

        for subscription in subs.into_values() {
            Self::drop_from_indices(&mut state, &subscription);
        }
    }

    /// Connections that should receive an event for `thread_id`, owned by
    /// `owner`: the union of thread-specific subscribers and the owner's
    /// all-thread subscribers, filtered to subscriptions under the owner.
    pub fn recipients_for(&self, thread_id: &ThreadId, owner: &UserId) -> Vec<ConnectionId> {
        let state = self.state.read();

        let mut recipients: HashSet<&ConnectionId> = HashSet::new();

        if let Some(connections) = state.by_thread.get(thread_id) {
            for connection_id in connections {
                let authorized = state
                    .by_connection
                    .get(connection_id)
                    .and_then(|subs| subs.get(&Some(thread_id.clone())))
                    .map(|s| &s.user_id == owner)
                    .unwrap_or(false);
                if authorized {
                    recipients.insert(connection_id);
                }
            }
        }

        if let Some(connections) = state.by_user.get(owner) {
            recipients.extend(connections.iter());
        }

        recipients.into_iter().cloned().collect()
    }

    /// Look up one subscription.
    pub fn get(
        &self,
        connection_id: &ConnectionId,
        thread_filter: Option<&ThreadId>,
    ) -> Option<Subscription> {
        self.state
            .read()
            .by_connection
            .get(connection_id)
            .and_then(|subs| subs.get(&thread_filter.cloned()))
            .cloned()
    }

    /// All subscriptions for a connection.
    pub fn subscriptions_for(&self, connection_id: &ConnectionId) -> Vec<Subscription> {
        self.state
            .read()
            .by_connection
            .get(connection_id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Total live subscriptions.
    pub fn count(&self) -> usize {
        self.state
            .read()
            .by_connection
            .values()
            .map(|subs| subs.len())
            .sum()
    }

    fn drop_from_indices(state: &mut RegistryState, subscription: &Subscription) {
        match &subscription.thread_filter {
            Some(thread_id) => {
                if let Some(connections) = state.by_thread.get_mut(thread_id) {
                    connections.remove(&subscription.connection_id);
                    if connections.is_empty() {
                        state.by_thread.remove(thread_id);
                    }
                }
            }
            None => {
                if let Some(connections) = state.by_user.get_mut(&subscription.user_id) {
                    connections.remove(&subscription.connection_id);
                    if connections.is_empty() {
                        state.by_user.remove(&subscription.user_id);
                    }
                }
            }
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
