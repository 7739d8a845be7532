//! Broadcast router implementation.
//!
//! Pushes go over each connection's bounded outbound channel with
//! `try_send`: a stalled or closed connection fails fast and never delays
//! the other recipients. Failures are counted and logged here; the
//! dispatcher owns the (bounded) retry budget, and a recipient that stays
//! unreachable is expected to catch up on reconnect.

use crate::metrics::HubMetrics;
use crate::registry::SubscriptionRegistry;
use crate::threads::ThreadManager;
use crate::types::{AgentEvent, ConnectionId, UserId};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Server-to-client push carrying one accepted event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventNotification {
    pub event: AgentEvent,
}

/// Per-recipient outcome of one delivery pass.
#[derive(Clone, Debug, Default)]
pub struct DeliveryReport {
    /// Recipients resolved from the registry.
    pub attempted: usize,

    /// Recipients whose channel accepted the push.
    pub delivered: usize,

    /// Recipients whose channel was full or closed.
    pub failed: Vec<ConnectionId>,
}

/// Receiving side of a connection's outbound channel.
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,

    /// Channel to receive notifications.
    pub receiver: Receiver<EventNotification>,
}

impl ConnectionHandle {
    /// Receive the next notification (blocking).
    pub fn recv(&self) -> Result<EventNotification, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a notification (non-blocking).
    pub fn try_recv(&self) -> Result<EventNotification, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<EventNotification, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// A connection's outbound side.
struct Outbound {
    user_id: UserId,
    sender: Sender<EventNotification>,
}

/// Resolves recipients and pushes notifications.
pub struct BroadcastRouter {
    /// Attached connections by id.
    connections: RwLock<HashMap<ConnectionId, Outbound>>,

    registry: Arc<SubscriptionRegistry>,
    threads: Arc<ThreadManager>,
    metrics: Arc<HubMetrics>,
}

impl BroadcastRouter {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        threads: Arc<ThreadManager>,
        metrics: Arc<HubMetrics>,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            registry,
            threads,
            metrics,
        }
    }

    /// Attach a connection's outbound channel. Re-attaching an id replaces
    /// the previous channel (the old receiver starts reporting
    /// disconnected).
    pub fn attach(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        buffer: usize,
    ) -> ConnectionHandle {
        let (sender, receiver) = bounded(buffer);

        self.connections.write().insert(
            connection_id.clone(),
            Outbound { user_id, sender },
        );

        ConnectionHandle {
            connection_id,
            receiver,
        }
    }

    /// Detach a connection. Idempotent.
    pub fn detach(&self, connection_id: &ConnectionId) {
        self.connections.write().remove(connection_id);
    }

    /// Whether a connection is attached.
    pub fn is_attached(&self, connection_id: &ConnectionId) -> bool {
        self.connections.read().contains_key(connection_id)
    }

    /// The user a connection was attached under.
    pub fn user_of(&self, connection_id: &ConnectionId) -> Option<UserId> {
        self.connections
            .read()
            .get(connection_id)
            .map(|o| o.user_id.clone())
    }

    /// Number of attached connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Push one event to every authorized recipient.
    pub fn deliver(&self, event: &AgentEvent) -> DeliveryReport {
        let Ok(owner) = self.threads.owner_of(&event.thread_id) else {
            // Thread vanished between accept and deliver; nothing to do.
            return DeliveryReport::default();
        };

        let recipients = self.registry.recipients_for(&event.thread_id, &owner);

        let mut report = DeliveryReport {
            attempted: recipients.len(),
            ..Default::default()
        };

        for connection_id in recipients {
            if self.deliver_to(&connection_id, event) {
                report.delivered += 1;
            } else {
                report.failed.push(connection_id);
            }
        }

        report
    }

    /// Push one event to one connection. Returns false if the channel is
    /// full, closed, or gone.
    pub fn deliver_to(&self, connection_id: &ConnectionId, event: &AgentEvent) -> bool {
        let connections = self.connections.read();
        let Some(outbound) = connections.get(connection_id) else {
            HubMetrics::incr(&self.metrics.delivery_failures);
            debug!(connection = %connection_id, event = %event.event_id, "push to detached connection");
            return false;
        };

        match outbound.sender.try_send(EventNotification {
            event: event.clone(),
        }) {
            Ok(()) => {
                HubMetrics::incr(&self.metrics.notifications_sent);
                true
            }
            Err(_) => {
                HubMetrics::incr(&self.metrics.delivery_failures);
                debug!(connection = %connection_id, event = %event.event_id, "push failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Subscription;
    use crate::types::{EventId, PayloadEncoding, ThreadId, Timestamp};
    use std::time::Duration;
    use tempfile::TempDir;

    fn make_router(dir: &TempDir) -> (BroadcastRouter, Arc<SubscriptionRegistry>, Arc<ThreadManager>) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let threads = Arc::new(ThreadManager::new(dir.path().join("threads.bin")).unwrap());
        let metrics = Arc::new(HubMetrics::new());
        let router = BroadcastRouter::new(Arc::clone(&registry), Arc::clone(&threads), metrics);
        (router, registry, threads)
    }

    fn make_event(thread: &str, id: &str) -> AgentEvent {
        AgentEvent {
            event_id: EventId::new(id),
            thread_id: ThreadId::new(thread),
            user_id: UserId::new("alice"),
            timestamp: Timestamp::now(),
            kind: "message".to_string(),
            payload: b"{}".to_vec(),
            encoding: PayloadEncoding::Json,
        }
    }

    #[test]
    fn test_deliver_to_subscribed_connection() {
        let dir = TempDir::new().unwrap();
        let (router, registry, threads) = make_router(&dir);

        threads
            .create(ThreadId::new("t1"), UserId::new("alice"))
            .unwrap();

        let handle = router.attach(ConnectionId::new("c1"), UserId::new("alice"), 16);
        registry.subscribe(Subscription::new(
            ConnectionId::new("c1"),
            UserId::new("alice"),
            Some(ThreadId::new("t1")),
            None,
        ));

        let report = router.deliver(&make_event("t1", "e1"));
        assert_eq!(report.attempted, 1);
        assert_eq!(report.delivered, 1);
        assert!(report.failed.is_empty());

        let notification = handle.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(notification.event.event_id, EventId::new("e1"));
    }

    #[test]
    fn test_failed_push_is_isolated() {
        let dir = TempDir::new().unwrap();
        let (router, registry, threads) = make_router(&dir);

        threads
            .create(ThreadId::new("t1"), UserId::new("alice"))
            .unwrap();

        // c1's receiver is dropped (closed channel); c2 stays healthy
        let dead = router.attach(ConnectionId::new("c1"), UserId::new("alice"), 16);
        drop(dead);
        let live = router.attach(ConnectionId::new("c2"), UserId::new("alice"), 16);

        for conn in ["c1", "c2"] {
            registry.subscribe(Subscription::new(
                ConnectionId::new(conn),
                UserId::new("alice"),
                Some(ThreadId::new("t1")),
                None,
            ));
        }

        let report = router.deliver(&make_event("t1", "e1"));
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, vec![ConnectionId::new("c1")]);

        let notification = live.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(notification.event.event_id, EventId::new("e1"));
    }

    #[test]
    fn test_detached_connection_gets_nothing() {
        let dir = TempDir::new().unwrap();
        let (router, registry, threads) = make_router(&dir);

        threads
            .create(ThreadId::new("t1"), UserId::new("alice"))
            .unwrap();

        let _handle = router.attach(ConnectionId::new("c1"), UserId::new("alice"), 16);
        registry.subscribe(Subscription::new(
            ConnectionId::new("c1"),
            UserId::new("alice"),
            Some(ThreadId::new("t1")),
            None,
        ));

        router.detach(&ConnectionId::new("c1"));
        router.detach(&ConnectionId::new("c1")); // idempotent

        let report = router.deliver(&make_event("t1", "e1"));
        assert_eq!(report.delivered, 0);
        assert_eq!(report.failed, vec![ConnectionId::new("c1")]);
    }
}
