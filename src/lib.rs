//! # Threadcast
//!
//! A durable, per-thread agent event log with real-time fan-out and
//! snapshot catch-up.
//!
//! ## Core Concepts
//!
//! - **Events**: Append-only, per-thread ordered records with opaque
//!   payloads; the event id is the idempotency key
//! - **Fan-out**: One accepted event is routed concurrently to the durable
//!   store and to every authorized subscriber connection, with independent
//!   failure handling
//! - **Snapshots**: Periodic folds of a thread's log that bound replay cost
//!   for catch-up
//! - **Ownership**: Every thread has one owning user; publish, subscribe,
//!   and catch-up are all authorized against it
//!
//! ## Example
//!
//! ```ignore
//! use threadcast::{EventHub, EventInput, HubConfig, ConnectionId, ThreadId, UserId};
//!
//! let hub = EventHub::open_or_create(HubConfig {
//!     path: "./my-hub".into(),
//!     ..Default::default()
//! })?;
//!
//! let alice = UserId::new("alice");
//! hub.create_thread(&alice, ThreadId::new("t1"))?;
//!
//! // A subscriber connection
//! let handle = hub.attach(ConnectionId::new("c1"), alice.clone());
//! hub.subscribe(&handle.connection_id, &alice, Some(ThreadId::new("t1")), None)?;
//!
//! // Publish; the notification arrives on the handle
//! hub.publish(&alice, &ThreadId::new("t1"), EventInput::json("message", &serde_json::json!({
//!     "text": "Hello, world!"
//! }))?)?;
//! ```

pub mod broadcast;
pub mod catchup;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod hub;
pub mod ingest;
pub mod metrics;
pub mod registry;
pub mod snapshots;
pub mod threads;
pub mod types;

// Re-exports
pub use broadcast::{BroadcastRouter, ConnectionHandle, DeliveryReport, EventNotification};
pub use catchup::{CatchupService, Replay};
pub use dispatch::{DispatchOptions, Dispatcher};
pub use error::{HubError, Result};
pub use events::{CompactionResult, EventIndex, EventLog, EventStore};
pub use hub::{EventHub, HubConfig};
pub use ingest::{IngestEndpoint, PublishAck};
pub use metrics::{HubMetrics, MetricsSnapshot};
pub use registry::{Subscription, SubscriptionRegistry};
pub use snapshots::{apply_event, fold_entries, SnapshotStore};
pub use threads::ThreadManager;
pub use types::*;
