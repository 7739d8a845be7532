//! Live fan-out of accepted events to subscriber connections.

mod router;

pub use router::{BroadcastRouter, ConnectionHandle, DeliveryReport, EventNotification};
