//! Event ingestion: ownership check, identity assignment, dedup, handoff.

mod endpoint;

pub use endpoint::{IngestEndpoint, PublishAck};
