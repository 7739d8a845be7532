//! Thread ownership metadata.
//!
//! Every thread has exactly one owning user, fixed at creation. Ingestion,
//! subscription, and catch-up all authorize against this table.

mod manager;

pub use manager::ThreadManager;
