//! Error types for the event hub.

use crate::types::{ConnectionId, EventId, ThreadId, UserId};
use thiserror::Error;

/// Main error type for hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("User {user} does not own thread {thread}")]
    Unauthorized { thread: ThreadId, user: UserId },

    #[error("Thread not found: {0}")]
    ThreadNotFound(ThreadId),

    #[error("Thread already exists: {0}")]
    ThreadExists(ThreadId),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid hub format: {0}")]
    InvalidFormat(String),

    #[error("Hub is locked by another process")]
    Locked,

    #[error("Hub not initialized")]
    NotInitialized,

    #[error("Hub is shutting down")]
    ShuttingDown,
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for HubError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        HubError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for HubError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        HubError::Deserialization(e.to_string())
    }
}

/// Result type for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;
