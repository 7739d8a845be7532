//! Core types for the event hub.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a conversation thread.
///
/// Opaque; assigned by the caller (session layer).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        ThreadId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({})", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a user. Opaque; supplied by the session layer.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a live connection. Opaque; supplied by the session
/// layer, which guarantees one per duplex channel.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        ConnectionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique identifier for an event; the idempotency key.
///
/// Assigned by the producer, or generated at ingestion when absent.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        EventId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate an event id from the thread, a timestamp, and a
    /// process-local nonce. 128 bits of a SHA-256 digest, hex-encoded.
    pub fn generate(thread: &ThreadId, timestamp: Timestamp, nonce: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(thread.as_str().as_bytes());
        hasher.update(timestamp.0.to_le_bytes());
        hasher.update(nonce.to_le_bytes());
        let digest = hasher.finalize();
        EventId(hex::encode(&digest[..16]))
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position in a thread's log. Strictly increasing, no gaps for committed
/// events. Sequence 0 means "before the first event".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Sequence(self.0 - 1))
        } else {
            None
        }
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Payload encoding format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadEncoding {
    Json,
    MessagePack,
    Raw,
}

impl Default for PayloadEncoding {
    fn default() -> Self {
        PayloadEncoding::Json
    }
}

/// An event produced for a thread.
///
/// The payload is opaque to the hub: `kind` is the producer's variant tag,
/// the bytes are persisted and fanned out as-is.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Globally unique identifier; the idempotency key.
    pub event_id: EventId,

    /// The thread this event belongs to.
    pub thread_id: ThreadId,

    /// The thread's owning user (the producer).
    pub user_id: UserId,

    /// When the event was accepted.
    pub timestamp: Timestamp,

    /// Producer-defined variant tag (e.g. "message", "tool_call").
    pub kind: String,

    /// Producer-defined payload.
    pub payload: Vec<u8>,

    /// Payload encoding.
    pub encoding: PayloadEncoding,
}

/// Input for publishing a new event (before identity is assigned).
#[derive(Clone, Debug)]
pub struct EventInput {
    /// Producer-assigned event id; generated at ingestion if absent.
    pub event_id: Option<EventId>,
    pub kind: String,
    pub payload: Vec<u8>,
    pub encoding: PayloadEncoding,
}

impl EventInput {
    /// Create an event input with a JSON payload.
    pub fn json(
        kind: impl Into<String>,
        payload: &impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: None,
            kind: kind.into(),
            payload: serde_json::to_vec(payload)?,
            encoding: PayloadEncoding::Json,
        })
    }

    /// Create an event input with raw bytes.
    pub fn raw(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            event_id: None,
            kind: kind.into(),
            payload,
            encoding: PayloadEncoding::Raw,
        }
    }

    /// Set an explicit event id (idempotent publish).
    pub fn with_event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }
}

/// The durable form of an event: the event plus its committed position.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Position within the thread's log.
    pub sequence: Sequence,

    /// The committed event.
    pub event: AgentEvent,
}

/// Compacted representation of a thread's state as of a known sequence.
///
/// `state` is a JSON array built by folding committed events in order;
/// replaying `events_since(as_of)` on top of it reconstructs current state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub thread_id: ThreadId,

    /// All events up to and including this sequence are folded in.
    pub as_of: Sequence,

    /// JSON-encoded folded state.
    pub state: Vec<u8>,

    /// When the snapshot was built.
    pub created: Timestamp,
}

impl ThreadSnapshot {
    /// The empty state of a thread before any event.
    pub fn genesis(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            as_of: Sequence(0),
            state: b"[]".to_vec(),
            created: Timestamp::now(),
        }
    }
}

/// Thread metadata. Ownership is immutable for the thread's lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadMeta {
    pub thread_id: ThreadId,
    pub owner: UserId,
    pub created: Timestamp,
}

/// A catch-up cursor, resolved to a per-thread sequence.
#[derive(Clone, Debug)]
pub enum EventCursor {
    /// Everything strictly after this sequence.
    Sequence(Sequence),

    /// Everything strictly after this committed event.
    Event(EventId),

    /// Everything after the last event at or before this time.
    Time(Timestamp),
}

/// Hub statistics.
#[derive(Clone, Debug, Default)]
pub struct HubStats {
    pub thread_count: u64,
    pub event_count: u64,
    pub connection_count: u64,
    pub subscription_count: u64,
    pub snapshot_count: u64,
    pub log_size_bytes: u64,
}
