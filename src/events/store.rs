//! Event store: append-only log plus index and snapshots.

use crate::error::{HubError, Result};
use crate::snapshots::{fold_entries, SnapshotStore};
use crate::types::{
    AgentEvent, EventCursor, EventId, EventLogEntry, Sequence, ThreadId, ThreadSnapshot, Timestamp,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use super::index::EventIndex;
use super::log::EventLog;

/// Result of folding a thread's recent events into a snapshot.
#[derive(Clone, Debug)]
pub struct CompactionResult {
    pub thread_id: ThreadId,

    /// Sequence the new snapshot covers up to.
    pub as_of: Sequence,

    /// Events folded in by this pass.
    pub absorbed: u64,
}

/// Durable event store.
///
/// Sequence assignment is atomic per thread, but ordering under concurrent
/// appends for the same thread is the dispatcher's job (all events for one
/// thread go through one partition); the store's write lock only serializes
/// appends against compaction and pruning.
pub struct EventStore {
    /// Base directory.
    dir: PathBuf,

    /// The log file. Swapped out wholesale by pruning.
    log: RwLock<EventLog>,

    /// Sequence/id indices.
    index: EventIndex,

    /// Latest snapshot per thread.
    snapshots: SnapshotStore,

    /// Serializes append, compact, and prune.
    write_lock: Mutex<()>,

    /// Events that exhausted their persist retries, per thread. These are
    /// reported to catch-up callers rather than silently hidden.
    gaps: RwLock<HashMap<ThreadId, Vec<EventId>>>,
}

impl EventStore {
    const LOG_FILE: &'static str = "events.log";
    const INDEX_FILE: &'static str = "events.idx";
    const SNAPSHOT_DIR: &'static str = "snapshots";

    /// Open or create an event store under `dir`.
    pub fn open(dir: impl AsRef<Path>, snapshot_cache_size: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let log = EventLog::open(dir.join(Self::LOG_FILE))?;
        let index = EventIndex::load(dir.join(Self::INDEX_FILE))?;
        let snapshots = SnapshotStore::new(dir.join(Self::SNAPSHOT_DIR), snapshot_cache_size)?;

        let store = Self {
            dir,
            log: RwLock::new(log),
            index,
            snapshots,
            write_lock: Mutex::new(()),
            gaps: RwLock::new(HashMap::new()),
        };

        // A missing or stale index is rebuilt by scanning the log.
        if store.index.covered_size() != store.log.read().size() {
            store.rebuild_index()?;
        }

        Ok(store)
    }

    /// Append an event, assigning the next sequence for its thread.
    ///
    /// Re-appending a committed event id is a no-op that returns the
    /// existing entry.
    pub fn append(&self, event: &AgentEvent) -> Result<EventLogEntry> {
        let _guard = self.write_lock.lock();

        if let Some((thread_id, sequence)) = self.index.lookup_event(&event.event_id) {
            let offset = self
                .index
                .offset_of(&thread_id, sequence)
                .ok_or_else(|| HubError::Corruption(format!("Dangling index entry for {}", event.event_id)))?;
            return self.log.read().read_at(offset);
        }

        let sequence = self.index.head(&event.thread_id).next();
        let entry = EventLogEntry {
            sequence,
            event: event.clone(),
        };

        let offset = self.log.read().append(&entry)?;
        self.index.add(&entry, offset);

        Ok(entry)
    }

    /// Whether an event id has been committed.
    pub fn contains_event(&self, event_id: &EventId) -> bool {
        self.index.contains_event(event_id)
    }

    /// Highest committed sequence for a thread (0 if none).
    pub fn head(&self, thread_id: &ThreadId) -> Sequence {
        self.index.head(thread_id)
    }

    /// Lowest retained sequence for a thread.
    pub fn earliest(&self, thread_id: &ThreadId) -> Option<Sequence> {
        self.index.earliest(thread_id)
    }

    /// Resolve a cursor to a per-thread sequence.
    ///
    /// Event-id cursors must reference a committed event of this thread.
    pub fn resolve_cursor(&self, thread_id: &ThreadId, cursor: &EventCursor) -> Result<Sequence> {
        match cursor {
            EventCursor::Sequence(seq) => Ok(*seq),
            EventCursor::Event(event_id) => match self.index.lookup_event(event_id) {
                Some((thread, seq)) if &thread == thread_id => Ok(seq),
                _ => Err(HubError::EventNotFound(event_id.clone())),
            },
            EventCursor::Time(at) => Ok(self.index.seq_at_or_before(thread_id, *at)),
        }
    }

    /// Events strictly after `since`, ascending, capped at `limit`.
    pub fn events_since(
        &self,
        thread_id: &ThreadId,
        since: Sequence,
        limit: usize,
    ) -> Result<Vec<EventLogEntry>> {
        // Take the log guard first: pruning swaps the log and rebuilds the
        // index while holding the write half, so offsets resolved under a
        // held read guard always match the file being read.
        let log = self.log.read();
        let offsets = self.index.offsets_since(thread_id, since, limit);

        let mut entries = Vec::with_capacity(offsets.len());
        for offset in offsets {
            entries.push(log.read_at(offset)?);
        }

        Ok(entries)
    }

    /// Latest snapshot for a thread.
    pub fn latest_snapshot(&self, thread_id: &ThreadId) -> Result<Option<ThreadSnapshot>> {
        self.snapshots.latest(thread_id)
    }

    /// Committed events not yet absorbed by a snapshot.
    pub fn events_behind(&self, thread_id: &ThreadId) -> Result<u64> {
        let head = self.index.head(thread_id);
        let as_of = self
            .snapshots
            .latest(thread_id)?
            .map(|s| s.as_of)
            .unwrap_or_default();
        Ok(head.0.saturating_sub(as_of.0))
    }

    /// Fold all events past the latest snapshot into a new one.
    ///
    /// Returns `None` when the thread has nothing new to absorb.
    pub fn compact(&self, thread_id: &ThreadId) -> Result<Option<CompactionResult>> {
        let _guard = self.write_lock.lock();

        let head = self.index.head(thread_id);
        let base = self
            .snapshots
            .latest(thread_id)?
            .unwrap_or_else(|| ThreadSnapshot::genesis(thread_id.clone()));

        if head <= base.as_of {
            return Ok(None);
        }

        let entries = self.events_since(thread_id, base.as_of, usize::MAX)?;
        let state = fold_entries(base.state, &entries)?;

        let snapshot = ThreadSnapshot {
            thread_id: thread_id.clone(),
            as_of: head,
            state,
            created: Timestamp::now(),
        };
        self.snapshots.store(&snapshot)?;

        info!(thread = %thread_id, as_of = head.0, absorbed = entries.len(), "compacted thread");

        Ok(Some(CompactionResult {
            thread_id: thread_id.clone(),
            as_of: head,
            absorbed: entries.len() as u64,
        }))
    }

    /// Remove entries older than `retention` that a snapshot has absorbed.
    ///
    /// Never removes entries newer than the thread's latest snapshot.
    /// Rewrites the log and rebuilds the index; returns the pruned count.
    pub fn prune_expired(&self, retention: Duration) -> Result<u64> {
        let _guard = self.write_lock.lock();

        let cutoff = Timestamp(Timestamp::now().0 - retention.as_micros() as i64);
        let mut snapshot_heads: HashMap<ThreadId, Sequence> = HashMap::new();

        let entries: Vec<EventLogEntry> = {
            let log = self.log.read();
            log.iter_from(0)
                .map(|r| r.map(|(_, entry)| entry))
                .collect::<Result<Vec<_>>>()?
        };

        let mut retained = Vec::with_capacity(entries.len());
        let mut pruned = 0u64;

        for entry in entries {
            let thread_id = &entry.event.thread_id;
            let absorbed_up_to = match snapshot_heads.get(thread_id) {
                Some(seq) => *seq,
                None => {
                    let seq = self
                        .snapshots
                        .latest(thread_id)?
                        .map(|s| s.as_of)
                        .unwrap_or_default();
                    snapshot_heads.insert(thread_id.clone(), seq);
                    seq
                }
            };

            if entry.event.timestamp < cutoff && entry.sequence <= absorbed_up_to {
                pruned += 1;
            } else {
                retained.push(entry);
            }
        }

        if pruned == 0 {
            return Ok(0);
        }

        let log_path = self.dir.join(Self::LOG_FILE);
        let tmp_path = self.dir.join(format!("{}.tmp", Self::LOG_FILE));
        if tmp_path.exists() {
            fs::remove_file(&tmp_path)?;
        }

        {
            let new_log = EventLog::open(&tmp_path)?;
            for entry in &retained {
                new_log.append(entry)?;
            }
            new_log.sync()?;
        }

        let mut log = self.log.write();
        fs::rename(&tmp_path, &log_path)?;
        *log = EventLog::open(&log_path)?;

        self.index.clear();
        for result in log.iter_from(0) {
            let (offset, entry) = result?;
            self.index.add(&entry, offset);
        }
        let covered = log.size();
        drop(log);

        self.index.save(covered)?;

        info!(pruned, retained = retained.len(), "pruned expired events");

        Ok(pruned)
    }

    /// Record an event that exhausted its persist retries.
    pub fn record_gap(&self, thread_id: &ThreadId, event_id: EventId) {
        self.gaps
            .write()
            .entry(thread_id.clone())
            .or_default()
            .push(event_id);
    }

    /// Known failed-to-persist event ids for a thread.
    pub fn gaps(&self, thread_id: &ThreadId) -> Vec<EventId> {
        self.gaps
            .read()
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Sync log and index to disk.
    pub fn sync(&self) -> Result<()> {
        let log = self.log.read();
        log.sync()?;
        self.index.save(log.size())?;
        Ok(())
    }

    /// Total committed entries.
    pub fn count(&self) -> usize {
        self.index.count()
    }

    /// Log size in bytes.
    pub fn log_size(&self) -> u64 {
        self.log.read().size()
    }

    /// Number of stored snapshots.
    pub fn snapshot_count(&self) -> Result<usize> {
        self.snapshots.count()
    }

    /// Rebuild the index by scanning the log.
    fn rebuild_index(&self) -> Result<()> {
        self.index.clear();
        let log = self.log.read();
        for result in log.iter_from(0) {
            let (offset, entry) = result?;
            self.index.add(&entry, offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PayloadEncoding, UserId};
    use tempfile::TempDir;

    fn make_event(thread: &str, id: &str, payload: &[u8]) -> AgentEvent {
        AgentEvent {
            event_id: EventId::new(id),
            thread_id: ThreadId::new(thread),
            user_id: UserId::new("alice"),
            timestamp: Timestamp::now(),
            kind: "message".to_string(),
            payload: payload.to_vec(),
            encoding: PayloadEncoding::Raw,
        }
    }

    #[test]
    fn test_append_assigns_gapless_sequences() {
        let dir = TempDir::new().unwrap();
        let store = EventStore::open(dir.path().join("store"), 16).unwrap();

        for i in 1..=5 {
            let entry = store
                .append(&make_event("t1", &format!("e{}", i), b"x"))
                .unwrap();
            assert_eq!(entry.sequence, Sequence(i));
        }

        // Another thread sequences independently
        let entry = store.append(&make_event("t2", "f1", b"y")).unwrap();
        assert_eq!(entry.sequence, Sequence(1));
    }

    #[test]
    fn test_append_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = EventStore::open(dir.path().join("store"), 16).unwrap();

        let first = store.append(&make_event("t1", "X", b"p")).unwrap();
        let second = store.append(&make_event("t1", "X", b"p")).unwrap();

        assert_eq!(first.sequence, second.sequence);
        assert_eq!(store.count(), 1);
        assert_eq!(store.head(&ThreadId::new("t1")), Sequence(1));
    }

    #[test]
    fn test_events_since_cursor_semantics() {
        let dir = TempDir::new().unwrap();
        let store = EventStore::open(dir.path().join("store"), 16).unwrap();

        for i in 1..=4 {
            store
                .append(&make_event("t1", &format!("e{}", i), b"x"))
                .unwrap();
        }

        let thread = ThreadId::new("t1");
        let entries = store.events_since(&thread, Sequence(1), usize::MAX).unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.sequence.0).collect();
        assert_eq!(seqs, vec![2, 3, 4]);

        let since_event = store
            .resolve_cursor(&thread, &EventCursor::Event(EventId::new("e2")))
            .unwrap();
        assert_eq!(since_event, Sequence(2));

        let unknown = store.resolve_cursor(&thread, &EventCursor::Event(EventId::new("nope")));
        assert!(matches!(unknown, Err(HubError::EventNotFound(_))));
    }

    #[test]
    fn test_compact_absorbs_events() {
        let dir = TempDir::new().unwrap();
        let store = EventStore::open(dir.path().join("store"), 16).unwrap();

        let thread = ThreadId::new("t1");
        for i in 1..=3 {
            store
                .append(&make_event("t1", &format!("e{}", i), br#"{"n":1}"#))
                .unwrap();
        }

        let result = store.compact(&thread).unwrap().unwrap();
        assert_eq!(result.as_of, Sequence(3));
        assert_eq!(result.absorbed, 3);

        // Nothing new: no-op
        assert!(store.compact(&thread).unwrap().is_none());

        let snapshot = store.latest_snapshot(&thread).unwrap().unwrap();
        assert_eq!(snapshot.as_of, Sequence(3));
        assert_eq!(store.events_behind(&thread).unwrap(), 0);
    }

    #[test]
    fn test_prune_respects_snapshot_boundary() {
        let dir = TempDir::new().unwrap();
        let store = EventStore::open(dir.path().join("store"), 16).unwrap();

        let thread = ThreadId::new("t1");
        for i in 1..=4 {
            store
                .append(&make_event("t1", &format!("e{}", i), b"x"))
                .unwrap();
        }

        // No snapshot yet: nothing is prunable even with zero retention
        assert_eq!(store.prune_expired(Duration::from_secs(0)).unwrap(), 0);

        store.compact(&thread).unwrap();
        store
            .append(&make_event("t1", "e5", b"x"))
            .unwrap();

        // Everything the snapshot absorbed is now expired; e5 is newer than
        // the snapshot and must survive
        let pruned = store.prune_expired(Duration::from_secs(0)).unwrap();
        assert_eq!(pruned, 4);
        assert_eq!(store.earliest(&thread), Some(Sequence(5)));

        let entries = store.events_since(&thread, Sequence(0), usize::MAX).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event.event_id, EventId::new("e5"));

        // Sequences continue after the pruned range
        let entry = store.append(&make_event("t1", "e6", b"x")).unwrap();
        assert_eq!(entry.sequence, Sequence(6));
    }

    #[test]
    fn test_reopen_rebuilds_from_log_without_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");

        {
            let store = EventStore::open(&path, 16).unwrap();
            for i in 1..=3 {
                store
                    .append(&make_event("t1", &format!("e{}", i), b"x"))
                    .unwrap();
            }
            store.sync().unwrap();
        }

        // Simulate a lost index
        fs::remove_file(path.join("events.idx")).unwrap();

        {
            let store = EventStore::open(&path, 16).unwrap();
            assert_eq!(store.count(), 3);
            assert_eq!(store.head(&ThreadId::new("t1")), Sequence(3));
        }
    }
}
