//! Per-thread event indices for efficient lookups.

use crate::error::{HubError, Result};
use crate::types::{EventId, EventLogEntry, Sequence, ThreadId, Timestamp};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the index file.
const INDEX_MAGIC: &[u8; 4] = b"EIX\0";

/// Current index format version.
const INDEX_VERSION: u8 = 1;

/// Metadata for one committed entry.
#[derive(Clone, Debug)]
struct EntryMeta {
    offset: u64,
    timestamp: Timestamp,
    event_id: EventId,
}

/// Per-thread ordered entries.
#[derive(Debug, Default)]
struct ThreadIndex {
    /// Sequence -> entry metadata, in sequence order.
    entries: BTreeMap<Sequence, EntryMeta>,

    /// Highest committed sequence.
    head: Sequence,
}

/// Index mapping thread sequences and event ids to file offsets.
///
/// Rebuildable from the log; persisted to bound reopen cost.
pub struct EventIndex {
    /// Path to the index file.
    path: PathBuf,

    /// Per-thread indices.
    threads: RwLock<HashMap<ThreadId, ThreadIndex>>,

    /// event_id -> (thread, sequence). Backs dedup and cursor resolution.
    by_event: RwLock<HashMap<EventId, (ThreadId, Sequence)>>,

    /// Log size the loaded index file covered. A mismatch with the actual
    /// log means the index is stale and must be rebuilt.
    covered: RwLock<u64>,
}

impl EventIndex {
    /// Create a new, empty index.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            threads: RwLock::new(HashMap::new()),
            by_event: RwLock::new(HashMap::new()),
            covered: RwLock::new(0),
        })
    }

    /// Load the index from file, or return an empty index if the file does
    /// not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let index = Self::new(path)?;
        if index.path.exists() {
            index.load_from_file()?;
        }
        Ok(index)
    }

    /// Add a committed entry.
    pub fn add(&self, entry: &EventLogEntry, offset: u64) {
        let thread_id = entry.event.thread_id.clone();
        let meta = EntryMeta {
            offset,
            timestamp: entry.event.timestamp,
            event_id: entry.event.event_id.clone(),
        };

        let mut threads = self.threads.write();
        let thread_index = threads.entry(thread_id.clone()).or_default();
        thread_index.entries.insert(entry.sequence, meta);
        if entry.sequence > thread_index.head {
            thread_index.head = entry.sequence;
        }
        drop(threads);

        self.by_event
            .write()
            .insert(entry.event.event_id.clone(), (thread_id, entry.sequence));
    }

    /// Highest committed sequence for a thread (0 if none).
    pub fn head(&self, thread_id: &ThreadId) -> Sequence {
        self.threads
            .read()
            .get(thread_id)
            .map(|t| t.head)
            .unwrap_or_default()
    }

    /// Lowest retained sequence for a thread.
    pub fn earliest(&self, thread_id: &ThreadId) -> Option<Sequence> {
        self.threads
            .read()
            .get(thread_id)
            .and_then(|t| t.entries.keys().next().copied())
    }

    /// Whether an event id has been committed.
    pub fn contains_event(&self, event_id: &EventId) -> bool {
        self.by_event.read().contains_key(event_id)
    }

    /// Resolve an event id to its thread and sequence.
    pub fn lookup_event(&self, event_id: &EventId) -> Option<(ThreadId, Sequence)> {
        self.by_event.read().get(event_id).cloned()
    }

    /// Offset of a specific committed entry.
    pub fn offset_of(&self, thread_id: &ThreadId, sequence: Sequence) -> Option<u64> {
        self.threads
            .read()
            .get(thread_id)
            .and_then(|t| t.entries.get(&sequence))
            .map(|m| m.offset)
    }

    /// Offsets of entries strictly after `since`, ascending, capped at
    /// `limit`.
    pub fn offsets_since(&self, thread_id: &ThreadId, since: Sequence, limit: usize) -> Vec<u64> {
        let threads = self.threads.read();
        let Some(thread_index) = threads.get(thread_id) else {
            return Vec::new();
        };

        thread_index
            .entries
            .range(since.next()..)
            .take(limit)
            .map(|(_, m)| m.offset)
            .collect()
    }

    /// The last sequence whose timestamp is at or before `at` (0 if none).
    pub fn seq_at_or_before(&self, thread_id: &ThreadId, at: Timestamp) -> Sequence {
        let threads = self.threads.read();
        let Some(thread_index) = threads.get(thread_id) else {
            return Sequence(0);
        };

        thread_index
            .entries
            .iter()
            .rev()
            .find(|(_, m)| m.timestamp <= at)
            .map(|(seq, _)| *seq)
            .unwrap_or_default()
    }

    /// Total number of indexed entries.
    pub fn count(&self) -> usize {
        self.by_event.read().len()
    }

    /// Number of threads with at least one entry.
    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }

    /// Drop all entries (used before a rebuild).
    pub fn clear(&self) {
        self.threads.write().clear();
        self.by_event.write().clear();
    }

    /// Log size the loaded index file covered.
    pub fn covered_size(&self) -> u64 {
        *self.covered.read()
    }

    /// Save the index to file, recording the log size it covers.
    pub fn save(&self, covered_size: u64) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;

        file.write_all(INDEX_MAGIC)?;
        file.write_all(&[INDEX_VERSION])?;
        file.write_all(&covered_size.to_le_bytes())?;

        let threads = self.threads.read();
        file.write_all(&(threads.len() as u64).to_le_bytes())?;

        for (thread_id, thread_index) in threads.iter() {
            let id_bytes = thread_id.as_str().as_bytes();
            file.write_all(&(id_bytes.len() as u16).to_le_bytes())?;
            file.write_all(id_bytes)?;

            file.write_all(&(thread_index.entries.len() as u64).to_le_bytes())?;
            for (seq, meta) in thread_index.entries.iter() {
                file.write_all(&seq.0.to_le_bytes())?;
                file.write_all(&meta.offset.to_le_bytes())?;
                file.write_all(&meta.timestamp.0.to_le_bytes())?;

                let event_id_bytes = meta.event_id.as_str().as_bytes();
                file.write_all(&(event_id_bytes.len() as u16).to_le_bytes())?;
                file.write_all(event_id_bytes)?;
            }
        }

        file.sync_all()?;
        *self.covered.write() = covered_size;
        Ok(())
    }

    /// Load the index from file.
    fn load_from_file(&self) -> Result<()> {
        let mut file = File::open(&self.path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != INDEX_MAGIC {
            return Err(HubError::InvalidFormat("Invalid index magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != INDEX_VERSION {
            return Err(HubError::InvalidFormat(format!(
                "Unsupported index version: {}",
                version[0]
            )));
        }

        let mut covered_bytes = [0u8; 8];
        file.read_exact(&mut covered_bytes)?;
        *self.covered.write() = u64::from_le_bytes(covered_bytes);

        let mut thread_count_bytes = [0u8; 8];
        file.read_exact(&mut thread_count_bytes)?;
        let thread_count = u64::from_le_bytes(thread_count_bytes) as usize;

        let mut threads = self.threads.write();
        let mut by_event = self.by_event.write();

        for _ in 0..thread_count {
            let thread_id = ThreadId::new(Self::read_str(&mut file)?);

            let mut entry_count_bytes = [0u8; 8];
            file.read_exact(&mut entry_count_bytes)?;
            let entry_count = u64::from_le_bytes(entry_count_bytes) as usize;

            let mut thread_index = ThreadIndex::default();
            for _ in 0..entry_count {
                let mut seq_bytes = [0u8; 8];
                file.read_exact(&mut seq_bytes)?;
                let seq = Sequence(u64::from_le_bytes(seq_bytes));

                let mut offset_bytes = [0u8; 8];
                file.read_exact(&mut offset_bytes)?;
                let offset = u64::from_le_bytes(offset_bytes);

                let mut ts_bytes = [0u8; 8];
                file.read_exact(&mut ts_bytes)?;
                let timestamp = Timestamp(i64::from_le_bytes(ts_bytes));

                let event_id = EventId::new(Self::read_str(&mut file)?);

                by_event.insert(event_id.clone(), (thread_id.clone(), seq));
                thread_index.entries.insert(
                    seq,
                    EntryMeta {
                        offset,
                        timestamp,
                        event_id,
                    },
                );
                if seq > thread_index.head {
                    thread_index.head = seq;
                }
            }

            threads.insert(thread_id, thread_index);
        }

        Ok(())
    }

    fn read_str(file: &mut File) -> Result<String> {
        let mut len_bytes = [0u8; 2];
        file.read_exact(&mut len_bytes)?;
        let len = u16::from_le_bytes(len_bytes) as usize;
        let mut bytes = vec![0u8; len];
        file.read_exact(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentEvent, PayloadEncoding, UserId};
    use tempfile::TempDir;

    fn make_entry(thread: &str, seq: u64, ts: i64) -> EventLogEntry {
        let thread_id = ThreadId::new(thread);
        EventLogEntry {
            sequence: Sequence(seq),
            event: AgentEvent {
                event_id: EventId::new(format!("{}-{}", thread, seq)),
                thread_id,
                user_id: UserId::new("alice"),
                timestamp: Timestamp(ts),
                kind: "message".to_string(),
                payload: b"{}".to_vec(),
                encoding: PayloadEncoding::Json,
            },
        }
    }

    #[test]
    fn test_add_and_lookup() {
        let dir = TempDir::new().unwrap();
        let index = EventIndex::new(dir.path().join("events.idx")).unwrap();

        let entry = make_entry("t1", 1, 100);
        index.add(&entry, 0);

        assert_eq!(index.head(&ThreadId::new("t1")), Sequence(1));
        assert!(index.contains_event(&EventId::new("t1-1")));
        assert_eq!(
            index.lookup_event(&EventId::new("t1-1")),
            Some((ThreadId::new("t1"), Sequence(1)))
        );
        assert_eq!(index.offset_of(&ThreadId::new("t1"), Sequence(1)), Some(0));
    }

    #[test]
    fn test_offsets_since_are_ordered_and_capped() {
        let dir = TempDir::new().unwrap();
        let index = EventIndex::new(dir.path().join("events.idx")).unwrap();

        for i in 1..=10 {
            index.add(&make_entry("t1", i, i as i64 * 10), i * 100);
        }

        let thread = ThreadId::new("t1");
        let offsets = index.offsets_since(&thread, Sequence(3), 4);
        assert_eq!(offsets, vec![400, 500, 600, 700]);

        // Strictly after the cursor
        let all = index.offsets_since(&thread, Sequence(0), usize::MAX);
        assert_eq!(all.len(), 10);
        assert_eq!(all[0], 100);
    }

    #[test]
    fn test_timestamp_resolution() {
        let dir = TempDir::new().unwrap();
        let index = EventIndex::new(dir.path().join("events.idx")).unwrap();

        for i in 1..=5 {
            index.add(&make_entry("t1", i, i as i64 * 10), i * 100);
        }

        let thread = ThreadId::new("t1");
        assert_eq!(index.seq_at_or_before(&thread, Timestamp(35)), Sequence(3));
        assert_eq!(index.seq_at_or_before(&thread, Timestamp(50)), Sequence(5));
        assert_eq!(index.seq_at_or_before(&thread, Timestamp(5)), Sequence(0));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.idx");

        {
            let index = EventIndex::new(&path).unwrap();
            index.add(&make_entry("t1", 1, 10), 0);
            index.add(&make_entry("t1", 2, 20), 100);
            index.add(&make_entry("t2", 1, 30), 200);
            index.save(300).unwrap();
        }

        {
            let index = EventIndex::load(&path).unwrap();
            assert_eq!(index.covered_size(), 300);
            assert_eq!(index.count(), 3);
            assert_eq!(index.head(&ThreadId::new("t1")), Sequence(2));
            assert_eq!(index.offset_of(&ThreadId::new("t2"), Sequence(1)), Some(200));
            assert!(index.contains_event(&EventId::new("t1-2")));
        }
    }
}
