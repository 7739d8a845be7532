//! Append-only event log file.

use crate::error::{HubError, Result};
use crate::types::{
    AgentEvent, EventId, EventLogEntry, PayloadEncoding, Sequence, ThreadId, Timestamp, UserId,
};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for each log entry.
const ENTRY_MAGIC: &[u8; 4] = b"EVT\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Append-only event log.
///
/// One file for all threads; per-thread ordering lives in the index. Entries
/// are framed with magic, version, length-prefixed fields, and a crc32
/// checksum over the payload.
pub struct EventLog {
    /// Path to the log file.
    path: PathBuf,

    /// Log file handle.
    file: RwLock<File>,

    /// Current file size (for appending).
    file_size: RwLock<u64>,

    /// Number of writes since last sync.
    writes_since_sync: RwLock<u64>,

    /// Sync every N writes.
    sync_interval: u64,
}

impl EventLog {
    /// Default sync interval - sync every 100 writes for balance of
    /// durability and performance.
    const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create an event log with the default sync interval.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create an event log with a custom sync interval.
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();

        Ok(Self {
            path,
            file: RwLock::new(file),
            file_size: RwLock::new(file_size),
            writes_since_sync: RwLock::new(0),
            sync_interval: if sync_interval == 0 { 1 } else { sync_interval },
        })
    }

    /// Append an entry to the log, returning the offset it was written at.
    pub fn append(&self, entry: &EventLogEntry) -> Result<u64> {
        let mut file = self.file.write();

        let offset = *self.file_size.read();
        file.seek(SeekFrom::Start(offset))?;

        Self::write_entry(&mut file, entry)?;

        let new_size = file.stream_position()?;
        *self.file_size.write() = new_size;

        // Sync periodically based on sync_interval
        let mut writes = self.writes_since_sync.write();
        *writes += 1;
        if *writes >= self.sync_interval {
            file.sync_all()?;
            *writes = 0;
        }

        Ok(offset)
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let file = self.file.write();
        file.sync_all()?;
        *self.writes_since_sync.write() = 0;
        Ok(())
    }

    /// Read the entry at a given offset.
    pub fn read_at(&self, offset: u64) -> Result<EventLogEntry> {
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        let (entry, _) = Self::read_entry(&mut file)?;
        Ok(entry)
    }

    /// Iterate all entries from a given offset.
    pub fn iter_from(&self, offset: u64) -> LogIterator<'_> {
        LogIterator {
            log: self,
            offset,
            end: *self.file_size.read(),
        }
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        *self.file_size.read()
    }

    /// Path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_entry(file: &mut File, entry: &EventLogEntry) -> Result<()> {
        let event = &entry.event;

        file.write_all(ENTRY_MAGIC)?;
        file.write_all(&[LOG_VERSION])?;

        // Flags (reserved)
        file.write_all(&[0u8])?;

        file.write_all(&entry.sequence.0.to_le_bytes())?;
        file.write_all(&event.timestamp.0.to_le_bytes())?;

        let encoding_byte = match event.encoding {
            PayloadEncoding::Json => 0u8,
            PayloadEncoding::MessagePack => 1u8,
            PayloadEncoding::Raw => 2u8,
        };
        file.write_all(&[encoding_byte])?;

        Self::write_str(file, event.event_id.as_str())?;
        Self::write_str(file, event.thread_id.as_str())?;
        Self::write_str(file, event.user_id.as_str())?;
        Self::write_str(file, &event.kind)?;

        file.write_all(&(event.payload.len() as u32).to_le_bytes())?;
        file.write_all(&event.payload)?;

        let checksum = crc32fast::hash(&event.payload);
        file.write_all(&checksum.to_le_bytes())?;

        Ok(())
    }

    /// Read an entry at the current position; also returns the position of
    /// the next entry.
    fn read_entry(file: &mut File) -> Result<(EventLogEntry, u64)> {
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != ENTRY_MAGIC {
            return Err(HubError::InvalidFormat("Invalid log entry magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(HubError::InvalidFormat(format!(
                "Unsupported log version: {}",
                version[0]
            )));
        }

        let mut _flags = [0u8; 1];
        file.read_exact(&mut _flags)?;

        let mut seq_bytes = [0u8; 8];
        file.read_exact(&mut seq_bytes)?;
        let sequence = Sequence(u64::from_le_bytes(seq_bytes));

        let mut ts_bytes = [0u8; 8];
        file.read_exact(&mut ts_bytes)?;
        let timestamp = Timestamp(i64::from_le_bytes(ts_bytes));

        let mut encoding_byte = [0u8; 1];
        file.read_exact(&mut encoding_byte)?;
        let encoding = match encoding_byte[0] {
            0 => PayloadEncoding::Json,
            1 => PayloadEncoding::MessagePack,
            _ => PayloadEncoding::Raw,
        };

        let event_id = EventId::new(Self::read_str(file)?);
        let thread_id = ThreadId::new(Self::read_str(file)?);
        let user_id = UserId::new(Self::read_str(file)?);
        let kind = Self::read_str(file)?;

        let mut payload_len_bytes = [0u8; 4];
        file.read_exact(&mut payload_len_bytes)?;
        let payload_len = u32::from_le_bytes(payload_len_bytes) as usize;
        let mut payload = vec![0u8; payload_len];
        file.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&payload);

        if stored_checksum != computed_checksum {
            return Err(HubError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let next_offset = file.stream_position()?;

        let entry = EventLogEntry {
            sequence,
            event: AgentEvent {
                event_id,
                thread_id,
                user_id,
                timestamp,
                kind,
                payload,
                encoding,
            },
        };

        Ok((entry, next_offset))
    }

    fn write_str(file: &mut File, s: &str) -> Result<()> {
        let bytes = s.as_bytes();
        file.write_all(&(bytes.len() as u16).to_le_bytes())?;
        file.write_all(bytes)?;
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

/// Iterator over entries in the log.
pub struct LogIterator<'a> {
    log: &'a EventLog,
    offset: u64,
    end: u64,
}

impl<'a> Iterator for LogIterator<'a> {
    type Item = Result<(u64, EventLogEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }

        let current_offset = self.offset;
        let mut file = self.log.file.write();
        if let Err(e) = file.seek(SeekFrom::Start(current_offset)) {
            self.offset = self.end;
            return Some(Err(e.into()));
        }

        match EventLog::read_entry(&mut file) {
            Ok((entry, next_offset)) => {
                self.offset = next_offset;
                Some(Ok((current_offset, entry)))
            }
            Err(e) => {
                // Stop iteration on error
                self.offset = self.end;
                Some(Err(e))
            }
        }
    }
}
