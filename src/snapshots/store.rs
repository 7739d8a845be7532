//! On-disk snapshot storage, one file per thread.

use crate::error::{HubError, Result};
use crate::types::{ThreadId, ThreadSnapshot};
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Magic bytes for snapshot files.
const SNAPSHOT_MAGIC: &[u8; 4] = b"SNP\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// Stores the latest snapshot per thread.
///
/// Writes go to a temp file and are renamed into place, so a crash never
/// leaves a truncated snapshot. An older snapshot is simply replaced once
/// its successor lands.
pub struct SnapshotStore {
    /// Base directory for snapshot files.
    path: PathBuf,

    /// LRU cache of recently accessed snapshots.
    cache: Mutex<LruCache<ThreadId, ThreadSnapshot>>,
}

impl SnapshotStore {
    /// Create a snapshot store at the given directory.
    pub fn new(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap();

        Ok(Self {
            path,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Store a snapshot, replacing any previous one for the thread.
    pub fn store(&self, snapshot: &ThreadSnapshot) -> Result<()> {
        let final_path = self.snapshot_path(&snapshot.thread_id);
        let tmp_path = final_path.with_extension("snap.tmp");

        let encoded =
            rmp_serde::to_vec(snapshot).map_err(|e| HubError::Serialization(e.to_string()))?;

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(SNAPSHOT_MAGIC)?;
            file.write_all(&[SNAPSHOT_VERSION])?;
            file.write_all(&(encoded.len() as u64).to_le_bytes())?;
            file.write_all(&encoded)?;

            let checksum = crc32fast::hash(&encoded);
            file.write_all(&checksum.to_le_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &final_path)?;

        self.cache
            .lock()
            .put(snapshot.thread_id.clone(), snapshot.clone());

        Ok(())
    }

    /// Get the latest snapshot for a thread, if one exists.
    pub fn latest(&self, thread_id: &ThreadId) -> Result<Option<ThreadSnapshot>> {
        if let Some(cached) = self.cache.lock().get(thread_id).cloned() {
            return Ok(Some(cached));
        }

        let path = self.snapshot_path(thread_id);
        if !path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(HubError::InvalidFormat("Invalid snapshot magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(HubError::InvalidFormat(format!(
                "Unsupported snapshot version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&encoded);

        if stored_checksum != computed_checksum {
            return Err(HubError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let snapshot: ThreadSnapshot =
            rmp_serde::from_slice(&encoded).map_err(|e| HubError::Deserialization(e.to_string()))?;

        self.cache.lock().put(thread_id.clone(), snapshot.clone());

        Ok(Some(snapshot))
    }

    /// Number of stored snapshots.
    pub fn count(&self) -> Result<usize> {
        let mut count = 0;
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.path().extension().map(|e| e == "snap").unwrap_or(false) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Snapshot file path for a thread. Thread ids are caller-supplied
    /// opaque strings, so file names use a hash of the id.
    fn snapshot_path(&self, thread_id: &ThreadId) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(thread_id.as_str().as_bytes());
        let digest = hasher.finalize();
        self.path.join(format!("{}.snap", hex::encode(&digest[..16])))
    }
}
