//! Thread manager implementation.

use crate::error::{HubError, Result};
use crate::types::{ThreadId, ThreadMeta, Timestamp, UserId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the thread table file.
const THREAD_TABLE_MAGIC: &[u8; 4] = b"THR\0";

/// Current thread table format version.
const THREAD_TABLE_VERSION: u8 = 1;

/// Thread table stored on disk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ThreadTable {
    threads: HashMap<ThreadId, ThreadMeta>,
}

/// Manages thread metadata and ownership checks.
pub struct ThreadManager {
    /// Path to the thread table file.
    path: PathBuf,

    /// In-memory table.
    table: RwLock<ThreadTable>,
}

impl ThreadManager {
    /// Create a new, empty thread manager.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            table: RwLock::new(ThreadTable::default()),
        })
    }

    /// Load the thread manager from file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let manager = Self {
            path: path.clone(),
            table: RwLock::new(ThreadTable::default()),
        };

        if path.exists() {
            manager.load_from_file()?;
        }

        Ok(manager)
    }

    /// Create a new thread owned by `owner`.
    pub fn create(&self, thread_id: ThreadId, owner: UserId) -> Result<ThreadMeta> {
        let mut table = self.table.write();

        if table.threads.contains_key(&thread_id) {
            return Err(HubError::ThreadExists(thread_id));
        }

        let meta = ThreadMeta {
            thread_id: thread_id.clone(),
            owner,
            created: Timestamp::now(),
        };

        table.threads.insert(thread_id, meta.clone());
        Ok(meta)
    }

    /// Get thread metadata.
    pub fn get(&self, thread_id: &ThreadId) -> Option<ThreadMeta> {
        self.table.read().threads.get(thread_id).cloned()
    }

    /// Get the owning user of a thread.
    pub fn owner_of(&self, thread_id: &ThreadId) -> Result<UserId> {
        self.table
            .read()
            .threads
            .get(thread_id)
            .map(|m| m.owner.clone())
            .ok_or_else(|| HubError::ThreadNotFound(thread_id.clone()))
    }

    /// Check that `user` owns `thread_id`.
    pub fn ensure_owner(&self, thread_id: &ThreadId, user: &UserId) -> Result<()> {
        let owner = self.owner_of(thread_id)?;
        if &owner != user {
            return Err(HubError::Unauthorized {
                thread: thread_id.clone(),
                user: user.clone(),
            });
        }
        Ok(())
    }

    /// Whether the thread exists.
    pub fn exists(&self, thread_id: &ThreadId) -> bool {
        self.table.read().threads.contains_key(thread_id)
    }

    /// All known thread ids.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.table.read().threads.keys().cloned().collect()
    }

    /// Number of threads.
    pub fn count(&self) -> usize {
        self.table.read().threads.len()
    }

    /// Save the thread table to file.
    pub fn save(&self) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;

        file.write_all(THREAD_TABLE_MAGIC)?;
        file.write_all(&[THREAD_TABLE_VERSION])?;

        let table = self.table.read();
        let encoded =
            rmp_serde::to_vec(&*table).map_err(|e| HubError::Serialization(e.to_string()))?;

        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;

        file.sync_all()?;
        Ok(())
    }

    /// Load the thread table from file.
    fn load_from_file(&self) -> Result<()> {
        let mut file = File::open(&self.path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != THREAD_TABLE_MAGIC {
            return Err(HubError::InvalidFormat("Invalid thread table magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != THREAD_TABLE_VERSION {
            return Err(HubError::InvalidFormat(format!(
                "Unsupported thread table version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let table: ThreadTable =
            rmp_serde::from_slice(&encoded).map_err(|e| HubError::Deserialization(e.to_string()))?;

        *self.table.write() = table;
        Ok(())
    }
}
