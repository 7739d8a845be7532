//! Main EventHub struct tying all components together.

use crate::broadcast::{BroadcastRouter, ConnectionHandle};
use crate::catchup::{CatchupService, Replay};
use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::error::{HubError, Result};
use crate::events::{CompactionResult, EventStore};
use crate::ingest::{IngestEndpoint, PublishAck};
use crate::metrics::{HubMetrics, MetricsSnapshot};
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::threads::ThreadManager;
use crate::types::{
    AgentEvent, ConnectionId, EventCursor, EventInput, HubStats, ThreadId, ThreadMeta,
    ThreadSnapshot, UserId,
};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Hub configuration.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Base path for the hub's files.
    pub path: PathBuf,

    /// Number of dispatch partitions (worker pairs).
    pub partitions: usize,

    /// Outbound buffer per connection (notifications).
    pub delivery_buffer: usize,

    /// Attempts per event for persist and deliver lanes.
    pub retry_attempts: u32,

    /// Base backoff between retry attempts; doubles per attempt.
    pub retry_backoff: Duration,

    /// How long committed events are retained once a snapshot absorbs them.
    pub retention: Duration,

    /// Events past the latest snapshot before auto-compaction runs
    /// (0 disables).
    pub snapshot_interval: u64,

    /// Recently accepted event ids kept for dedup.
    pub dedup_cache_size: usize,

    /// Snapshots cached in memory.
    pub snapshot_cache_size: usize,

    /// Whether to create the hub if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./hub"),
            partitions: 4,
            delivery_buffer: 1024,
            retry_attempts: 5,
            retry_backoff: Duration::from_millis(10),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            snapshot_interval: 256,
            dedup_cache_size: 4096,
            snapshot_cache_size: 64,
            create_if_missing: true,
        }
    }
}

/// Magic bytes for the hub manifest.
const HUB_MAGIC: &[u8; 4] = b"TCH\0";

/// Current hub format version.
const HUB_VERSION: u8 = 1;

/// Events returned by a subscribe call's catch-up, at most.
const SUBSCRIBE_CATCHUP_LIMIT: usize = 1024;

/// The event distribution hub.
///
/// Provides a unified interface for:
/// - Publishing events to owned threads
/// - Subscribing connections to live notifications
/// - Reconstructing thread state for catch-up
pub struct EventHub {
    /// Hub configuration.
    config: HubConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    threads: Arc<ThreadManager>,
    store: Arc<EventStore>,
    registry: Arc<SubscriptionRegistry>,
    router: Arc<BroadcastRouter>,
    dispatcher: Dispatcher,
    ingest: IngestEndpoint,
    catchup: CatchupService,
    metrics: Arc<HubMetrics>,
}

impl EventHub {
    /// Open an existing hub or create a new one.
    pub fn open_or_create(config: HubConfig) -> Result<Self> {
        if config.path.exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(HubError::NotInitialized)
        }
    }

    /// Create a new hub.
    pub fn create(config: HubConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let threads = Arc::new(ThreadManager::new(config.path.join("threads.bin"))?);
        Self::assemble(config, lock_file, threads)
    }

    /// Open an existing hub.
    pub fn open(config: HubConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let threads = Arc::new(ThreadManager::load(config.path.join("threads.bin"))?);
        Self::assemble(config, lock_file, threads)
    }

    fn assemble(config: HubConfig, lock_file: File, threads: Arc<ThreadManager>) -> Result<Self> {
        let store = Arc::new(EventStore::open(&config.path, config.snapshot_cache_size)?);
        let registry = Arc::new(SubscriptionRegistry::new());
        let metrics = Arc::new(HubMetrics::new());

        let router = Arc::new(BroadcastRouter::new(
            Arc::clone(&registry),
            Arc::clone(&threads),
            Arc::clone(&metrics),
        ));

        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&router),
            Arc::clone(&metrics),
            DispatchOptions {
                partitions: config.partitions,
                retry_attempts: config.retry_attempts,
                retry_backoff: config.retry_backoff,
                snapshot_interval: config.snapshot_interval,
            },
        );

        let ingest = IngestEndpoint::new(
            Arc::clone(&threads),
            Arc::clone(&store),
            Arc::clone(&metrics),
            config.dedup_cache_size,
        );

        let catchup = CatchupService::new(Arc::clone(&threads), Arc::clone(&store));

        Ok(Self {
            config,
            _lock_file: lock_file,
            threads,
            store,
            registry,
            router,
            dispatcher,
            ingest,
            catchup,
            metrics,
        })
    }

    // --- Thread Operations ---

    /// Create a thread owned by `owner`.
    pub fn create_thread(&self, owner: &UserId, thread_id: ThreadId) -> Result<ThreadMeta> {
        let meta = self.threads.create(thread_id, owner.clone())?;
        self.threads.save()?;
        Ok(meta)
    }

    /// Get thread metadata.
    pub fn thread(&self, thread_id: &ThreadId) -> Option<ThreadMeta> {
        self.threads.get(thread_id)
    }

    // --- Publish ---

    /// Publish an event to an owned thread.
    ///
    /// The ack only guarantees "accepted for processing"; persistence and
    /// broadcast complete asynchronously.
    pub fn publish(
        &self,
        producer: &UserId,
        thread_id: &ThreadId,
        input: EventInput,
    ) -> Result<PublishAck> {
        self.ingest
            .publish(&self.dispatcher, producer, thread_id, input)
    }

    // --- Connections & Subscriptions ---

    /// Attach a connection's outbound channel.
    pub fn attach(&self, connection_id: ConnectionId, user: UserId) -> ConnectionHandle {
        self.router
            .attach(connection_id, user, self.config.delivery_buffer)
    }

    /// Subscribe a connection to a thread's events (`None` = all threads
    /// owned by `user`).
    ///
    /// When a thread filter and a cursor are given, returns the committed
    /// events after the cursor so the subscriber starts from a known point;
    /// everything later arrives as push notifications.
    pub fn subscribe(
        &self,
        connection_id: &ConnectionId,
        user: &UserId,
        thread_filter: Option<ThreadId>,
        since: Option<EventCursor>,
    ) -> Result<Vec<AgentEvent>> {
        // The connection must be attached, and under the same identity the
        // session layer supplied for this call.
        match self.router.user_of(connection_id) {
            Some(attached) if &attached == user => {}
            _ => return Err(HubError::ConnectionNotFound(connection_id.clone())),
        }

        if let Some(thread_id) = &thread_filter {
            self.threads.ensure_owner(thread_id, user)?;
        }

        let recent = match (&thread_filter, &since) {
            (Some(thread_id), Some(cursor)) => {
                let seq = self.store.resolve_cursor(thread_id, cursor)?;
                self.store
                    .events_since(thread_id, seq, SUBSCRIBE_CATCHUP_LIMIT)?
                    .into_iter()
                    .map(|entry| entry.event)
                    .collect()
            }
            _ => Vec::new(),
        };

        let last_event_id = match &since {
            Some(EventCursor::Event(id)) => Some(id.clone()),
            _ => None,
        };

        self.registry.subscribe(Subscription::new(
            connection_id.clone(),
            user.clone(),
            thread_filter,
            last_event_id,
        ));

        Ok(recent)
    }

    /// Remove one subscription. Removing one that does not exist is a
    /// successful no-op; returns whether anything was removed.
    pub fn unsubscribe(
        &self,
        connection_id: &ConnectionId,
        thread_filter: Option<&ThreadId>,
    ) -> bool {
        self.registry.unsubscribe(connection_id, thread_filter)
    }

    /// Tear down a connection: detach its channel and drop all of its
    /// subscriptions. Idempotent.
    pub fn disconnect(&self, connection_id: &ConnectionId) {
        self.router.detach(connection_id);
        self.registry.remove_connection(connection_id);
    }

    // --- Catch-up ---

    /// The thread's current state as a snapshot.
    pub fn current_state(&self, thread_id: &ThreadId, user: &UserId) -> Result<ThreadSnapshot> {
        self.catchup.current_state(thread_id, user)
    }

    /// Snapshot at the cursor plus the committed events after it.
    pub fn snapshot_and_events(
        &self,
        thread_id: &ThreadId,
        user: &UserId,
        since: Option<&EventCursor>,
        limit: usize,
    ) -> Result<Replay> {
        self.catchup.replay(thread_id, user, since, limit)
    }

    // --- Maintenance ---

    /// Fold a thread's recent events into a new snapshot.
    pub fn compact(&self, thread_id: &ThreadId) -> Result<Option<CompactionResult>> {
        let result = self.store.compact(thread_id)?;
        if result.is_some() {
            HubMetrics::incr(&self.metrics.snapshots_created);
        }
        Ok(result)
    }

    /// Prune events past the retention window that a snapshot has absorbed.
    pub fn prune_expired(&self) -> Result<u64> {
        let pruned = self.store.prune_expired(self.config.retention)?;
        HubMetrics::add(&self.metrics.events_pruned, pruned);
        Ok(pruned)
    }

    /// Block until everything queued so far is persisted and delivered.
    pub fn flush(&self) {
        self.dispatcher.flush();
    }

    /// Sync durable state to disk.
    pub fn sync(&self) -> Result<()> {
        self.store.sync()?;
        self.threads.save()?;
        Ok(())
    }

    // --- Introspection ---

    /// Read the hub counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Get hub statistics.
    pub fn stats(&self) -> Result<HubStats> {
        Ok(HubStats {
            thread_count: self.threads.count() as u64,
            event_count: self.store.count() as u64,
            connection_count: self.router.connection_count() as u64,
            subscription_count: self.registry.count() as u64,
            snapshot_count: self.store.snapshot_count()? as u64,
            log_size_bytes: self.store.log_size(),
        })
    }

    /// Get the hub path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(HUB_MAGIC)?;
        file.write_all(&[HUB_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != HUB_MAGIC {
            return Err(HubError::InvalidFormat("Invalid hub magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != HUB_VERSION {
            return Err(HubError::InvalidFormat(format!(
                "Unsupported hub version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| HubError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for EventHub {
    fn drop(&mut self) {
        // Drain in-flight work, then best-effort sync
        self.dispatcher.flush();
        let _ = self.sync();
    }
}
