//! Partitioned dispatch workers.
//!
//! Events are partitioned by a stable hash of their thread id, so all
//! events for one thread land on one partition in arrival order. Each
//! partition runs two lanes (persist, deliver), each drained by its own
//! worker thread: per-thread ordering holds on both paths, and a store
//! outage never delays live delivery.

use crate::broadcast::BroadcastRouter;
use crate::error::{HubError, Result};
use crate::events::EventStore;
use crate::metrics::HubMetrics;
use crate::types::{AgentEvent, ThreadId};
use crossbeam_channel::{bounded, unbounded, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, warn};

/// Dispatch tuning knobs, owned by the hub config.
#[derive(Clone, Debug)]
pub struct DispatchOptions {
    /// Number of thread-id partitions (and worker pairs).
    pub partitions: usize,

    /// Attempts per event for each lane before giving up.
    pub retry_attempts: u32,

    /// Base backoff between attempts; doubles per attempt.
    pub retry_backoff: Duration,

    /// Commit this many events past the latest snapshot before the persist
    /// lane folds a new one (0 disables auto-compaction).
    pub snapshot_interval: u64,
}

enum Job {
    Event(Arc<AgentEvent>),
    Flush(Sender<()>),
}

struct Partition {
    persist_tx: Sender<Job>,
    deliver_tx: Sender<Job>,
}

/// Central intake point for accepted events.
pub struct Dispatcher {
    partitions: Vec<Partition>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn the worker lanes.
    pub fn new(
        store: Arc<EventStore>,
        router: Arc<BroadcastRouter>,
        metrics: Arc<HubMetrics>,
        options: DispatchOptions,
    ) -> Self {
        let partition_count = options.partitions.max(1);
        let mut partitions = Vec::with_capacity(partition_count);
        let mut workers = Vec::with_capacity(partition_count * 2);

        for i in 0..partition_count {
            let (persist_tx, persist_rx) = unbounded();
            let (deliver_tx, deliver_rx) = unbounded();

            let persist_store = Arc::clone(&store);
            let persist_metrics = Arc::clone(&metrics);
            let persist_options = options.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("persist-{}", i))
                    .spawn(move || {
                        persist_worker(persist_store, persist_metrics, persist_options, persist_rx)
                    })
                    .expect("spawn persist worker"),
            );

            let deliver_router = Arc::clone(&router);
            let deliver_options = options.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("deliver-{}", i))
                    .spawn(move || deliver_worker(deliver_router, deliver_options, deliver_rx))
                    .expect("spawn deliver worker"),
            );

            partitions.push(Partition {
                persist_tx,
                deliver_tx,
            });
        }

        Self {
            partitions,
            workers,
        }
    }

    /// Queue an event for persistence and broadcast. Non-blocking; returns
    /// as soon as both lanes have the event.
    pub fn enqueue(&self, event: AgentEvent) -> Result<()> {
        if self.partitions.is_empty() {
            return Err(HubError::ShuttingDown);
        }

        let partition = &self.partitions[Self::partition_for(&event.thread_id, self.partitions.len())];
        let event = Arc::new(event);

        partition
            .persist_tx
            .send(Job::Event(Arc::clone(&event)))
            .map_err(|_| HubError::ShuttingDown)?;
        partition
            .deliver_tx
            .send(Job::Event(event))
            .map_err(|_| HubError::ShuttingDown)?;

        Ok(())
    }

    /// Block until every lane has drained everything queued before this
    /// call. Used by tests and shutdown.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = bounded(self.partitions.len() * 2);

        let mut expected = 0;
        for partition in &self.partitions {
            if partition.persist_tx.send(Job::Flush(ack_tx.clone())).is_ok() {
                expected += 1;
            }
            if partition.deliver_tx.send(Job::Flush(ack_tx.clone())).is_ok() {
                expected += 1;
            }
        }
        drop(ack_tx);

        for _ in 0..expected {
            let _ = ack_rx.recv();
        }
    }

    /// Stop accepting work and join the workers.
    pub fn shutdown(&mut self) {
        self.partitions.clear();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    fn partition_for(thread_id: &ThreadId, partitions: usize) -> usize {
        crc32fast::hash(thread_id.as_str().as_bytes()) as usize % partitions
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn backoff_for(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(10))
}

fn persist_worker(
    store: Arc<EventStore>,
    metrics: Arc<HubMetrics>,
    options: DispatchOptions,
    rx: crossbeam_channel::Receiver<Job>,
) {
    for job in rx.iter() {
        match job {
            Job::Event(event) => {
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    match store.append(&event) {
                        Ok(_) => {
                            HubMetrics::incr(&metrics.events_persisted);
                            maybe_compact(&store, &metrics, &options, &event.thread_id);
                            break;
                        }
                        Err(e) if attempt < options.retry_attempts => {
                            HubMetrics::incr(&metrics.persist_retries);
                            warn!(
                                error = %e,
                                attempt,
                                event = %event.event_id,
                                "append failed, retrying"
                            );
                            thread::sleep(backoff_for(options.retry_backoff, attempt));
                        }
                        Err(e) => {
                            // Reported gap: the event is lost to durable
                            // history but broadcast ran independently.
                            HubMetrics::incr(&metrics.persist_failures);
                            store.record_gap(&event.thread_id, event.event_id.clone());
                            error!(
                                error = %e,
                                event = %event.event_id,
                                thread = %event.thread_id,
                                "append retries exhausted, gap recorded"
                            );
                            break;
                        }
                    }
                }
            }
            Job::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

fn maybe_compact(
    store: &EventStore,
    metrics: &HubMetrics,
    options: &DispatchOptions,
    thread_id: &ThreadId,
) {
    if options.snapshot_interval == 0 {
        return;
    }

    match store.events_behind(thread_id) {
        Ok(behind) if behind >= options.snapshot_interval => match store.compact(thread_id) {
            Ok(Some(_)) => HubMetrics::incr(&metrics.snapshots_created),
            Ok(None) => {}
            Err(e) => warn!(error = %e, thread = %thread_id, "auto-compaction failed"),
        },
        Ok(_) => {}
        Err(e) => warn!(error = %e, thread = %thread_id, "snapshot distance check failed"),
    }
}

fn deliver_worker(
    router: Arc<BroadcastRouter>,
    options: DispatchOptions,
    rx: crossbeam_channel::Receiver<Job>,
) {
    for job in rx.iter() {
        match job {
            Job::Event(event) => {
                let report = router.deliver(&event);
                let mut failed = report.failed;

                let mut attempt = 1;
                while !failed.is_empty() && attempt < options.retry_attempts {
                    thread::sleep(backoff_for(options.retry_backoff, attempt));
                    attempt += 1;
                    failed.retain(|connection_id| !router.deliver_to(connection_id, &event));
                }

                if !failed.is_empty() {
                    // Subscriptions stay intact; these recipients are
                    // expected to catch up on their next connect.
                    warn!(
                        event = %event.event_id,
                        recipients = failed.len(),
                        "delivery retries exhausted"
                    );
                }
            }
            Job::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
