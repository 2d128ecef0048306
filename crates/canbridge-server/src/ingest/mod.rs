//! The durable ingest pipeline: a bounded in-memory queue feeding a batched
//! SQL writer, backed by a disk spill store so outages and bursts never
//! reorder or silently lose frames.
//!
//! Policy: proactive overflow spill, connect-with-backoff, spill drains
//! before memory does, then normal batching with a blocking-then-nonblocking
//! receive so an idle bus doesn't spin the worker.

pub mod spill;
pub mod sql;

use std::{
    sync::{
        Arc,
        atomic::{AtomicI8, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use canbridge_core::QueueEntry;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

use self::{
    spill::SpillStore,
    sql::{PostgresWriter, SqlWriter},
};

/// Errors the ingest worker loop can hit mid-iteration; both variants are
/// handled the same way (log, drop the connection, back off).
#[derive(Error, Debug)]
pub enum IngestError {
    /// The SQL write itself failed.
    #[error(transparent)]
    Sql(#[from] sql::SqlError),
    /// Reading from the spill store failed.
    #[error(transparent)]
    Spill(#[from] spill::SpillError),
}

/// Tuning knobs for the ingest pipeline, sourced from [`crate::config::ResolvedConfig`].
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Postgres connection string.
    pub pg_dsn: String,
    /// Stored procedure name, e.g. `public.ingest_can_frame`.
    pub function_name: String,
    /// Maximum entries committed per transaction.
    pub batch_size: usize,
    /// How long the worker waits for the first entry of a batch before
    /// committing an empty heartbeat.
    pub flush_interval: Duration,
    /// In-memory queue capacity.
    pub queue_capacity: usize,
    /// Occupancy ratio (0.0-1.0) at which the worker proactively spills.
    pub queue_flush_threshold: f64,
    /// Path to the spill store's backing file.
    pub spill_path: std::path::PathBuf,
    /// Spill store capacity in bytes.
    pub spill_max_bytes: u64,
}

/// Monotonic counters exposed for stats logging.
#[derive(Default)]
pub struct IngestCounters {
    enqueued: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
    spilled: AtomicU64,
    recovered_from_spill: AtomicU64,
    /// Last crossed threshold bucket: -1 (none), 80, 95, 100.
    last_bucket: AtomicI8,
}

/// Point-in-time snapshot of the counters, for periodic stats logs.
#[derive(Debug, Clone, Copy)]
pub struct CountersSnapshot {
    /// Total entries accepted into the queue.
    pub enqueued: u64,
    /// Total entries committed to the SQL store.
    pub written: u64,
    /// Total entries dropped (queue full or spill full).
    pub dropped: u64,
    /// Total entries currently spilled, awaiting drain.
    pub spilled: u64,
    /// Total entries recovered from the spill store and committed.
    pub recovered_from_spill: u64,
}

impl IngestCounters {
    fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            spilled: self.spilled.load(Ordering::Relaxed),
            recovered_from_spill: self.recovered_from_spill.load(Ordering::Relaxed),
        }
    }
}

/// Producer-side entry point, cloned into the Bridge Core and every Client
/// Session's TX path.
#[derive(Clone)]
pub struct IngestHandle {
    sender: mpsc::Sender<QueueEntry>,
    capacity: usize,
    counters: Arc<IngestCounters>,
    last_full_log: Arc<Mutex<Instant>>,
}

/// Rate limit for the queue-full error log.
const QUEUE_FULL_LOG_INTERVAL: Duration = Duration::from_secs(5);

impl IngestHandle {
    /// Attempts to enqueue one entry without blocking.
    ///
    /// Returns `false` if the queue is full; the caller does not need to do
    /// anything further, the drop is already counted and logged (rate
    /// limited).
    pub fn try_enqueue(&self, entry: QueueEntry) -> bool {
        match self.sender.try_send(entry) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                self.warn_on_threshold_crossing();
                true
            },
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.log_queue_full_rate_limited();
                false
            },
        }
    }

    fn occupancy_ratio(&self) -> f64 {
        let available = self.sender.capacity();
        let used = self.capacity.saturating_sub(available);
        used as f64 / self.capacity as f64
    }

    fn warn_on_threshold_crossing(&self) {
        let bucket = bucket_for_ratio(self.occupancy_ratio());
        let previous = self.counters.last_bucket.swap(bucket, Ordering::Relaxed);
        if bucket != previous {
            if bucket >= 0 {
                tracing::warn!(bucket, "ingest queue high water mark crossed");
            } else {
                tracing::info!("ingest queue recovered below 80% occupancy");
            }
        }
    }

    fn log_queue_full_rate_limited(&self) {
        let Ok(mut last) = self.last_full_log.try_lock() else { return };
        let now = Instant::now();
        if now.duration_since(*last) >= QUEUE_FULL_LOG_INTERVAL {
            *last = now;
            let dropped = self.counters.dropped.load(Ordering::Relaxed);
            tracing::error!(dropped, "ingest queue full, dropping entry");
        }
    }

    /// Current counters, for periodic stats logging.
    #[must_use]
    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }
}

fn bucket_for_ratio(ratio: f64) -> i8 {
    if ratio >= 1.0 {
        100
    } else if ratio >= 0.95 {
        95
    } else if ratio >= 0.80 {
        80
    } else {
        -1
    }
}

/// Builds the bounded queue and returns the producer handle, the receiver
/// the worker task consumes, and the shared counters (also reachable
/// through the handle) for the worker loop to update directly.
#[must_use]
pub fn channel(config: &IngestConfig) -> (IngestHandle, mpsc::Receiver<QueueEntry>, Arc<IngestCounters>) {
    let (sender, receiver) = mpsc::channel(config.queue_capacity);
    let counters = Arc::new(IngestCounters::default());
    let handle = IngestHandle {
        sender,
        capacity: config.queue_capacity,
        counters: Arc::clone(&counters),
        last_full_log: Arc::new(Mutex::new(Instant::now() - QUEUE_FULL_LOG_INTERVAL)),
    };
    (handle, receiver, counters)
}

/// Runs the ingest worker loop against Postgres until `receiver` is closed
/// and drained. Thin entry point over [`run_worker_with`], fixed to the
/// production SQL backend; tests drive [`run_worker_with`] directly against
/// a fake [`SqlWriter`] to exercise the durability logic without a database.
pub async fn run_worker(receiver: mpsc::Receiver<QueueEntry>, counters: Arc<IngestCounters>, config: IngestConfig) {
    run_worker_with::<PostgresWriter>(receiver, counters, config).await;
}

/// Runs the ingest worker loop until `receiver` is closed and drained.
///
/// Each iteration: proactively spill on overflow, ensure a live SQL
/// connection, drain the spill store before the in-memory queue, then
/// batch from the queue with a blocking-then-nonblocking receive.
pub async fn run_worker_with<W: SqlWriter>(
    mut receiver: mpsc::Receiver<QueueEntry>,
    counters: Arc<IngestCounters>,
    config: IngestConfig,
) {
    let mut spill = match SpillStore::open(&config.spill_path, config.spill_max_bytes) {
        Ok(store) => store,
        Err(error) => {
            tracing::error!(%error, "failed to open spill store, ingest worker cannot start");
            return;
        },
    };

    // Entries left on disk by a prior process's crash or unclean shutdown
    // were never counted as spilled in this process; seed the counter from
    // what's actually on disk so `drain_spill`'s `fetch_sub` doesn't
    // underflow a counter that was never incremented for them.
    match spill.len() {
        Ok(preexisting) if preexisting > 0 => {
            tracing::info!(preexisting, "recovered spill entries from a prior run");
            counters.spilled.fetch_add(preexisting, Ordering::Relaxed);
        },
        Ok(_) => {},
        Err(error) => tracing::error!(%error, "failed to read spill store size on startup"),
    }

    let mut writer: Option<W> = None;
    let mut backoff = Duration::from_millis(500);
    const MAX_BACKOFF: Duration = Duration::from_secs(10);

    loop {
        maybe_flush_overflow(&mut receiver, &mut spill, &config, &counters);

        if writer.is_none() {
            match W::connect(&config.pg_dsn, &config.function_name).await {
                Ok(connected) => {
                    writer = Some(connected);
                    backoff = Duration::from_millis(500);
                    tracing::info!("database connection restored");
                },
                Err(error) => {
                    tracing::error!(%error, "postgres connect failed, retrying after backoff");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                },
            }
        }

        let Some(client) = writer.as_mut() else { continue };

        if let Err(error) = drain_spill(client, &mut spill, &config, &counters).await {
            tracing::error!(%error, "spill drain failed, reconnecting");
            writer = None;
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
            continue;
        }

        let mut batch = Vec::with_capacity(config.batch_size);
        match tokio::time::timeout(config.flush_interval, receiver.recv()).await {
            Ok(Some(entry)) => batch.push(entry),
            Ok(None) => {
                // Channel closed: shut down after a final flush attempt.
                shutdown_flush(writer.as_mut(), &mut spill, batch, &counters).await;
                return;
            },
            Err(_) => {}, // flush interval elapsed with nothing queued yet
        }
        while batch.len() < config.batch_size {
            match receiver.try_recv() {
                Ok(entry) => batch.push(entry),
                Err(_) => break,
            }
        }

        let Some(client) = writer.as_mut() else { continue };
        match client.write_batch(&batch).await {
            Ok(()) => {
                counters.written.fetch_add(batch.len() as u64, Ordering::Relaxed);
            },
            Err(error) => {
                tracing::error!(%error, batch_len = batch.len(), "write error, spilling batch");
                writer = None;
                spill_or_drop(&mut spill, batch, &counters);
                drain_channel_to_spill(&mut receiver, &mut spill, &config, &counters);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            },
        }
    }
}

fn maybe_flush_overflow(
    receiver: &mut mpsc::Receiver<QueueEntry>,
    spill: &mut SpillStore,
    config: &IngestConfig,
    counters: &IngestCounters,
) {
    let ratio = receiver.len() as f64 / config.queue_capacity as f64;
    if ratio < config.queue_flush_threshold {
        return;
    }

    tracing::warn!(occupancy_pct = (ratio * 100.0) as u32, "ingest queue overflowing, spilling to disk");
    drain_channel_to_spill(receiver, spill, config, counters);
}

fn drain_channel_to_spill(
    receiver: &mut mpsc::Receiver<QueueEntry>,
    spill: &mut SpillStore,
    config: &IngestConfig,
    counters: &IngestCounters,
) {
    let mut batch = Vec::with_capacity(config.batch_size);
    loop {
        match receiver.try_recv() {
            Ok(entry) => {
                batch.push(entry);
                if batch.len() >= config.batch_size {
                    spill_or_drop(spill, std::mem::take(&mut batch), counters);
                }
            },
            Err(_) => break,
        }
    }
    if !batch.is_empty() {
        spill_or_drop(spill, batch, counters);
    }
}

fn spill_or_drop(spill: &mut SpillStore, batch: Vec<QueueEntry>, counters: &IngestCounters) {
    if batch.is_empty() {
        return;
    }
    let len = batch.len() as u64;
    match spill.append(&batch) {
        Ok(()) => {
            counters.spilled.fetch_add(len, Ordering::Relaxed);
        },
        Err(error) => {
            tracing::error!(%error, dropped = len, "spill store full, dropping batch");
            counters.dropped.fetch_add(len, Ordering::Relaxed);
        },
    }
}

async fn drain_spill<W: SqlWriter>(
    client: &mut W,
    spill: &mut SpillStore,
    config: &IngestConfig,
    counters: &IngestCounters,
) -> Result<(), IngestError> {
    loop {
        let batch = spill.read_oldest(config.batch_size)?;
        if batch.is_empty() {
            return Ok(());
        }

        let entries: Vec<QueueEntry> = batch.iter().map(|(_, entry)| entry.clone()).collect();
        client.write_batch(&entries).await?;

        let ids: Vec<u64> = batch.iter().map(|(id, _)| *id).collect();
        if let Err(error) = spill.delete(&ids) {
            tracing::error!(%error, "failed to delete drained spill entries");
        }

        counters.recovered_from_spill.fetch_add(entries.len() as u64, Ordering::Relaxed);
        counters.written.fetch_add(entries.len() as u64, Ordering::Relaxed);
        counters.spilled.fetch_sub(entries.len() as u64, Ordering::Relaxed);

        if spill.is_empty().unwrap_or(false) {
            if let Err(error) = spill.reset() {
                tracing::error!(%error, "failed to compact spill store after drain");
            }
            return Ok(());
        }
    }
}

async fn shutdown_flush<W: SqlWriter>(
    writer: Option<&mut W>,
    spill: &mut SpillStore,
    mut batch: Vec<QueueEntry>,
    counters: &IngestCounters,
) {
    if batch.is_empty() {
        return;
    }

    if let Some(client) = writer {
        if client.write_batch(&batch).await.is_ok() {
            counters.written.fetch_add(batch.len() as u64, Ordering::Relaxed);
            tracing::info!(count = batch.len(), "shutdown: flushed remaining entries to database");
            return;
        }
    }

    spill_or_drop(spill, std::mem::take(&mut batch), counters);
    tracing::info!("shutdown: flushed remaining entries to disk spill store");
}

#[cfg(test)]
mod tests {
    use canbridge_core::Direction;
    use std::time::Duration as StdDuration;

    use super::*;

    fn config(dir: &std::path::Path) -> IngestConfig {
        IngestConfig {
            pg_dsn: String::new(),
            function_name: "public.ingest_can_frame".to_string(),
            batch_size: 4,
            flush_interval: StdDuration::from_millis(50),
            queue_capacity: 8,
            queue_flush_threshold: 0.5,
            spill_path: dir.join("spill.redb"),
            spill_max_bytes: spill::DEFAULT_MAX_BYTES,
        }
    }

    fn entry(id: u32) -> QueueEntry {
        QueueEntry {
            timestamp: std::time::Duration::from_secs(1),
            extended: false,
            fd: false,
            id,
            dlc: 2,
            payload: vec![0, 1],
            bus: 0,
            direction: Direction::Rx,
        }
    }

    #[test]
    fn bucket_thresholds_fall_at_80_95_100_percent() {
        assert_eq!(bucket_for_ratio(0.5), -1);
        assert_eq!(bucket_for_ratio(0.80), 80);
        assert_eq!(bucket_for_ratio(0.95), 95);
        assert_eq!(bucket_for_ratio(1.0), 100);
    }

    #[tokio::test]
    async fn try_enqueue_reports_queue_full() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut receiver, _counters) = channel(&config(dir.path()));

        for i in 0..8 {
            assert!(handle.try_enqueue(entry(i)));
        }
        assert!(!handle.try_enqueue(entry(99)));
        assert_eq!(handle.counters().dropped, 1);

        for _ in 0..8 {
            receiver.try_recv().unwrap();
        }
    }

    #[test]
    fn spill_or_drop_counts_spilled_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut spill = SpillStore::open(dir.path().join("spill.redb"), spill::DEFAULT_MAX_BYTES).unwrap();
        let counters = IngestCounters::default();

        spill_or_drop(&mut spill, vec![entry(1), entry(2)], &counters);
        assert_eq!(counters.spilled.load(Ordering::Relaxed), 2);
        assert_eq!(spill.read_oldest(10).unwrap().len(), 2);
    }
}
