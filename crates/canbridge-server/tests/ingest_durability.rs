//! End-to-end durability tests for the ingest worker.
//!
//! These drive [`ingest::run_worker_with`] against a fault-injecting
//! `FakeWriter` instead of a live Postgres instance, in the spirit of the
//! teacher's `chaos_storage.rs`/`crash_recovery.rs`: wrap the real seam in a
//! fake that fails on command, then assert the durability invariant holds
//! (`enqueued = written + dropped + spilled`) across the fault.
//!
//! Both tests run with `start_paused`, so `tokio::time::sleep` advances a
//! virtual clock instead of the wall clock: the backoff/retry loops inside
//! the worker resolve instantly in test time, but still happen in the same
//! order they would against a real clock.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use canbridge_core::{Direction, QueueEntry};
use canbridge_server::ingest::{self, IngestConfig, sql::SqlError, sql::SqlWriter};
use tempfile::tempdir;

/// Shared state behind a `FakeWriter`, looked up by DSN so that each
/// reconnect attempt (which constructs a fresh `FakeWriter` via
/// [`SqlWriter::connect`]) still shares the same fault-injection counters and
/// write log as the last one.
struct FakeState {
    /// Connect attempts remaining that should fail before one succeeds.
    fail_connects_remaining: AtomicU64,
    /// Virtual delay applied to the next `write_batch` call only.
    slow_next_write_millis: AtomicU64,
    /// Every entry handed to a successful `write_batch`, in commit order.
    written: Mutex<Vec<QueueEntry>>,
}

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<FakeState>>>> = OnceLock::new();

fn register(key: &str, fail_connects: u64) -> Arc<FakeState> {
    let state = Arc::new(FakeState {
        fail_connects_remaining: AtomicU64::new(fail_connects),
        slow_next_write_millis: AtomicU64::new(0),
        written: Mutex::new(Vec::new()),
    });
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new())).lock().unwrap().insert(key.to_string(), Arc::clone(&state));
    state
}

struct FakeWriter {
    state: Arc<FakeState>,
}

#[async_trait]
impl SqlWriter for FakeWriter {
    async fn connect(dsn: &str, _function_name: &str) -> Result<Self, SqlError> {
        #[allow(clippy::expect_used, reason = "test registry is populated before the worker is spawned")]
        let state = Arc::clone(
            REGISTRY.get_or_init(|| Mutex::new(HashMap::new())).lock().unwrap().get(dsn).expect("unregistered test dsn"),
        );

        let remaining = state.fail_connects_remaining.load(Ordering::Relaxed);
        if remaining > 0 {
            state.fail_connects_remaining.fetch_sub(1, Ordering::Relaxed);
            return Err(SqlError::Injected("simulated outage".to_string()));
        }

        Ok(Self { state })
    }

    async fn write_batch(&mut self, batch: &[QueueEntry]) -> Result<(), SqlError> {
        let delay = self.state.slow_next_write_millis.swap(0, Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !batch.is_empty() {
            self.state.written.lock().unwrap().extend_from_slice(batch);
        }
        Ok(())
    }
}

fn entry(id: u32) -> QueueEntry {
    QueueEntry {
        timestamp: Duration::from_secs(1),
        extended: false,
        fd: false,
        id,
        dlc: 1,
        payload: vec![id as u8],
        bus: 0,
        direction: Direction::Rx,
    }
}

/// Scenario 5 ("ingest outage"): the SQL backend is unreachable for several
/// connect attempts while entries keep arriving. None should be dropped —
/// overflow is spilled to disk instead — and once the connection recovers,
/// every entry is written, in the order it was originally enqueued.
#[tokio::test(start_paused = true)]
async fn outage_spills_everything_and_drains_in_order_on_reconnect() {
    let dir = tempdir().unwrap();
    let dsn = "test-outage".to_string();
    let state = register(&dsn, 2);

    let config = IngestConfig {
        pg_dsn: dsn,
        function_name: "public.ingest_can_frame".to_string(),
        batch_size: 20,
        flush_interval: Duration::from_millis(200),
        queue_capacity: 50,
        queue_flush_threshold: 0.5,
        spill_path: dir.path().join("spill.redb"),
        spill_max_bytes: ingest::spill::DEFAULT_MAX_BYTES,
    };

    let (handle, receiver, counters) = ingest::channel(&config);
    let worker = tokio::spawn(ingest::run_worker_with::<FakeWriter>(receiver, counters, config));

    let total: u32 = 200;
    let rounds: u32 = 4;
    let per_round = total / rounds;
    for round in 0..rounds {
        for i in 0..per_round {
            let id = round * per_round + i;
            assert!(handle.try_enqueue(entry(id)), "round {round} entry {i} should not be dropped");
        }
        // Generous virtual sleep: long enough for every pending backoff
        // retry and overflow-spill check to run to completion before the
        // next round's burst arrives.
        tokio::time::sleep(Duration::from_secs(3)).await;
    }

    let final_counters = handle.counters();
    drop(handle);
    tokio::time::timeout(Duration::from_secs(5), worker).await.expect("worker did not shut down").unwrap();

    assert_eq!(final_counters.dropped, 0, "no entry should be dropped during the outage");
    assert_eq!(final_counters.written, u64::from(total));
    assert_eq!(final_counters.spilled, 0, "every spilled entry must have drained by the end of the test");
    assert!(final_counters.recovered_from_spill > 0, "the outage must have routed entries through the spill store");

    let snapshot = state.written.lock().unwrap();
    assert_eq!(snapshot.len(), total as usize);
    let ids: Vec<u32> = snapshot.iter().map(|e| e.id).collect();
    assert_eq!(ids, (0..total).collect::<Vec<_>>(), "entries must drain in original enqueue order");
}

/// Scenario 6 ("overflow spill while connected"): the connection is up, but
/// one write is slow. While it's in flight, enough entries arrive to cross
/// the 50% occupancy threshold, so the worker proactively spills the
/// overflow rather than letting the queue fill further. Once the slow write
/// finishes, the spilled entries drain back in order.
#[tokio::test(start_paused = true)]
async fn slow_write_triggers_proactive_spill_and_drains_back_in_order() {
    let dir = tempdir().unwrap();
    let dsn = "test-slow-write".to_string();
    let state = register(&dsn, 0);

    let config = IngestConfig {
        pg_dsn: dsn,
        function_name: "public.ingest_can_frame".to_string(),
        batch_size: 10,
        flush_interval: Duration::from_millis(50),
        queue_capacity: 50,
        queue_flush_threshold: 0.5,
        spill_path: dir.path().join("spill.redb"),
        spill_max_bytes: ingest::spill::DEFAULT_MAX_BYTES,
    };

    let (handle, receiver, counters) = ingest::channel(&config);
    let worker = tokio::spawn(ingest::run_worker_with::<FakeWriter>(receiver, counters, config));

    // Prime the first batch and arm a slow write for it so the worker is
    // mid-write (not touching the channel) while the rest of the burst
    // arrives.
    for i in 0..5u32 {
        assert!(handle.try_enqueue(entry(i)));
    }
    state.slow_next_write_millis.store(500, Ordering::Relaxed);
    tokio::task::yield_now().await;

    // While that write is in flight, push the queue past 50% occupancy.
    for i in 5..35u32 {
        assert!(handle.try_enqueue(entry(i)), "entry {i} should fit under capacity and not be dropped");
    }

    // Let the slow write resolve, the overflow spill trigger, and the
    // drain-back-in-order complete.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let final_counters = handle.counters();
    drop(handle);
    tokio::time::timeout(Duration::from_secs(5), worker).await.expect("worker did not shut down").unwrap();

    assert_eq!(final_counters.dropped, 0);
    assert_eq!(final_counters.spilled, 0, "all spilled entries must have drained by shutdown");
    assert!(final_counters.recovered_from_spill > 0, "the burst must have gone through the spill path");

    let snapshot = state.written.lock().unwrap();
    assert_eq!(snapshot.len(), 35);
    let ids: Vec<u32> = snapshot.iter().map(|e| e.id).collect();
    assert_eq!(ids, (0..35).collect::<Vec<_>>(), "spilled overflow must drain back in original order");
}
