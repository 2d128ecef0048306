//! Optional periodic stats logger for the ingest pipeline.
//!
//! Runs as its own task alongside the ingest worker; it only ever reads the
//! shared counters through [`IngestHandle::counters`], never touching the
//! queue or the SQL connection itself.

use std::time::Duration;

use tokio::sync::watch;

use crate::ingest::IngestHandle;

/// Logs `ingest`'s counters at `info` level every `interval`, until `term`
/// is set to `true` or dropped.
pub async fn run(ingest: IngestHandle, interval: Duration, mut term: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            changed = term.changed() => {
                if changed.is_err() || *term.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let counters = ingest.counters();
                tracing::info!(
                    enqueued = counters.enqueued,
                    written = counters.written,
                    dropped = counters.dropped,
                    spilled = counters.spilled,
                    recovered_from_spill = counters.recovered_from_spill,
                    "ingest pipeline stats",
                );
            }
        }
    }
}
