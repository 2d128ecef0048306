//! `canbridge-server` binary: resolves configuration, opens the CAN buses
//! and listen socket, and runs the Bridge Core event loop alongside the
//! ingest worker and (optionally) the stats logger until an OS signal
//! requests shutdown.

use std::time::Duration;

use canbridge_server::{Args, BridgeCore, IngestConfig, config, ingest, stats};
use clap::Parser;
use tokio::{signal, sync::watch};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Bound on how long the ingest worker gets to flush or spill its remaining
/// queue on shutdown before we give up waiting on it.
const INGEST_SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let resolved = config::resolve(&args)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&resolved.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(
        interfaces = ?resolved.interfaces,
        fd_mode = resolved.fd_mode,
        bind = %resolved.listen_addr,
        ingest_enabled = resolved.ingest_enabled,
        "canbridge-server starting",
    );

    let (term_tx, term_rx) = watch::channel(false);
    spawn_shutdown_signal(term_tx);

    let (ingest_handle, ingest_worker) = if resolved.ingest_enabled {
        let ingest_config = IngestConfig {
            pg_dsn: resolved.ingest_dsn.clone().unwrap_or_default(),
            function_name: resolved.ingest_function_name.clone(),
            batch_size: resolved.batch_size,
            flush_interval: resolved.flush_interval,
            queue_capacity: resolved.queue_capacity,
            queue_flush_threshold: resolved.queue_flush_threshold,
            spill_path: resolved.spill_path.clone(),
            spill_max_bytes: resolved.spill_max_bytes,
        };
        let (handle, receiver, counters) = ingest::channel(&ingest_config);
        let worker = tokio::spawn(ingest::run_worker(receiver, counters, ingest_config));
        (Some(handle), Some(worker))
    } else {
        tracing::warn!("ingest pipeline disabled; CAN traffic will not be persisted");
        (None, None)
    };

    let stats_task = if let (Some(handle), Some(interval)) = (ingest_handle.clone(), resolved.stats_interval) {
        Some(tokio::spawn(stats::run(handle, interval, term_rx.clone())))
    } else {
        None
    };

    let bridge = BridgeCore::bind(&resolved, ingest_handle).await?;
    tracing::info!(bound = %bridge.local_addr()?, "listening for clients");

    bridge.run(term_rx).await;

    // Every producer-side `IngestHandle` was either owned by `bridge` (just
    // dropped above) or by the stats task; once that task also exits the
    // ingest worker's channel closes and it drains or spills what remains.
    if let Some(stats_task) = stats_task {
        let _ = stats_task.await;
    }
    if let Some(worker) = ingest_worker {
        match tokio::time::timeout(INGEST_SHUTDOWN_JOIN_TIMEOUT, worker).await {
            Ok(_) => tracing::info!("ingest worker shut down cleanly"),
            Err(_) => tracing::error!(
                "ingest worker shutdown timed out after {:?}; residual queue entries may be lost",
                INGEST_SHUTDOWN_JOIN_TIMEOUT
            ),
        }
    }

    Ok(())
}

/// Watches for either `SIGINT` (Ctrl-C) or `SIGTERM` (the default signal
/// sent by `systemd`/`kill`, how this bridge is normally stopped in
/// production) and trips the shared termination flag on whichever arrives
/// first, so the ingest worker always gets a chance to flush or spill its
/// in-flight queue rather than being killed via the default disposition.
fn spawn_shutdown_signal(term_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
                let _ = term_tx.send(true);
                return;
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received, shutting down"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
        }
        let _ = term_tx.send(true);
    });
}
