//! The SQL side of the ingest worker: a `tokio-postgres` connection that
//! commits one batch of [`QueueEntry`] rows per transaction by calling a
//! configured stored procedure once per row.
//!
//! `SET statement_timeout`, one `SELECT <function>(...)` call per row, and a
//! single commit per batch. There is no bulk `VALUES`-list call here, since
//! `tokio-postgres` has no unnested-array helper to build one from; N
//! prepared-statement executions inside one transaction stand in for it.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use canbridge_core::QueueEntry;
use thiserror::Error;
use tokio_postgres::{Client, NoTls};

/// Statement timeout applied to every connection: a stuck write falls back
/// to the spill store quickly rather than stalling the whole batch.
pub const STATEMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the SQL ingest connection.
#[derive(Error, Debug)]
pub enum SqlError {
    /// Connecting to the database failed.
    #[error("postgres connect error: {0}")]
    Connect(#[source] tokio_postgres::Error),
    /// A statement within a batch failed; the whole batch is considered lost.
    #[error("postgres write error: {0}")]
    Write(#[source] tokio_postgres::Error),
    /// Not a real backend failure: raised by a fault-injecting test double
    /// standing in for a backend.
    #[error("simulated SQL failure: {0}")]
    Injected(String),
}

/// Seam between the ingest worker loop and its SQL backend.
///
/// [`run_worker_with`](super::run_worker_with) is generic over this trait
/// instead of hardcoding [`PostgresWriter`] so its durability logic —
/// connect-with-backoff, proactive overflow spill, spill-before-memory drain
/// ordering, and the shutdown flush — can be driven against a
/// fault-injecting fake in tests without a live database.
#[async_trait]
pub trait SqlWriter: Sized + Send {
    /// Connects to `dsn` and prepares for batched writes against `function_name`.
    async fn connect(dsn: &str, function_name: &str) -> Result<Self, SqlError>;

    /// Commits one batch as a single unit of work.
    async fn write_batch(&mut self, batch: &[QueueEntry]) -> Result<(), SqlError>;
}

/// An open connection plus the prepared call shape for the configured
/// stored procedure.
pub struct PostgresWriter {
    client: Client,
    function_name: String,
}

impl PostgresWriter {
    /// Connects to `dsn` and sets the statement timeout.
    ///
    /// # Errors
    ///
    /// [`SqlError::Connect`] if the connection or initial setup fails.
    pub async fn connect(dsn: &str, function_name: &str) -> Result<Self, SqlError> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls).await.map_err(SqlError::Connect)?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(%error, "postgres connection task ended");
            }
        });

        client
            .execute(&format!("SET statement_timeout = '{}s'", STATEMENT_TIMEOUT.as_secs()), &[])
            .await
            .map_err(SqlError::Connect)?;

        Ok(Self { client, function_name: function_name.to_string() })
    }

    /// Commits `batch` as one transaction: one call to the configured
    /// stored procedure per entry, then a single commit.
    ///
    /// # Errors
    ///
    /// [`SqlError::Write`] if any statement in the transaction fails; the
    /// transaction is rolled back and the whole batch is considered lost
    /// (the caller is expected to spill it).
    pub async fn write_batch(&mut self, batch: &[QueueEntry]) -> Result<(), SqlError> {
        if batch.is_empty() {
            // Heartbeat: detects a dead connection even while the bus is idle.
            self.client.execute("SELECT 1", &[]).await.map_err(SqlError::Write)?;
            return Ok(());
        }

        let transaction = self.client.transaction().await.map_err(SqlError::Write)?;
        let sql = format!(
            "SELECT {}($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.function_name
        );
        let statement = transaction.prepare(&sql).await.map_err(SqlError::Write)?;

        for entry in batch {
            let timestamp = SystemTime::UNIX_EPOCH + entry.timestamp;
            let id_hex: Option<String> = None; // derivable from id + extended; never populated
            let dlc = i16::from(entry.dlc);
            let bus = i32::from(entry.bus);

            transaction
                .execute(
                    &statement,
                    &[
                        &timestamp,
                        &entry.extended,
                        &entry.fd,
                        &(entry.id as i32),
                        &id_hex,
                        &dlc,
                        &entry.payload,
                        &bus,
                        &entry.direction.as_sql_tag(),
                    ],
                )
                .await
                .map_err(SqlError::Write)?;
        }

        transaction.commit().await.map_err(SqlError::Write)?;
        Ok(())
    }
}

#[async_trait]
impl SqlWriter for PostgresWriter {
    async fn connect(dsn: &str, function_name: &str) -> Result<Self, SqlError> {
        Self::connect(dsn, function_name).await
    }

    async fn write_batch(&mut self, batch: &[QueueEntry]) -> Result<(), SqlError> {
        Self::write_batch(self, batch).await
    }
}
