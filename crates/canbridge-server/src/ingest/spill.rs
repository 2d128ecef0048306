//! Durable on-disk spill queue for [`QueueEntry`] rows the ingest worker
//! cannot commit to the SQL store right now.
//!
//! One `redb` table keyed by an 8-byte big-endian append order, values are
//! single CBOR-encoded entries. A table range scan in key order is therefore
//! exactly the drain order the ingest worker needs. Owned exclusively by the
//! ingest worker (no `Clone`, no `Arc<Database>`), so `reset` can take
//! `&mut self` and actually reclaim disk space via `Database::compact`.

use std::path::{Path, PathBuf};

use canbridge_core::QueueEntry;
use redb::{Database, ReadableTable, TableDefinition};
use thiserror::Error;

const ENTRIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("spill_entries");

/// Errors from the disk spill store.
#[derive(Error, Debug)]
pub enum SpillError {
    /// Underlying `redb` failure (open, transaction, or table operation).
    #[error("spill store I/O error: {0}")]
    Io(String),
    /// CBOR encode/decode failure for a stored entry.
    #[error("spill store serialization error: {0}")]
    Serialization(String),
    /// The store is at or above its configured capacity; the batch was not
    /// written.
    #[error("spill store is full ({size_bytes} bytes, max {max_bytes})")]
    Full {
        /// Current on-disk size.
        size_bytes: u64,
        /// Configured maximum.
        max_bytes: u64,
    },
}

/// Default maximum spill store size: 1 GiB.
pub const DEFAULT_MAX_BYTES: u64 = 1024 * 1024 * 1024;

/// Durable, ordered, size-bounded queue of entries awaiting an SQL
/// connection.
pub struct SpillStore {
    db: Database,
    path: PathBuf,
    next_id: u64,
    max_bytes: u64,
}

impl SpillStore {
    /// Opens (creating if absent) a spill store at `path`.
    ///
    /// # Errors
    ///
    /// [`SpillError::Io`] if the database file cannot be created or opened.
    pub fn open(path: impl AsRef<Path>, max_bytes: u64) -> Result<Self, SpillError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path).map_err(|e| SpillError::Io(e.to_string()))?;

        let next_id = {
            let txn = db.begin_write().map_err(|e| SpillError::Io(e.to_string()))?;
            let next_id = {
                let table = txn.open_table(ENTRIES).map_err(|e| SpillError::Io(e.to_string()))?;
                last_key(&table)?.map_or(0, |id| id + 1)
            };
            txn.commit().map_err(|e| SpillError::Io(e.to_string()))?;
            next_id
        };

        Ok(Self { db, path, next_id, max_bytes })
    }

    /// Atomically appends `batch`, each entry receiving a new
    /// strictly-increasing id. Fails without writing anything if the store
    /// is already full.
    ///
    /// # Errors
    ///
    /// [`SpillError::Full`] if appending would exceed the configured
    /// capacity; [`SpillError::Io`]/[`SpillError::Serialization`] on
    /// underlying failures.
    pub fn append(&mut self, batch: &[QueueEntry]) -> Result<(), SpillError> {
        if batch.is_empty() {
            return Ok(());
        }

        let size = self.size_bytes()?;
        if size >= self.max_bytes {
            return Err(SpillError::Full { size_bytes: size, max_bytes: self.max_bytes });
        }

        let txn = self.db.begin_write().map_err(|e| SpillError::Io(e.to_string()))?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(|e| SpillError::Io(e.to_string()))?;
            for entry in batch {
                let mut bytes = Vec::new();
                ciborium::into_writer(entry, &mut bytes)
                    .map_err(|e| SpillError::Serialization(e.to_string()))?;
                let key = self.next_id.to_be_bytes();
                table.insert(key.as_slice(), bytes.as_slice()).map_err(|e| SpillError::Io(e.to_string()))?;
                self.next_id += 1;
            }
        }
        txn.commit().map_err(|e| SpillError::Io(e.to_string()))?;
        Ok(())
    }

    /// Reads up to `limit` of the oldest still-present entries, in append
    /// order.
    ///
    /// # Errors
    ///
    /// [`SpillError::Io`]/[`SpillError::Serialization`] on underlying failures.
    pub fn read_oldest(&self, limit: usize) -> Result<Vec<(u64, QueueEntry)>, SpillError> {
        let txn = self.db.begin_read().map_err(|e| SpillError::Io(e.to_string()))?;
        let table = txn.open_table(ENTRIES).map_err(|e| SpillError::Io(e.to_string()))?;

        let mut out = Vec::with_capacity(limit);
        for result in table.iter().map_err(|e| SpillError::Io(e.to_string()))? {
            if out.len() >= limit {
                break;
            }
            let (key, value) = result.map_err(|e| SpillError::Io(e.to_string()))?;
            let id = decode_key(key.value());
            let entry: QueueEntry = ciborium::from_reader(value.value())
                .map_err(|e| SpillError::Serialization(e.to_string()))?;
            out.push((id, entry));
        }
        Ok(out)
    }

    /// Removes committed entries by id.
    ///
    /// # Errors
    ///
    /// [`SpillError::Io`] on underlying failures.
    pub fn delete(&mut self, ids: &[u64]) -> Result<(), SpillError> {
        let txn = self.db.begin_write().map_err(|e| SpillError::Io(e.to_string()))?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(|e| SpillError::Io(e.to_string()))?;
            for id in ids {
                table.remove(id.to_be_bytes().as_slice()).map_err(|e| SpillError::Io(e.to_string()))?;
            }
        }
        txn.commit().map_err(|e| SpillError::Io(e.to_string()))?;
        Ok(())
    }

    /// Current on-disk size of the backing file.
    ///
    /// # Errors
    ///
    /// [`SpillError::Io`] if the file's metadata cannot be read.
    pub fn size_bytes(&self) -> Result<u64, SpillError> {
        std::fs::metadata(&self.path).map(|m| m.len()).map_err(|e| SpillError::Io(e.to_string()))
    }

    /// Whether the store is at or above its configured capacity.
    ///
    /// # Errors
    ///
    /// [`SpillError::Io`] if the file's metadata cannot be read.
    pub fn is_full(&self) -> Result<bool, SpillError> {
        Ok(self.size_bytes()? >= self.max_bytes)
    }

    /// Whether the store currently holds no entries.
    ///
    /// # Errors
    ///
    /// [`SpillError::Io`] on underlying failures.
    pub fn is_empty(&self) -> Result<bool, SpillError> {
        let txn = self.db.begin_read().map_err(|e| SpillError::Io(e.to_string()))?;
        let table = txn.open_table(ENTRIES).map_err(|e| SpillError::Io(e.to_string()))?;
        Ok(table.is_empty().map_err(|e| SpillError::Io(e.to_string()))?)
    }

    /// Number of entries currently present, including any left over from a
    /// prior process's crash or unclean shutdown. Callers that maintain a
    /// process-lifetime counter of spilled entries must seed it from this on
    /// open, since a fresh `AtomicU64` otherwise has no knowledge of entries
    /// that were durably appended by an earlier run.
    ///
    /// # Errors
    ///
    /// [`SpillError::Io`] on underlying failures.
    pub fn len(&self) -> Result<u64, SpillError> {
        let txn = self.db.begin_read().map_err(|e| SpillError::Io(e.to_string()))?;
        let table = txn.open_table(ENTRIES).map_err(|e| SpillError::Io(e.to_string()))?;
        table.len().map_err(|e| SpillError::Io(e.to_string()))
    }

    /// Deletes all entries and compacts the backing file to reclaim space.
    ///
    /// # Errors
    ///
    /// [`SpillError::Io`] on underlying failures.
    pub fn reset(&mut self) -> Result<(), SpillError> {
        let txn = self.db.begin_write().map_err(|e| SpillError::Io(e.to_string()))?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(|e| SpillError::Io(e.to_string()))?;
            let keys: Vec<Vec<u8>> = table
                .iter()
                .map_err(|e| SpillError::Io(e.to_string()))?
                .map(|r| r.map(|(k, _)| k.value().to_vec()))
                .collect::<Result<_, _>>()
                .map_err(|e| SpillError::Io(e.to_string()))?;
            for key in keys {
                table.remove(key.as_slice()).map_err(|e| SpillError::Io(e.to_string()))?;
            }
        }
        txn.commit().map_err(|e| SpillError::Io(e.to_string()))?;

        self.db.compact().map_err(|e| SpillError::Io(e.to_string()))?;
        Ok(())
    }
}

fn last_key<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
) -> Result<Option<u64>, SpillError> {
    let last = table.iter().map_err(|e| SpillError::Io(e.to_string()))?.next_back();
    match last {
        Some(result) => {
            let (key, _) = result.map_err(|e| SpillError::Io(e.to_string()))?;
            Ok(Some(decode_key(key.value())))
        },
        None => Ok(None),
    }
}

/// Decodes an 8-byte big-endian key back into its append-order id. Every key
/// in the table was written by [`SpillStore::append`] from `u64::to_be_bytes`,
/// so a short key would mean a corrupted table, not a data condition to
/// recover from gracefully.
#[allow(clippy::expect_used, reason = "key width is an append-time invariant, not user input")]
fn decode_key(bytes: &[u8]) -> u64 {
    u64::from_be_bytes(bytes.try_into().expect("spill store key is always 8 bytes"))
}
