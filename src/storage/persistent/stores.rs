//! Durable simulation store.
//!
//! Wraps an in-memory index for reads and a write-ahead log for
//! durability. Writers are serialized by a single mutex so the log order
//! always matches the order in which swaps became visible.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::simulation::{OwnerId, Simulation, SimulationId, SimulationStatus};
use crate::storage::memory::InMemorySimulationStore;
use crate::storage::traits::{apply_update, CasOutcome, SimulationStore, StatusUpdate, StorageError};

use super::file_lock::FileLock;
use super::wal::{WalEntry, WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

/// File name of the log inside the data directory.
pub const WAL_FILE_NAME: &str = "simulations.wal";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

/// The codec reports unencodable records as `InvalidData`.
fn wal_err(e: &std::io::Error) -> StorageError {
    match e.kind() {
        std::io::ErrorKind::InvalidData => StorageError::Serialization(e.to_string()),
        _ => StorageError::Backend(format!("WAL write failed: {e}")),
    }
}

/// Result of a compaction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    /// Records written to the fresh log.
    pub records: u64,
    /// Log size before compaction.
    pub wal_size_before: u64,
    /// Log size after compaction.
    pub wal_size_after: u64,
}

/// WAL-backed implementation of [`SimulationStore`].
pub struct PersistentSimulationStore {
    dir: PathBuf,
    _lock: FileLock,
    wal: WriteAheadLog,
    index: InMemorySimulationStore,
    write_guard: Mutex<()>,
    config: PersistentConfig,
}

impl std::fmt::Debug for PersistentSimulationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentSimulationStore")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistentSimulationStore {
    /// Opens or creates a store in `dir`, replaying its log.
    ///
    /// # Errors
    /// - `Io` if the directory cannot be created, is locked by another
    ///   store, or the log header is unreadable
    /// - `Backend` if a replayed entry cannot be applied
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let lock = FileLock::acquire(dir)?;

        let (wal, replay) = WriteAheadLog::open(&dir.join(WAL_FILE_NAME), config.sync_on_write)?;

        let store = Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            index: InMemorySimulationStore::new(),
            write_guard: Mutex::new(()),
            config,
        };

        let replayed = replay.entries.len();
        for entry in replay.entries {
            store.apply_replayed(entry)?;
        }

        tracing::info!(
            dir = %store.dir.display(),
            entries = replayed,
            discarded_bytes = replay.discarded_bytes,
            records = store.index.len()?,
            "opened persistent simulation store"
        );
        Ok(store)
    }

    fn apply_replayed(&self, entry: WalEntry) -> Result<(), StorageError> {
        match entry.kind {
            WalEntryKind::Insert(record) => self.index.restore(*record),
            WalEntryKind::StatusSwap {
                id,
                expected,
                record,
            } => {
                match self.index.get(id)? {
                    Some(current)
                        if current.status != expected && current.status != record.status =>
                    {
                        tracing::warn!(
                            simulation_id = %id,
                            sequence = entry.sequence,
                            expected = %expected,
                            actual = %current.status,
                            "replayed swap does not follow the logged status"
                        );
                    }
                    Some(_) => {}
                    None => {
                        return Err(StorageError::Backend(format!(
                            "WAL entry {} swaps unknown simulation {id}",
                            entry.sequence
                        )));
                    }
                }
                self.index.restore(*record)
            }
        }
    }

    /// Rewrites the log with one `Insert` per live record.
    ///
    /// # Errors
    /// Propagates I/O failures; the previous log stays valid on failure.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let _guard = self.write_guard.lock().map_err(|_| lock_err("persistent.compact"))?;
        self.compact_locked()
    }

    fn compact_locked(&self) -> Result<CompactionResult, StorageError> {
        let wal_size_before = self.wal.size_bytes()?;
        let records = self.index.snapshot()?;
        let written = self
            .wal
            .rewrite(records.into_iter().map(|r| WalEntryKind::Insert(Box::new(r))))?;
        let wal_size_after = self.wal.size_bytes()?;

        tracing::debug!(
            records = written,
            wal_size_before,
            wal_size_after,
            "compacted simulation log"
        );
        Ok(CompactionResult {
            records: written,
            wal_size_before,
            wal_size_after,
        })
    }

    /// Compacts when the log outgrows `max_wal_size` and holds superseded
    /// entries. Failures are logged; the write that triggered it already
    /// succeeded.
    fn maybe_compact(&self) {
        let over_limit = match self.wal.size_bytes() {
            Ok(size) => size > self.config.max_wal_size,
            Err(e) => {
                tracing::warn!(error = %e, "could not stat simulation log");
                false
            }
        };
        if !over_limit {
            return;
        }

        let has_garbage = match (self.wal.current_sequence(), self.index.len()) {
            (Ok(seq), Ok(len)) => seq > len as u64,
            _ => false,
        };
        if has_garbage {
            if let Err(e) = self.compact_locked() {
                tracing::warn!(error = %e, "simulation log compaction failed");
            }
        }
    }

    /// Current log size in bytes.
    ///
    /// # Errors
    /// Propagates metadata failures.
    pub fn wal_size(&self) -> Result<u64, StorageError> {
        Ok(self.wal.size_bytes()?)
    }

    /// The data directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SimulationStore for PersistentSimulationStore {
    fn insert(&self, record: Simulation) -> Result<(), StorageError> {
        let _guard = self.write_guard.lock().map_err(|_| lock_err("persistent.insert"))?;

        if self.index.get(record.id)?.is_some() {
            return Err(StorageError::DuplicateKey(record.id));
        }

        self.wal
            .append(WalEntryKind::Insert(Box::new(record.clone())))
            .map_err(|e| wal_err(&e))?;
        self.index.insert(record)?;
        self.maybe_compact();
        Ok(())
    }

    fn compare_and_swap_status(
        &self,
        id: SimulationId,
        expected: SimulationStatus,
        update: StatusUpdate,
    ) -> Result<CasOutcome, StorageError> {
        let _guard = self
            .write_guard
            .lock()
            .map_err(|_| lock_err("persistent.compare_and_swap_status"))?;

        let current = self.index.get(id)?.ok_or(StorageError::NotFound(id))?;
        if current.status != expected {
            return Ok(CasOutcome::StatusMismatch {
                actual: current.status,
            });
        }

        let next = apply_update(&current, update)?;
        self.wal
            .append(WalEntryKind::StatusSwap {
                id,
                expected,
                record: Box::new(next.clone()),
            })
            .map_err(|e| wal_err(&e))?;
        self.index.restore(next.clone())?;
        self.maybe_compact();
        Ok(CasOutcome::Swapped(next))
    }

    fn get(&self, id: SimulationId) -> Result<Option<Simulation>, StorageError> {
        self.index.get(id)
    }

    fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Simulation>, StorageError> {
        self.index.list_by_owner(owner)
    }

    fn list_by_status(&self, status: SimulationStatus) -> Result<Vec<Simulation>, StorageError> {
        self.index.list_by_status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::{HazardType, SimulationParameters};
    use crate::simulation::EngineStamp;
    use tempfile::tempdir;

    fn mk(owner: &str) -> Simulation {
        let params = SimulationParameters::new(HazardType::Landslide, "A1");
        let hash = params.parameter_hash();
        Simulation::queued(
            OwnerId::new(owner).unwrap(),
            params,
            hash,
            EngineStamp::new("stability", "1.0.0"),
        )
    }

    fn config() -> PersistentConfig {
        PersistentConfig {
            sync_on_write: false,
            ..PersistentConfig::default()
        }
    }

    #[test]
    fn wal_errors_are_classified() {
        use std::io::{Error, ErrorKind};

        let unencodable = Error::new(ErrorKind::InvalidData, "entry size 70000000 exceeds maximum");
        match wal_err(&unencodable) {
            StorageError::Serialization(m) => assert!(m.contains("exceeds"), "{m}"),
            other => panic!("unexpected error {other:?}"),
        }

        let disk = Error::new(ErrorKind::Other, "no space left on device");
        match wal_err(&disk) {
            StorageError::Backend(m) => assert!(m.starts_with("WAL write failed"), "{m}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let rec = mk("alice");
        let id = rec.id;

        {
            let store = PersistentSimulationStore::open(dir.path(), config()).unwrap();
            store.insert(rec).unwrap();
            store
                .compare_and_swap_status(
                    id,
                    SimulationStatus::Queued,
                    StatusUpdate::to(SimulationStatus::Running),
                )
                .unwrap();
        }

        let store = PersistentSimulationStore::open(dir.path(), config()).unwrap();
        let got = store.get(id).unwrap().unwrap();
        assert_eq!(got.status, SimulationStatus::Running);
        assert!(got.started_at.is_some());
    }

    #[test]
    fn mismatch_is_not_logged() {
        let dir = tempdir().unwrap();
        let store = PersistentSimulationStore::open(dir.path(), config()).unwrap();
        let rec = mk("alice");
        let id = rec.id;
        store.insert(rec).unwrap();
        let size = store.wal_size().unwrap();

        let out = store
            .compare_and_swap_status(
                id,
                SimulationStatus::Running,
                StatusUpdate::to(SimulationStatus::Postprocessing),
            )
            .unwrap();
        assert!(matches!(out, CasOutcome::StatusMismatch { .. }));
        assert_eq!(store.wal_size().unwrap(), size);
    }

    #[test]
    fn compaction_preserves_contents() {
        let dir = tempdir().unwrap();
        let store = PersistentSimulationStore::open(dir.path(), config()).unwrap();
        let a = mk("alice");
        let b = mk("bob");
        store.insert(a.clone()).unwrap();
        store.insert(b.clone()).unwrap();
        store
            .compare_and_swap_status(
                a.id,
                SimulationStatus::Queued,
                StatusUpdate::to(SimulationStatus::Running),
            )
            .unwrap();

        let result = store.compact().unwrap();
        assert_eq!(result.records, 2);
        assert!(result.wal_size_after <= result.wal_size_before);
        let before_a = store.get(a.id).unwrap().unwrap();
        drop(store);

        let store = PersistentSimulationStore::open(dir.path(), config()).unwrap();
        assert_eq!(store.get(a.id).unwrap().unwrap(), before_a);
        assert_eq!(store.get(b.id).unwrap().unwrap().status, SimulationStatus::Queued);
    }

    #[test]
    fn second_open_fails_while_first_is_live() {
        let dir = tempdir().unwrap();
        let _first = PersistentSimulationStore::open(dir.path(), config()).unwrap();
        assert!(PersistentSimulationStore::open(dir.path(), config()).is_err());
    }
}
