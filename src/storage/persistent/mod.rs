//! Persistent storage backend.
//!
//! Durable, crash-safe storage for simulation records:
//! - Write-ahead log of checksummed entries, replayed on open
//! - Exclusive directory lock so one store owns a directory at a time
//! - Compaction that atomically rewrites the log from live records
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │         PersistentSimulationStore          │
//! ├────────────────────────────────────────────┤
//! │  InMemorySimulationStore   WriteAheadLog   │
//! │     (reads, CAS)          (append-only)    │
//! │              └──────┬──────┘               │
//! │                     ↓                      │
//! │          FileLock (hazardsim.lock)         │
//! └────────────────────────────────────────────┘
//! ```

mod codec;
mod file_lock;
mod stores;
mod wal;

pub use file_lock::{FileLock, LOCK_FILE_NAME};
pub use stores::{CompactionResult, PersistentSimulationStore, WAL_FILE_NAME};
pub use wal::{Replay, WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use crate::error::{HazardResult, ValidationError};

/// Configuration for persistent storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentConfig {
    /// Log size that triggers compaction (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every append.
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024,
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    /// Smallest accepted `max_wal_size`; below this compaction would run on
    /// nearly every write.
    pub const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if `max_wal_size` is below `MIN_WAL_SIZE`.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ValidationError::InvalidConfig {
                field: "max_wal_size".to_string(),
                reason: format!(
                    "must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            });
        }
        Ok(self)
    }
}

/// Open or create a persistent simulation store at `path`.
///
/// # Errors
/// - `InvalidParameters` if the configuration is invalid
/// - `Storage` if the directory cannot be used, is locked by another
///   store, or replay fails
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use hazardsim::storage::persistent::open_store;
///
/// let store = open_store("./hazardsim-data", None)?;
/// let sim = hazardsim::HazardSim::with_store(Arc::new(store), Default::default())?;
/// ```
pub fn open_store(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> HazardResult<PersistentSimulationStore> {
    let cfg = config.unwrap_or_default().validate()?;
    Ok(PersistentSimulationStore::open(path.as_ref(), cfg)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_wal_limit_is_rejected() {
        let cfg = PersistentConfig {
            max_wal_size: 16,
            ..PersistentConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ValidationError::InvalidConfig { .. })
        ));
        assert!(PersistentConfig::default().validate().is_ok());
    }

    #[test]
    fn open_store_rejects_bad_config_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("never-created");
        let err = open_store(
            &target,
            Some(PersistentConfig {
                max_wal_size: 1,
                sync_on_write: false,
            }),
        )
        .unwrap_err();
        assert!(err.is_validation());
        assert!(!target.exists());
    }
}
