//! Abstract storage trait for simulation records.
//!
//! The store is the only shared mutable resource in the engine. Every
//! mutation after insert goes through `compare_and_swap_status`, which is
//! the concurrency-safety primitive the lifecycle controller builds on.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::simulation::{
    DatasetVersions, EngineStamp, OwnerId, Simulation, SimulationId, SimulationResult,
    SimulationStatus,
};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Simulation not found.
    #[error("Simulation not found: {0}")]
    NotFound(SimulationId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(SimulationId),

    /// An update would break a record invariant.
    #[error("Invariant violation on {id}: {reason}")]
    InvariantViolation {
        /// Offending record.
        id: SimulationId,
        /// What would have been broken.
        reason: String,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O failure in a durable backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns true if retrying the operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Field changes applied together with a status swap.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    /// Target status.
    pub to: SimulationStatus,
    /// Time of the transition.
    pub at: DateTime<Utc>,
    /// Engine observed at execution time.
    pub engine: Option<EngineStamp>,
    /// Datasets consumed; write-once.
    pub dataset_versions: Option<DatasetVersions>,
    /// Result, for `COMPLETED`.
    pub result: Option<SimulationResult>,
    /// Reason, for `FAILED`.
    pub failure_reason: Option<String>,
}

impl StatusUpdate {
    /// A bare status change at the current time.
    #[must_use]
    pub fn to(status: SimulationStatus) -> Self {
        Self {
            to: status,
            at: Utc::now(),
            engine: None,
            dataset_versions: None,
            result: None,
            failure_reason: None,
        }
    }
}

/// Outcome of a compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The status matched and the update was applied.
    Swapped(Simulation),
    /// The current status differed from the expected one; nothing changed.
    StatusMismatch {
        /// Status found in the store.
        actual: SimulationStatus,
    },
}

/// Storage trait for simulation records.
///
/// # Safety Considerations
/// - `compare_and_swap_status` must be atomic with respect to every other
///   operation on the same id
/// - Readers must never observe a partially applied update
pub trait SimulationStore: Send + Sync {
    /// Insert a new record. Returns error if ID already exists.
    fn insert(&self, record: Simulation) -> Result<(), StorageError>;

    /// Atomically apply `update` if the record's status equals `expected`.
    ///
    /// # Errors
    /// - `NotFound`: no record with this id
    /// - `InvariantViolation`: the update conflicts with write-once fields
    fn compare_and_swap_status(
        &self,
        id: SimulationId,
        expected: SimulationStatus,
        update: StatusUpdate,
    ) -> Result<CasOutcome, StorageError>;

    /// Get a record by ID.
    fn get(&self, id: SimulationId) -> Result<Option<Simulation>, StorageError>;

    /// All records of `owner`, most recent first (ties by id ascending).
    fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Simulation>, StorageError>;

    /// All records currently in `status`, most recent first (ties by id ascending).
    fn list_by_status(&self, status: SimulationStatus) -> Result<Vec<Simulation>, StorageError>;
}

/// Builds the post-update record. Shared by every backend so the field
/// rules are identical everywhere.
pub(crate) fn apply_update(
    current: &Simulation,
    update: StatusUpdate,
) -> Result<Simulation, StorageError> {
    if !update.to.is_terminal() && (update.result.is_some() || update.failure_reason.is_some()) {
        return Err(StorageError::InvariantViolation {
            id: current.id,
            reason: format!("{} cannot carry a result or failure reason", update.to),
        });
    }

    let mut next = current.clone();
    next.status = update.to;
    next.updated_at = update.at;

    if let Some(engine) = update.engine {
        next.engine = engine;
    }

    if let Some(versions) = update.dataset_versions {
        if !current.dataset_versions.is_empty() && current.dataset_versions != versions {
            return Err(StorageError::InvariantViolation {
                id: current.id,
                reason: "dataset versions are already recorded".to_string(),
            });
        }
        next.dataset_versions = versions;
    }

    match update.to {
        SimulationStatus::Running => {
            next.started_at = Some(update.at);
        }
        SimulationStatus::Completed => {
            if update.result.is_none() || update.failure_reason.is_some() {
                return Err(StorageError::InvariantViolation {
                    id: current.id,
                    reason: "COMPLETED requires a result and no failure reason".to_string(),
                });
            }
            next.result = update.result;
            next.completed_at = Some(update.at);
        }
        SimulationStatus::Failed => {
            if update.failure_reason.is_none() || update.result.is_some() {
                return Err(StorageError::InvariantViolation {
                    id: current.id,
                    reason: "FAILED requires a failure reason and no result".to_string(),
                });
            }
            next.failure_reason = update.failure_reason;
            next.completed_at = Some(update.at);
        }
        SimulationStatus::Queued | SimulationStatus::Postprocessing => {}
    }

    Ok(next)
}

/// Sorts most recent first, ties broken by id ascending.
pub(crate) fn sort_recent_first(records: &mut [Simulation]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::{HazardType, SimulationParameters};

    // Compile-time test: ensure the trait is object-safe
    fn _assert_simulation_store_object_safe(_: &dyn SimulationStore) {}

    fn record() -> Simulation {
        let params = SimulationParameters::new(HazardType::Landslide, "A1");
        let hash = params.parameter_hash();
        Simulation::queued(
            OwnerId::new("owner").unwrap(),
            params,
            hash,
            EngineStamp::new("stability", "1.0.0"),
        )
    }

    #[test]
    fn test_storage_error_display() {
        let id = SimulationId::new();
        let err = StorageError::NotFound(id);
        assert!(err.to_string().contains("Simulation not found"));

        let err = StorageError::Backend("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn running_sets_started_at() {
        let current = record();
        let update = StatusUpdate::to(SimulationStatus::Running);
        let at = update.at;
        let next = apply_update(&current, update).unwrap();
        assert_eq!(next.status, SimulationStatus::Running);
        assert_eq!(next.started_at, Some(at));
        assert_eq!(next.updated_at, at);
        assert_eq!(next.created_at, current.created_at);
    }

    #[test]
    fn completed_requires_result() {
        let current = record();
        let err =
            apply_update(&current, StatusUpdate::to(SimulationStatus::Completed)).unwrap_err();
        assert!(matches!(err, StorageError::InvariantViolation { .. }));
    }

    #[test]
    fn failed_requires_reason_and_sets_completed_at() {
        let current = record();
        let err = apply_update(&current, StatusUpdate::to(SimulationStatus::Failed)).unwrap_err();
        assert!(matches!(err, StorageError::InvariantViolation { .. }));

        let mut update = StatusUpdate::to(SimulationStatus::Failed);
        update.failure_reason = Some("model crashed".to_string());
        let next = apply_update(&current, update).unwrap();
        assert_eq!(next.failure_reason.as_deref(), Some("model crashed"));
        assert!(next.completed_at.is_some());
        assert!(next.result.is_none());
    }

    #[test]
    fn non_terminal_update_cannot_carry_failure() {
        let current = record();
        let mut update = StatusUpdate::to(SimulationStatus::Postprocessing);
        update.failure_reason = Some("nope".to_string());
        assert!(apply_update(&current, update).is_err());
    }

    #[test]
    fn dataset_versions_are_write_once() {
        let mut current = record();
        current.dataset_versions.insert("dem".to_string(), "v1".to_string());

        let mut update = StatusUpdate::to(SimulationStatus::Postprocessing);
        update.dataset_versions =
            Some(DatasetVersions::from([("dem".to_string(), "v2".to_string())]));
        assert!(apply_update(&current, update).is_err());

        let mut update = StatusUpdate::to(SimulationStatus::Postprocessing);
        update.dataset_versions = Some(current.dataset_versions.clone());
        assert!(apply_update(&current, update).is_ok());
    }

    #[test]
    fn sort_orders_recent_first_then_id() {
        let mut a = record();
        let mut b = record();
        let mut c = record();
        let base = Utc::now();
        a.created_at = base;
        b.created_at = base + chrono::Duration::seconds(5);
        c.created_at = base;

        let mut records = vec![a.clone(), b.clone(), c.clone()];
        sort_recent_first(&mut records);

        assert_eq!(records[0].id, b.id);
        let (first, second) = if a.id < c.id { (a.id, c.id) } else { (c.id, a.id) };
        assert_eq!(records[1].id, first);
        assert_eq!(records[2].id, second);
    }
}
