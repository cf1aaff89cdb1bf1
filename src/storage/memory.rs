//! In-memory storage backend.
//!
//! Thread-safe implementation of [`SimulationStore`] backed by a single
//! `RwLock`. Intended for embedded usage, tests, and as the reference
//! behavior the persistent backend must match.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::simulation::{OwnerId, Simulation, SimulationId, SimulationStatus};
use crate::storage::traits::{
    apply_update, sort_recent_first, CasOutcome, SimulationStore, StatusUpdate, StorageError,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct SimulationState {
    by_id: HashMap<SimulationId, Simulation>,
    by_owner: HashMap<OwnerId, HashSet<SimulationId>>,
}

impl SimulationState {
    fn collect<'a>(&self, ids: impl Iterator<Item = &'a SimulationId>) -> Vec<Simulation> {
        let mut out: Vec<Simulation> = ids.filter_map(|id| self.by_id.get(id).cloned()).collect();
        sort_recent_first(&mut out);
        out
    }
}

/// Thread-safe in-memory simulation store.
#[derive(Debug, Default)]
pub struct InMemorySimulationStore {
    state: RwLock<SimulationState>,
}

impl InMemorySimulationStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    ///
    /// # Errors
    /// Returns `Backend` if the lock is poisoned.
    pub fn len(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("simulation.len"))?;
        Ok(state.by_id.len())
    }

    /// Returns true if no records are stored.
    ///
    /// # Errors
    /// Returns `Backend` if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Restore a record verbatim, replacing any prior version.
    ///
    /// Used by durable backends when replaying their log.
    pub(crate) fn restore(&self, record: Simulation) -> Result<(), StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("simulation.restore"))?;
        state
            .by_owner
            .entry(record.owner_id.clone())
            .or_default()
            .insert(record.id);
        state.by_id.insert(record.id, record);
        Ok(())
    }

    /// Every stored record, oldest first.
    pub(crate) fn snapshot(&self) -> Result<Vec<Simulation>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("simulation.snapshot"))?;
        let mut out = state.collect(state.by_id.keys());
        out.reverse();
        Ok(out)
    }
}

impl SimulationStore for InMemorySimulationStore {
    fn insert(&self, record: Simulation) -> Result<(), StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("simulation.insert"))?;

        if state.by_id.contains_key(&record.id) {
            return Err(StorageError::DuplicateKey(record.id));
        }

        state
            .by_owner
            .entry(record.owner_id.clone())
            .or_default()
            .insert(record.id);
        state.by_id.insert(record.id, record);
        Ok(())
    }

    fn compare_and_swap_status(
        &self,
        id: SimulationId,
        expected: SimulationStatus,
        update: StatusUpdate,
    ) -> Result<CasOutcome, StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("simulation.compare_and_swap_status"))?;

        let current = state.by_id.get(&id).ok_or(StorageError::NotFound(id))?;
        if current.status != expected {
            return Ok(CasOutcome::StatusMismatch {
                actual: current.status,
            });
        }

        let next = apply_update(current, update)?;
        state.by_id.insert(id, next.clone());
        Ok(CasOutcome::Swapped(next))
    }

    fn get(&self, id: SimulationId) -> Result<Option<Simulation>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("simulation.get"))?;
        Ok(state.by_id.get(&id).cloned())
    }

    fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Simulation>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("simulation.list_by_owner"))?;

        let Some(ids) = state.by_owner.get(owner) else {
            return Ok(Vec::new());
        };
        Ok(state.collect(ids.iter()))
    }

    fn list_by_status(&self, status: SimulationStatus) -> Result<Vec<Simulation>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("simulation.list_by_status"))?;

        let ids = state
            .by_id
            .values()
            .filter(|s| s.status == status)
            .map(|s| &s.id);
        Ok(state.collect(ids))
    }
}
