//! Lifecycle controller.
//!
//! Owns creation, ownership checks and every status change. A transition
//! is a compare-and-swap on the store: the record moves only if it is
//! still in the status the caller observed, which makes duplicate or
//! out-of-order worker deliveries harmless.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::dispatch::{WorkDispatcher, WorkItem};
use crate::error::{ExecutionError, HazardError, HazardResult, ValidationError};
use crate::model::ModelRegistry;
use crate::parameters::SimulationParameters;
use crate::simulation::{
    DatasetVersions, EngineStamp, OwnerId, Simulation, SimulationId, SimulationResult,
    SimulationStatus,
};
use crate::storage::{CasOutcome, SimulationStore, StatusUpdate, StorageError};

/// Default bound on stored failure reasons, in bytes.
pub const DEFAULT_FAILURE_REASON_MAX_LEN: usize = 512;

const GENERIC_FAILURE_REASON: &str = "simulation failed";

/// Fields carried alongside a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionPayload {
    /// Engine observed at execution time.
    pub engine: Option<EngineStamp>,
    /// Datasets consumed by the computation.
    pub dataset_versions: Option<DatasetVersions>,
    /// Result; only valid when entering `COMPLETED`.
    pub result: Option<SimulationResult>,
    /// Reason; only valid when entering `FAILED`.
    pub failure_reason: Option<String>,
}

impl TransitionPayload {
    /// No extra fields.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Engine stamp and dataset versions recorded after computing.
    #[must_use]
    pub fn computed(engine: EngineStamp, dataset_versions: DatasetVersions) -> Self {
        Self {
            engine: Some(engine),
            dataset_versions: Some(dataset_versions),
            ..Self::default()
        }
    }

    /// Final result.
    #[must_use]
    pub fn completed(result: SimulationResult) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    /// Failure reason.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    fn validate_for(&self, to: SimulationStatus) -> Result<(), ValidationError> {
        let reject = |reason: &str| {
            Err(ValidationError::InvalidTransitionPayload {
                to,
                reason: reason.to_string(),
            })
        };

        match to {
            SimulationStatus::Completed => {
                if self.result.is_none() {
                    return reject("a result is required");
                }
                if self.failure_reason.is_some() {
                    return reject("a completed simulation cannot carry a failure reason");
                }
            }
            SimulationStatus::Failed => {
                if self.result.is_some() {
                    return reject("a failed simulation cannot carry a result");
                }
                if self.failure_reason.as_deref().map_or(true, |r| r.trim().is_empty()) {
                    return reject("a non-empty failure reason is required");
                }
            }
            SimulationStatus::Queued
            | SimulationStatus::Running
            | SimulationStatus::Postprocessing => {
                if self.result.is_some() || self.failure_reason.is_some() {
                    return reject("only terminal states carry a result or failure reason");
                }
            }
        }
        Ok(())
    }
}

/// Makes a failure reason safe to store and display: control characters
/// become spaces, whitespace runs collapse, and the text is cut to
/// `max_len` bytes on a character boundary.
#[must_use]
pub fn sanitize_failure_reason(raw: &str, max_len: usize) -> String {
    let cleaned = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if cleaned.is_empty() {
        return GENERIC_FAILURE_REASON.to_string();
    }
    if cleaned.len() <= max_len {
        return cleaned;
    }

    let mut end = max_len;
    while end > 0 && !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    let truncated = cleaned[..end].trim_end();
    if truncated.is_empty() {
        GENERIC_FAILURE_REASON.to_string()
    } else {
        truncated.to_string()
    }
}

fn map_storage(err: StorageError) -> HazardError {
    match err {
        StorageError::NotFound(id) => HazardError::not_found(id),
        other => HazardError::Storage(other),
    }
}

/// Creates simulations and drives their status changes.
pub struct LifecycleController {
    store: Arc<dyn SimulationStore>,
    dispatcher: Arc<dyn WorkDispatcher>,
    registry: Arc<ModelRegistry>,
    failure_reason_max_len: usize,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("registry", &self.registry)
            .field("failure_reason_max_len", &self.failure_reason_max_len)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    /// Creates a controller.
    #[must_use]
    pub fn new(
        store: Arc<dyn SimulationStore>,
        dispatcher: Arc<dyn WorkDispatcher>,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            registry,
            failure_reason_max_len: DEFAULT_FAILURE_REASON_MAX_LEN,
        }
    }

    /// Overrides the failure reason bound.
    #[must_use]
    pub fn with_failure_reason_max_len(mut self, max_len: usize) -> Self {
        self.failure_reason_max_len = max_len.max(1);
        self
    }

    /// Bound applied to stored failure reasons.
    #[must_use]
    pub const fn failure_reason_max_len(&self) -> usize {
        self.failure_reason_max_len
    }

    /// The model registry.
    #[must_use]
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SimulationStore> {
        &self.store
    }

    /// Stores a new `QUEUED` simulation and hands it to the worker queue.
    ///
    /// Returns as soon as the record is stored and dispatched; it never
    /// waits for execution.
    ///
    /// # Errors
    /// - `InvalidParameters` for malformed input or an unsupported hazard
    /// - `Execution(Dispatch)` if the record was stored but could not be
    ///   queued; it stays `QUEUED` until `redispatch_queued`
    /// - `Storage` on backend failures
    pub fn create(
        &self,
        owner: &OwnerId,
        parameters: SimulationParameters,
    ) -> HazardResult<Simulation> {
        parameters.validate()?;
        let model = self.registry.resolve(parameters.hazard)?;

        let hash = parameters.parameter_hash();
        let record = Simulation::queued(owner.clone(), parameters, hash, model.stamp());
        let id = record.id;
        self.store.insert(record.clone())?;

        info!(
            simulation_id = %id,
            owner = %owner,
            hazard = %record.parameters.hazard,
            engine = %record.engine,
            "simulation queued"
        );

        if let Err(e) = self.dispatcher.dispatch(WorkItem::new(id)) {
            warn!(simulation_id = %id, error = %e, "simulation stored but not dispatched");
            return Err(ExecutionError::Dispatch {
                id,
                reason: e.to_string(),
            }
            .into());
        }

        Ok(record)
    }

    /// Moves `id` from `from` to `to` if it is still in `from`.
    ///
    /// # Errors
    /// - `IllegalTransition` if the edge is not in the lifecycle graph or
    ///   the record's status is no longer `from`
    /// - `InvalidParameters` if the payload does not fit `to`
    /// - `NotFound` for unknown ids
    pub fn transition(
        &self,
        id: SimulationId,
        from: SimulationStatus,
        to: SimulationStatus,
        payload: TransitionPayload,
    ) -> HazardResult<Simulation> {
        if !from.can_transition_to(to) {
            return Err(ExecutionError::IllegalTransition {
                id,
                from,
                to,
                detail: "not a lifecycle edge".to_string(),
            }
            .into());
        }
        payload.validate_for(to)?;

        let update = StatusUpdate {
            to,
            at: Utc::now(),
            engine: payload.engine,
            dataset_versions: payload.dataset_versions,
            result: payload.result,
            failure_reason: payload
                .failure_reason
                .map(|r| sanitize_failure_reason(&r, self.failure_reason_max_len)),
        };

        match self
            .store
            .compare_and_swap_status(id, from, update)
            .map_err(map_storage)?
        {
            CasOutcome::Swapped(record) => {
                debug!(simulation_id = %id, from = %from, to = %to, "transition applied");
                Ok(record)
            }
            CasOutcome::StatusMismatch { actual } => Err(ExecutionError::IllegalTransition {
                id,
                from,
                to,
                detail: format!("current status is {actual}"),
            }
            .into()),
        }
    }

    /// Fetches a record owned by `owner`.
    ///
    /// # Errors
    /// `NotFound` both for unknown ids and for records owned by someone else.
    pub fn get_for_owner(&self, id: SimulationId, owner: &OwnerId) -> HazardResult<Simulation> {
        match self.store.get(id)? {
            Some(record) if record.is_owned_by(owner) => Ok(record),
            _ => Err(HazardError::not_found(id)),
        }
    }

    /// All records owned by `owner`, most recent first.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn list_for_owner(&self, owner: &OwnerId) -> HazardResult<Vec<Simulation>> {
        Ok(self.store.list_by_owner(owner)?)
    }

    /// Ids of `QUEUED` records, oldest first.
    ///
    /// With `older_than`, only records untouched for at least that long are
    /// returned; fresher ones are most likely still sitting in the queue.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn queued_backlog(&self, older_than: Option<Duration>) -> HazardResult<Vec<SimulationId>> {
        let mut queued = self.store.list_by_status(SimulationStatus::Queued)?;
        if let Some(age) = older_than {
            let cutoff = Utc::now() - age;
            queued.retain(|r| r.updated_at < cutoff);
        }
        Ok(queued.iter().rev().map(|r| r.id).collect())
    }

    /// Dispatches a work item for every `QUEUED` record, oldest first.
    ///
    /// Returns the number dispatched. Stops early when the queue fills;
    /// the remaining records stay `QUEUED` for a later call.
    ///
    /// # Errors
    /// Propagates storage failures and a disconnected queue.
    pub fn redispatch_queued(&self) -> HazardResult<usize> {
        let queued = self.queued_backlog(None)?;
        let total = queued.len();

        let mut dispatched = 0;
        for id in queued {
            match self.dispatcher.dispatch(WorkItem::new(id)) {
                Ok(()) => dispatched += 1,
                Err(ExecutionError::QueueFull { capacity }) => {
                    warn!(
                        dispatched,
                        remaining = total - dispatched,
                        capacity,
                        "work queue full during redispatch"
                    );
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if total > 0 {
            info!(dispatched, total, "redispatched queued simulations");
        }
        Ok(dispatched)
    }

    /// Non-terminal records whose last change is older than `older_than`.
    ///
    /// Read-only; nothing is expired or retried.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn find_stalled(&self, older_than: Duration) -> HazardResult<Vec<Simulation>> {
        let cutoff = Utc::now() - older_than;
        let mut stalled = Vec::new();
        for status in [
            SimulationStatus::Queued,
            SimulationStatus::Running,
            SimulationStatus::Postprocessing,
        ] {
            stalled.extend(
                self.store
                    .list_by_status(status)?
                    .into_iter()
                    .filter(|r| r.updated_at < cutoff),
            );
        }
        crate::storage::sort_recent_first(&mut stalled);
        Ok(stalled)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::dispatch::work_channel;
    use crate::parameters::HazardType;
    use crate::simulation::{ResultSummary, RiskLevel};
    use crate::storage::InMemorySimulationStore;

    #[derive(Default)]
    struct Recording {
        items: Mutex<Vec<WorkItem>>,
        fail: bool,
    }

    impl WorkDispatcher for Recording {
        fn dispatch(&self, item: WorkItem) -> Result<(), ExecutionError> {
            if self.fail {
                return Err(ExecutionError::QueueFull { capacity: 0 });
            }
            self.items.lock().unwrap().push(item);
            Ok(())
        }
    }

    fn controller(fail: bool) -> (LifecycleController, Arc<Recording>) {
        let dispatcher = Arc::new(Recording {
            fail,
            ..Recording::default()
        });
        let controller = LifecycleController::new(
            Arc::new(InMemorySimulationStore::new()),
            dispatcher.clone(),
            Arc::new(ModelRegistry::builtin()),
        );
        (controller, dispatcher)
    }

    fn claim(c: &LifecycleController, id: SimulationId) -> HazardResult<Simulation> {
        c.transition(
            id,
            SimulationStatus::Queued,
            SimulationStatus::Running,
            TransitionPayload::none(),
        )
    }

    fn owner(s: &str) -> OwnerId {
        OwnerId::new(s).unwrap()
    }

    fn result() -> SimulationResult {
        SimulationResult {
            risk_score: 0.5,
            risk_level: RiskLevel::Moderate,
            confidence: 0.9,
            summary: ResultSummary::Hazard {
                horizon: crate::parameters::TimeHorizon::Hours24,
                expected_window_from_hours: 12,
                expected_window_to_hours: 24,
                scenario_impacts: Vec::new(),
            },
            zones: Vec::new(),
        }
    }

    #[test]
    fn create_stores_queued_and_dispatches() {
        let (c, d) = controller(false);
        let sim = c
            .create(&owner("alice"), SimulationParameters::new(HazardType::Landslide, "A1"))
            .unwrap();

        assert_eq!(sim.status, SimulationStatus::Queued);
        assert_eq!(sim.engine.name, "stability");
        assert_eq!(d.items.lock().unwrap().as_slice(), &[WorkItem::new(sim.id)]);
        assert_eq!(c.get_for_owner(sim.id, &owner("alice")).unwrap(), sim);
    }

    #[test]
    fn create_rejects_invalid_parameters() {
        let (c, d) = controller(false);
        let err = c
            .create(&owner("alice"), SimulationParameters::new(HazardType::Flood, "F1"))
            .unwrap_err();
        assert!(err.is_validation());
        assert!(d.items.lock().unwrap().is_empty());
    }

    #[test]
    fn create_rejects_unregistered_hazard() {
        let c = LifecycleController::new(
            Arc::new(InMemorySimulationStore::new()),
            Arc::new(Recording::default()),
            Arc::new(ModelRegistry::new()),
        );
        let err = c
            .create(&owner("alice"), SimulationParameters::new(HazardType::Landslide, "A1"))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn failed_dispatch_leaves_record_queued() {
        let (c, _) = controller(true);
        let err = c
            .create(&owner("alice"), SimulationParameters::new(HazardType::Landslide, "A1"))
            .unwrap_err();

        let HazardError::Execution(ExecutionError::Dispatch { id, .. }) = err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(err.status_code(), 503);
        let stored = c.get_for_owner(id, &owner("alice")).unwrap();
        assert_eq!(stored.status, SimulationStatus::Queued);
    }

    #[test]
    fn redispatch_sends_queued_oldest_first() {
        let (c, d) = controller(false);
        let a = c
            .create(&owner("alice"), SimulationParameters::new(HazardType::Landslide, "A1"))
            .unwrap();
        let b = c
            .create(&owner("alice"), SimulationParameters::new(HazardType::Landslide, "A2"))
            .unwrap();
        claim(&c, b.id).unwrap();
        d.items.lock().unwrap().clear();

        assert_eq!(c.redispatch_queued().unwrap(), 1);
        assert_eq!(d.items.lock().unwrap().as_slice(), &[WorkItem::new(a.id)]);
    }

    #[test]
    fn duplicate_claim_is_illegal() {
        let (c, _) = controller(false);
        let sim = c
            .create(&owner("alice"), SimulationParameters::new(HazardType::Landslide, "A1"))
            .unwrap();

        claim(&c, sim.id).unwrap();
        let err = claim(&c, sim.id).unwrap_err();
        assert!(err.is_illegal_transition());
    }

    #[test]
    fn edges_outside_graph_are_rejected() {
        let (c, _) = controller(false);
        let sim = c
            .create(&owner("alice"), SimulationParameters::new(HazardType::Landslide, "A1"))
            .unwrap();
        let err = c
            .transition(
                sim.id,
                SimulationStatus::Queued,
                SimulationStatus::Completed,
                TransitionPayload::completed(result()),
            )
            .unwrap_err();
        assert!(err.is_illegal_transition());
        assert_eq!(
            c.get_for_owner(sim.id, &owner("alice")).unwrap().status,
            SimulationStatus::Queued
        );
    }

    #[test]
    fn payload_must_fit_target() {
        let (c, _) = controller(false);
        let sim = c
            .create(&owner("alice"), SimulationParameters::new(HazardType::Landslide, "A1"))
            .unwrap();
        claim(&c, sim.id).unwrap();

        let err = c
            .transition(
                sim.id,
                SimulationStatus::Running,
                SimulationStatus::Failed,
                TransitionPayload::failed("  "),
            )
            .unwrap_err();
        assert!(err.is_validation());

        let err = c
            .transition(
                sim.id,
                SimulationStatus::Running,
                SimulationStatus::Postprocessing,
                TransitionPayload::completed(result()),
            )
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn full_path_to_completed() {
        let (c, _) = controller(false);
        let sim = c
            .create(&owner("alice"), SimulationParameters::new(HazardType::Landslide, "A1"))
            .unwrap();
        claim(&c, sim.id).unwrap();
        c.transition(
            sim.id,
            SimulationStatus::Running,
            SimulationStatus::Postprocessing,
            TransitionPayload::computed(
                EngineStamp::new("stability", "1.2.0"),
                DatasetVersions::from([("DEM".to_string(), "v1".to_string())]),
            ),
        )
        .unwrap();
        let done = c
            .transition(
                sim.id,
                SimulationStatus::Postprocessing,
                SimulationStatus::Completed,
                TransitionPayload::completed(result()),
            )
            .unwrap();

        assert!(done.is_terminal());
        assert!(done.result.is_some());
        assert!(done.failure_reason.is_none());
        assert!(done.completed_at.is_some());
        assert_eq!(done.dataset_versions.get("DEM").map(String::as_str), Some("v1"));
    }

    #[test]
    fn foreign_and_missing_look_the_same() {
        let (c, _) = controller(false);
        let sim = c
            .create(&owner("alice"), SimulationParameters::new(HazardType::Landslide, "A1"))
            .unwrap();

        let foreign = c.get_for_owner(sim.id, &owner("mallory")).unwrap_err();
        let missing = c.get_for_owner(SimulationId::new(), &owner("alice")).unwrap_err();
        assert!(foreign.is_not_found());
        assert!(missing.is_not_found());
        assert_eq!(foreign.public_message(), missing.public_message());
    }

    #[test]
    fn transition_on_unknown_id_is_not_found() {
        let (c, _) = controller(false);
        let err = c
            .transition(
                SimulationId::new(),
                SimulationStatus::Queued,
                SimulationStatus::Running,
                TransitionPayload::none(),
            )
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn find_stalled_uses_updated_at() {
        let (c, _) = controller(false);
        let sim = c
            .create(&owner("alice"), SimulationParameters::new(HazardType::Landslide, "A1"))
            .unwrap();
        claim(&c, sim.id).unwrap();

        assert!(c.find_stalled(Duration::hours(1)).unwrap().is_empty());
        let stalled = c.find_stalled(Duration::seconds(-1)).unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, sim.id);
    }

    #[test]
    fn queued_backlog_filters_by_age() {
        let (c, _) = controller(false);
        let ids: Vec<_> = (0..3)
            .map(|i| {
                std::thread::sleep(std::time::Duration::from_millis(2));
                let params = SimulationParameters::new(HazardType::Landslide, format!("A{i}"));
                c.create(&owner("alice"), params).unwrap().id
            })
            .collect();
        claim(&c, ids[1]).unwrap();

        assert_eq!(c.queued_backlog(None).unwrap(), vec![ids[0], ids[2]]);
        assert!(c.queued_backlog(Some(Duration::hours(1))).unwrap().is_empty());
        assert_eq!(c.queued_backlog(Some(Duration::seconds(-1))).unwrap().len(), 2);
    }

    #[test]
    fn failure_reasons_are_sanitized() {
        assert_eq!(sanitize_failure_reason("boom\n\tat line 3", 64), "boom at line 3");
        assert_eq!(sanitize_failure_reason("\u{0}\n", 64), GENERIC_FAILURE_REASON);
        assert_eq!(sanitize_failure_reason("héllo world", 2), "h");
        assert!(sanitize_failure_reason(&"x".repeat(1000), 100).len() <= 100);
    }

    #[test]
    fn channel_dispatcher_integrates() {
        let (dispatcher, rx) = work_channel(4);
        let c = LifecycleController::new(
            Arc::new(InMemorySimulationStore::new()),
            Arc::new(dispatcher),
            Arc::new(ModelRegistry::builtin()),
        );
        let sim = c
            .create(&owner("alice"), SimulationParameters::new(HazardType::Subsidence, "S1"))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().simulation_id, sim.id);
    }
}
