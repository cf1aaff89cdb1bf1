//! Execution worker and thread pool.
//!
//! A worker claims a queued simulation with `QUEUED→RUNNING`, runs the
//! registered model, shapes the output and completes the record. Every
//! step after the claim that goes wrong ends in `FAILED`; a claim or
//! failure transition that loses a race is dropped silently.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::dispatch::WorkItem;
use crate::error::{ExecutionError, HazardError, HazardResult};
use crate::geo::{ring_around, DEFAULT_RING_SEGMENTS};
use crate::lifecycle::{LifecycleController, TransitionPayload};
use crate::model::{ComputeInput, ModelOutput};
use crate::simulation::{
    ImpactZone, RiskLevel, Simulation, SimulationResult, SimulationStatus,
};

/// What happened to one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// The simulation reached `COMPLETED`.
    Completed,
    /// The simulation reached `FAILED`.
    Failed,
    /// Another delivery already claimed the simulation.
    Skipped,
    /// No simulation with this id exists.
    Missing,
    /// A transition lost a race, or the store rejected the claim or the
    /// failure record; the record was left for monitoring.
    Abandoned,
}

struct StageFailure {
    stage: SimulationStatus,
    reason: String,
}

impl StageFailure {
    fn running(reason: impl Into<String>) -> Self {
        Self {
            stage: SimulationStatus::Running,
            reason: reason.into(),
        }
    }

    fn postprocessing(reason: impl Into<String>) -> Self {
        Self {
            stage: SimulationStatus::Postprocessing,
            reason: reason.into(),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "model panicked".to_string()
    }
}

fn unit_range(field: &str, value: f64) -> Result<(), String> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("model produced {field} {value} outside [0, 1]"))
    }
}

/// Classifies a rejected forward transition. A lost race leaves the record
/// to whoever moved it; anything else fails it from the stage it is in.
fn stalled(
    record: &Simulation,
    from: SimulationStatus,
    to: SimulationStatus,
    err: HazardError,
) -> Result<StageFailure, HazardError> {
    if err.is_illegal_transition() {
        return Err(err);
    }
    error!(simulation_id = %record.id, %from, %to, error = %err, "could not record transition");
    Ok(StageFailure {
        stage: from,
        reason: ExecutionError::ExecutionFailure {
            message: format!("could not record {to} state"),
        }
        .to_string(),
    })
}

/// Turns raw model output into a stored result: checks score ranges,
/// classifies the risk and projects zone rings around the anchor point.
///
/// Zones are omitted when the parameters carry neither a location nor an
/// area.
///
/// # Errors
/// Returns a displayable reason when the output is out of range.
pub fn shape_result(record: &Simulation, output: ModelOutput) -> Result<SimulationResult, String> {
    unit_range("risk_score", output.risk_score)?;
    unit_range("confidence", output.confidence)?;

    let zones = match record.parameters.anchor() {
        Some(center) => output
            .zones
            .iter()
            .map(|spec| {
                if !spec.radius_km.is_finite() || spec.radius_km <= 0.0 {
                    return Err(format!("model produced invalid zone radius {}", spec.radius_km));
                }
                Ok(ImpactZone {
                    zone_type: spec.zone_type,
                    geometry: ring_around(center, spec.radius_km, DEFAULT_RING_SEGMENTS),
                    area_sq_km: crate::model::round2(
                        std::f64::consts::PI * spec.radius_km * spec.radius_km,
                    ),
                    toxicity_range_ppm: spec.toxicity_ppm,
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    Ok(SimulationResult {
        risk_score: output.risk_score,
        risk_level: RiskLevel::from_score(output.risk_score),
        confidence: output.confidence,
        summary: output.summary,
        zones,
    })
}

/// Drives single work items through the lifecycle.
#[derive(Debug, Clone)]
pub struct ExecutionWorker {
    controller: Arc<LifecycleController>,
}

impl ExecutionWorker {
    /// Creates a worker on top of `controller`.
    #[must_use]
    pub const fn new(controller: Arc<LifecycleController>) -> Self {
        Self { controller }
    }

    /// Processes one item. Never returns an error: every outcome is
    /// either recorded on the simulation or reported as a `WorkOutcome`.
    pub fn process(&self, item: WorkItem) -> WorkOutcome {
        let id = item.simulation_id;

        let claimed = match self.controller.transition(
            id,
            SimulationStatus::Queued,
            SimulationStatus::Running,
            TransitionPayload::none(),
        ) {
            Ok(record) => record,
            Err(e) if e.is_illegal_transition() => {
                debug!(simulation_id = %id, "work item already claimed; skipping");
                return WorkOutcome::Skipped;
            }
            Err(e) if e.is_not_found() => {
                warn!(simulation_id = %id, "work item refers to unknown simulation");
                return WorkOutcome::Missing;
            }
            Err(e) => {
                error!(simulation_id = %id, error = %e, "failed to claim simulation");
                return WorkOutcome::Abandoned;
            }
        };

        match self.execute(&claimed) {
            Ok(()) => {
                info!(simulation_id = %id, "simulation completed");
                WorkOutcome::Completed
            }
            Err(Ok(failure)) => self.fail(&claimed, failure),
            Err(Err(e)) => {
                warn!(
                    simulation_id = %id,
                    error = %e,
                    "simulation transition rejected; abandoning"
                );
                WorkOutcome::Abandoned
            }
        }
    }

    /// `Err(Ok(_))` is a failure to record; `Err(Err(_))` means the record
    /// moved underneath us.
    fn execute(&self, record: &Simulation) -> Result<(), Result<StageFailure, HazardError>> {
        let model = self
            .controller
            .registry()
            .resolve(record.parameters.hazard)
            .map_err(|e| Ok(StageFailure::running(e.to_string())))?;

        let input = ComputeInput {
            simulation_id: record.id,
            parameters: &record.parameters,
            parameter_hash: &record.parameter_hash,
        };
        let output = match catch_unwind(AssertUnwindSafe(|| model.compute(&input))) {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(Ok(StageFailure::running(e.to_string()))),
            Err(payload) => {
                return Err(Ok(StageFailure::running(format!(
                    "model panicked: {}",
                    panic_message(payload.as_ref())
                ))))
            }
        };

        let post = self
            .controller
            .transition(
                record.id,
                SimulationStatus::Running,
                SimulationStatus::Postprocessing,
                TransitionPayload::computed(model.stamp(), output.dataset_versions.clone()),
            )
            .map_err(|e| {
                stalled(record, SimulationStatus::Running, SimulationStatus::Postprocessing, e)
            })?;

        let result = shape_result(&post, output).map_err(|r| Ok(StageFailure::postprocessing(r)))?;

        self.controller
            .transition(
                record.id,
                SimulationStatus::Postprocessing,
                SimulationStatus::Completed,
                TransitionPayload::completed(result),
            )
            .map_err(|e| {
                stalled(record, SimulationStatus::Postprocessing, SimulationStatus::Completed, e)
            })?;
        Ok(())
    }

    fn fail(&self, record: &Simulation, failure: StageFailure) -> WorkOutcome {
        warn!(
            simulation_id = %record.id,
            stage = %failure.stage,
            reason = %failure.reason,
            "simulation failed"
        );
        match self.controller.transition(
            record.id,
            failure.stage,
            SimulationStatus::Failed,
            TransitionPayload::failed(failure.reason),
        ) {
            Ok(_) => WorkOutcome::Failed,
            Err(e) => {
                debug!(
                    simulation_id = %record.id,
                    error = %e,
                    "failure transition rejected; dropping"
                );
                WorkOutcome::Abandoned
            }
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of worker threads (at least 1).
    pub workers: usize,
    /// Thread name prefix.
    pub thread_name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            thread_name: "hazardsim-worker".to_string(),
        }
    }
}

/// Fixed set of threads consuming the work queue.
///
/// Dropping the pool stops it: workers finish their current item and exit.
/// Items still in the queue are not processed; their records stay `QUEUED`.
pub struct WorkerPool {
    shutdown: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Starts `config.workers` threads reading from `rx`.
    ///
    /// # Errors
    /// Returns `Internal` if a thread cannot be spawned; threads already
    /// started are stopped first.
    pub fn start(
        worker: ExecutionWorker,
        rx: Receiver<WorkItem>,
        config: &WorkerPoolConfig,
    ) -> HazardResult<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let mut pool = Self {
            shutdown: Some(shutdown_tx),
            workers: Vec::with_capacity(config.workers.max(1)),
        };

        for idx in 0..config.workers.max(1) {
            let rx = rx.clone();
            let shutdown_rx = shutdown_rx.clone();
            let worker = worker.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{idx}", config.thread_name))
                .spawn(move || run_worker(&worker, &rx, &shutdown_rx))
                .map_err(|e| HazardError::internal(format!("failed to spawn worker thread: {e}")))?;
            pool.workers.push(handle);
        }

        info!(workers = pool.workers.len(), "worker pool started");
        Ok(pool)
    }

    /// Number of worker threads.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stops the workers and waits for them.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Disconnecting the shutdown channel wakes every worker.
        drop(self.shutdown.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(worker: &ExecutionWorker, rx: &Receiver<WorkItem>, shutdown: &Receiver<()>) {
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(rx) -> msg => match msg {
                Ok(item) => {
                    let outcome = worker.process(item);
                    debug!(simulation_id = %item.simulation_id, ?outcome, "work item processed");
                }
                Err(_) => break,
            },
        }
    }
}
