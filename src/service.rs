//! Top-level service handle.
//!
//! `HazardSim` wires a store, the work queue, the lifecycle controller, the
//! worker pool, the requeuer and the query façade together. Dropping it
//! stops the background threads; anything still queued stays `QUEUED` and
//! is re-dispatched the next time a service is started on the same store.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::HazardSimConfig;
use crate::dispatch::{work_channel, ChannelDispatcher, WorkDispatcher};
use crate::error::{HazardError, HazardResult};
use crate::geo::BoundingBox;
use crate::lifecycle::LifecycleController;
use crate::model::ModelRegistry;
use crate::parameters::SimulationParameters;
use crate::query::{
    GeometryView, HeatmapResolution, HeatmapView, ListQuery, Page, QueryFacade, ResultView,
    StatusView,
};
use crate::requeue::Requeuer;
use crate::simulation::{OwnerId, Simulation, SimulationId};
use crate::storage::{InMemorySimulationStore, SimulationStore};
use crate::worker::{ExecutionWorker, WorkerPool, WorkerPoolConfig};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A running hazard simulation service.
#[derive(Debug)]
pub struct HazardSim {
    controller: Arc<LifecycleController>,
    query: QueryFacade,
    dispatcher: Arc<ChannelDispatcher>,
    requeuer: Requeuer,
    pool: WorkerPool,
}

impl HazardSim {
    /// Starts a service backed by an in-memory store.
    ///
    /// # Errors
    /// Returns `InvalidParameters` for an invalid configuration and
    /// `Internal` if worker threads cannot be spawned.
    pub fn in_memory(config: HazardSimConfig) -> HazardResult<Self> {
        Self::with_store(Arc::new(InMemorySimulationStore::new()), config)
    }

    /// Starts a service on `config.data_dir` using the persistent store.
    ///
    /// # Errors
    /// Returns `InvalidParameters` if no data directory is configured, plus
    /// every error [`crate::storage::persistent::open_store`] returns.
    #[cfg(feature = "persistent")]
    pub fn open(config: HazardSimConfig) -> HazardResult<Self> {
        let dir = config.data_dir.clone().ok_or_else(|| {
            crate::error::ValidationError::InvalidConfig {
                field: "data_dir".to_string(),
                reason: "persistent storage requires a data directory".to_string(),
            }
        })?;
        let store = crate::storage::persistent::open_store(dir, None)?;
        Self::with_store(Arc::new(store), config)
    }

    /// Starts a service on `store` with the built-in models.
    ///
    /// # Errors
    /// See [`HazardSim::in_memory`].
    pub fn with_store(
        store: Arc<dyn SimulationStore>,
        config: HazardSimConfig,
    ) -> HazardResult<Self> {
        Self::with_registry(store, ModelRegistry::builtin(), config)
    }

    /// Starts a service on `store` with a custom model registry.
    ///
    /// Simulations found `QUEUED` in the store, and any that later miss the
    /// queue, are dispatched again by the requeuer once the pool is running.
    ///
    /// # Errors
    /// See [`HazardSim::in_memory`].
    pub fn with_registry(
        store: Arc<dyn SimulationStore>,
        registry: ModelRegistry,
        config: HazardSimConfig,
    ) -> HazardResult<Self> {
        let config = config.validate()?;
        let (dispatcher, rx) = work_channel(config.queue_capacity);
        let dispatcher = Arc::new(dispatcher);

        let queue: Arc<dyn WorkDispatcher> = dispatcher.clone();
        let controller = Arc::new(
            LifecycleController::new(store, queue, Arc::new(registry))
                .with_failure_reason_max_len(config.failure_reason_max_len),
        );
        let pool = WorkerPool::start(
            ExecutionWorker::new(Arc::clone(&controller)),
            rx,
            &WorkerPoolConfig {
                workers: config.workers,
                ..WorkerPoolConfig::default()
            },
        )?;

        let requeuer = Requeuer::start(
            Arc::clone(&controller),
            Arc::clone(&dispatcher),
            config.requeue_interval,
        )?;
        info!(
            workers = pool.size(),
            queue_capacity = dispatcher.capacity(),
            requeue_interval = ?config.requeue_interval,
            "hazardsim started"
        );

        Ok(Self {
            query: QueryFacade::new(Arc::clone(&controller)),
            controller,
            dispatcher,
            requeuer,
            pool,
        })
    }

    /// Validates and stores a new simulation and queues it for execution.
    ///
    /// # Errors
    /// See [`LifecycleController::create`].
    pub fn create(
        &self,
        owner: &OwnerId,
        parameters: SimulationParameters,
    ) -> HazardResult<Simulation> {
        self.controller.create(owner, parameters)
    }

    /// See [`QueryFacade::status`].
    ///
    /// # Errors
    /// `NotFound` for unknown or foreign ids.
    pub fn status(&self, id: SimulationId, owner: &OwnerId) -> HazardResult<StatusView> {
        self.query.status(id, owner)
    }

    /// See [`QueryFacade::result`].
    ///
    /// # Errors
    /// `NotFound` for unknown or foreign ids.
    pub fn result(&self, id: SimulationId, owner: &OwnerId) -> HazardResult<ResultView> {
        self.query.result(id, owner)
    }

    /// See [`QueryFacade::geometry`].
    ///
    /// # Errors
    /// `NotFound` for unknown or foreign ids.
    pub fn geometry(
        &self,
        id: SimulationId,
        owner: &OwnerId,
        bbox: Option<&BoundingBox>,
    ) -> HazardResult<GeometryView> {
        self.query.geometry(id, owner, bbox)
    }

    /// See [`QueryFacade::heatmap`].
    ///
    /// # Errors
    /// `NotFound` for unknown or foreign ids.
    pub fn heatmap(
        &self,
        id: SimulationId,
        owner: &OwnerId,
        resolution: HeatmapResolution,
    ) -> HazardResult<HeatmapView> {
        self.query.heatmap(id, owner, resolution)
    }

    /// See [`QueryFacade::list`].
    ///
    /// # Errors
    /// `InvalidParameters` for an out-of-range page size.
    pub fn list(&self, owner: &OwnerId, query: &ListQuery) -> HazardResult<Page> {
        self.query.list(owner, query)
    }

    /// Polls until the simulation is terminal or `timeout` elapses.
    ///
    /// # Errors
    /// `NotFound` for unknown or foreign ids; `Internal` on timeout.
    pub fn wait_for_terminal(
        &self,
        id: SimulationId,
        owner: &OwnerId,
        timeout: Duration,
    ) -> HazardResult<StatusView> {
        let deadline = Instant::now() + timeout;
        loop {
            let view = self.query.status(id, owner)?;
            if view.status.is_terminal() {
                return Ok(view);
            }
            if Instant::now() >= deadline {
                return Err(HazardError::internal(format!(
                    "simulation {id} still {} after {timeout:?}",
                    view.status
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// The lifecycle controller.
    #[must_use]
    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    /// The query façade.
    #[must_use]
    pub const fn query(&self) -> &QueryFacade {
        &self.query
    }

    /// Items waiting in the work queue.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.dispatcher.pending()
    }

    /// Number of worker threads.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.pool.size()
    }

    /// Stops the requeuer and the worker pool and waits for in-flight
    /// items to finish.
    pub fn shutdown(self) {
        let Self { requeuer, pool, .. } = self;
        requeuer.stop();
        pool.shutdown();
        info!("hazardsim stopped");
    }
}
