//! # hazardsim - asynchronous, user-scoped hazard simulation
//!
//! A caller submits hazard parameters; hazardsim stores a `QUEUED` record
//! and returns immediately. A worker pool drives the record through
//! `RUNNING` and `POSTPROCESSING` to `COMPLETED` or `FAILED`, and callers
//! poll for status, results and impact-zone geometry.
//!
//! ## Core Concepts
//!
//! - **Simulation**: an owner-scoped record with a monotonic status
//! - **Transition**: a compare-and-swap on status; the only way a record moves
//! - **HazardModel**: a computation registered per hazard type
//! - **Impact zone**: a GeoJSON ring around the hazard location
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use hazardsim::{HazardSim, HazardSimConfig, HazardType, OwnerId, SimulationParameters};
//!
//! let sim = HazardSim::in_memory(HazardSimConfig::default())?;
//! let owner = OwnerId::new("user-42")?;
//!
//! let record = sim.create(&owner, SimulationParameters::new(HazardType::Landslide, "A1"))?;
//! let status = sim.wait_for_terminal(record.id, &owner, Duration::from_secs(5))?;
//! let result = sim.result(record.id, &owner)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod geo;
pub mod parameters;
pub mod simulation;

// Storage and execution
pub mod dispatch;
pub mod lifecycle;
pub mod model;
pub mod storage;
pub mod worker;

// Read side and wiring
pub mod config;
pub mod query;
pub mod requeue;
pub mod service;

pub use config::HazardSimConfig;
pub use dispatch::{work_channel, ChannelDispatcher, WorkDispatcher, WorkItem};
pub use error::{ExecutionError, HazardError, HazardResult, ValidationError};
pub use geo::{BoundingBox, Geometry, Position};
pub use lifecycle::{LifecycleController, TransitionPayload};
pub use model::{ComputeInput, HazardModel, ModelError, ModelOutput, ModelRegistry, ZoneSpec};
pub use parameters::{
    HazardType, ParameterHash, Scenario, ScenarioKind, SimulationParameters, TimeHorizon,
};
pub use query::{
    GeometryView, HeatmapCell, HeatmapResolution, HeatmapView, ListQuery, Page, QueryFacade,
    ResultView, SimulationSummary, StatusView,
};
pub use requeue::Requeuer;
pub use service::HazardSim;
pub use simulation::{
    EngineStamp, ImpactZone, OwnerId, RiskLevel, Simulation, SimulationId, SimulationResult,
    SimulationStatus, ZoneType,
};
pub use storage::{
    CasOutcome, InMemorySimulationStore, SimulationStore, StatusUpdate, StorageError,
};
pub use worker::{ExecutionWorker, WorkOutcome, WorkerPool, WorkerPoolConfig};
