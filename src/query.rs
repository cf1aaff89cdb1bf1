//! Read-only, owner-scoped projections of simulation records.
//!
//! Polling callers get typed answers for every lifecycle state: a
//! simulation that is still running or has failed is a normal read, not an
//! error. Only unknown ids and foreign records produce `NotFound`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{HazardError, HazardResult, ValidationError};
use crate::geo::{distance_km, BoundingBox, Geometry, CRS_EPSG_4326};
use crate::lifecycle::LifecycleController;
use crate::parameters::{HazardType, ParameterHash};
use crate::simulation::{
    DatasetVersions, EngineStamp, ImpactZone, OwnerId, RiskLevel, Simulation, SimulationId,
    SimulationResult, SimulationStatus,
};

/// Default page size.
pub const DEFAULT_PAGE_LIMIT: usize = 10;
/// Largest accepted page size.
pub const MAX_PAGE_LIMIT: usize = 100;

/// Status answer for pollers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    /// Simulation id.
    pub simulation_id: SimulationId,
    /// Current status.
    pub status: SimulationStatus,
    /// Coarse progress in `[0, 1]`, when meaningful.
    pub progress: Option<f32>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// Claim time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason, when `FAILED`.
    pub failure_reason: Option<String>,
}

impl From<&Simulation> for StatusView {
    fn from(s: &Simulation) -> Self {
        Self {
            simulation_id: s.id,
            status: s.status,
            progress: s.status.progress(),
            created_at: s.created_at,
            updated_at: s.updated_at,
            started_at: s.started_at,
            completed_at: s.completed_at,
            failure_reason: s.failure_reason.clone(),
        }
    }
}

/// Result answer; distinguishes ready, still running and failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResultView {
    /// Computation finished.
    Ready {
        /// The result.
        result: SimulationResult,
        /// Engine that produced it.
        engine: EngineStamp,
        /// Datasets it consumed.
        dataset_versions: DatasetVersions,
        /// Digest of the input, for reproducibility.
        parameter_hash: ParameterHash,
    },
    /// Not finished yet.
    Processing {
        /// Current status.
        status: SimulationStatus,
        /// Coarse progress.
        progress: Option<f32>,
    },
    /// Computation failed.
    Failed {
        /// Safe failure reason.
        reason: String,
    },
}

impl ResultView {
    /// Returns true for `Ready`.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Impact zones of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeometryView {
    /// Simulation id.
    pub simulation_id: SimulationId,
    /// Current status; zones are empty unless `COMPLETED`.
    pub status: SimulationStatus,
    /// Zones, filtered to the requested bounding box.
    pub zones: Vec<ImpactZone>,
}

impl GeometryView {
    /// Renders the zones as a GeoJSON `FeatureCollection` in EPSG:4326.
    #[must_use]
    pub fn to_feature_collection(&self) -> Value {
        let features: Vec<Value> = self
            .zones
            .iter()
            .map(|zone| {
                json!({
                    "type": "Feature",
                    "geometry": zone.geometry,
                    "properties": {
                        "simulation_id": self.simulation_id,
                        "zone_type": zone.zone_type,
                        "area_sq_km": zone.area_sq_km,
                        "toxicity_range_ppm": zone.toxicity_range_ppm,
                    },
                })
            })
            .collect();

        json!({
            "type": "FeatureCollection",
            "crs": {"type": "name", "properties": {"name": CRS_EPSG_4326}},
            "features": features,
        })
    }
}

/// Grid density of a heatmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeatmapResolution {
    /// 2 x 2 cells.
    Low,
    /// 4 x 4 cells.
    #[default]
    Medium,
    /// 8 x 8 cells.
    High,
}

impl HeatmapResolution {
    /// Cells along each axis.
    #[must_use]
    pub const fn grid_size(self) -> usize {
        match self {
            Self::Low => 2,
            Self::Medium => 4,
            Self::High => 8,
        }
    }
}

/// One square of a heatmap.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapCell {
    /// Cell outline.
    pub geometry: Geometry,
    /// Risk at the cell center, in `[0, 1]`.
    pub risk_score: f64,
    /// Classification of `risk_score`.
    pub risk_level: RiskLevel,
}

/// Risk grid over the impact area of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapView {
    /// Simulation id.
    pub simulation_id: SimulationId,
    /// Current status; cells are empty unless `COMPLETED`.
    pub status: SimulationStatus,
    /// Grid density used.
    pub resolution: HeatmapResolution,
    /// Cells, west to east then south to north.
    pub cells: Vec<HeatmapCell>,
}

impl HeatmapView {
    /// Renders the cells as a GeoJSON `FeatureCollection` in EPSG:4326.
    #[must_use]
    pub fn to_feature_collection(&self) -> Value {
        let features: Vec<Value> = self
            .cells
            .iter()
            .map(|cell| {
                json!({
                    "type": "Feature",
                    "geometry": cell.geometry,
                    "properties": {
                        "risk_score": cell.risk_score,
                        "risk_level": cell.risk_level,
                    },
                })
            })
            .collect();

        json!({
            "type": "FeatureCollection",
            "crs": {"type": "name", "properties": {"name": CRS_EPSG_4326}},
            "features": features,
        })
    }
}

/// Grids the box covering all zones. Risk falls off linearly from the
/// anchor's score to zero at the outermost zone radius.
fn heatmap_cells(record: &Simulation, resolution: HeatmapResolution) -> Vec<HeatmapCell> {
    let (Some(result), Some(anchor)) = (record.result.as_ref(), record.parameters.anchor()) else {
        return Vec::new();
    };
    let Some(extent) = result
        .zones
        .iter()
        .filter_map(|z| z.geometry.bbox())
        .reduce(|acc, b| acc.union(&b))
    else {
        return Vec::new();
    };
    let reach_km = result
        .zones
        .iter()
        .map(|z| (z.area_sq_km / std::f64::consts::PI).sqrt())
        .fold(0.0_f64, f64::max);
    if reach_km <= 0.0 {
        return Vec::new();
    }

    extent
        .grid(resolution.grid_size())
        .into_iter()
        .map(|cell| {
            let falloff = (1.0 - distance_km(anchor, cell.center()) / reach_km).max(0.0);
            let risk_score = crate::model::round2(result.risk_score * falloff);
            HeatmapCell {
                geometry: cell.to_polygon(),
                risk_score,
                risk_level: RiskLevel::from_score(risk_score),
            }
        })
        .collect()
}

/// Filters and paging for `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    /// Only this status.
    pub status: Option<SimulationStatus>,
    /// Only this hazard.
    pub hazard: Option<HazardType>,
    /// Only this area.
    pub area_id: Option<String>,
    /// Page size, `1..=MAX_PAGE_LIMIT`.
    pub limit: usize,
    /// Records to skip.
    pub offset: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            status: None,
            hazard: None,
            area_id: None,
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl ListQuery {
    /// Validates paging bounds.
    ///
    /// # Errors
    /// Returns `OutOfRange` if `limit` is outside `1..=MAX_PAGE_LIMIT`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(1..=MAX_PAGE_LIMIT).contains(&self.limit) {
            return Err(ValidationError::OutOfRange {
                field: "limit".to_string(),
                reason: format!("must be between 1 and {MAX_PAGE_LIMIT} (got {})", self.limit),
            });
        }
        Ok(())
    }

    fn matches(&self, s: &Simulation) -> bool {
        self.status.map_or(true, |st| s.status == st)
            && self.hazard.map_or(true, |h| s.parameters.hazard == h)
            && self
                .area_id
                .as_deref()
                .map_or(true, |a| s.parameters.area_id == a)
    }
}

/// One row of a listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationSummary {
    /// Simulation id.
    pub simulation_id: SimulationId,
    /// Hazard type.
    pub hazard: HazardType,
    /// Area identifier.
    pub area_id: String,
    /// Current status.
    pub status: SimulationStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl From<&Simulation> for SimulationSummary {
    fn from(s: &Simulation) -> Self {
        Self {
            simulation_id: s.id,
            hazard: s.parameters.hazard,
            area_id: s.parameters.area_id.clone(),
            status: s.status,
            created_at: s.created_at,
        }
    }
}

/// A page of listing results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    /// Matches before paging.
    pub total: usize,
    /// Requested page size.
    pub limit: usize,
    /// Requested offset.
    pub offset: usize,
    /// Rows, most recent first.
    pub items: Vec<SimulationSummary>,
}

/// Owner-scoped read API.
#[derive(Debug, Clone)]
pub struct QueryFacade {
    controller: Arc<LifecycleController>,
}

impl QueryFacade {
    /// Creates a façade over `controller`.
    #[must_use]
    pub const fn new(controller: Arc<LifecycleController>) -> Self {
        Self { controller }
    }

    /// Current status of a simulation.
    ///
    /// # Errors
    /// `NotFound` for unknown or foreign ids.
    pub fn status(&self, id: SimulationId, owner: &OwnerId) -> HazardResult<StatusView> {
        let record = self.controller.get_for_owner(id, owner)?;
        Ok(StatusView::from(&record))
    }

    /// Result, or a marker saying why there is none yet.
    ///
    /// # Errors
    /// `NotFound` for unknown or foreign ids; `Internal` if a completed
    /// record has no result.
    pub fn result(&self, id: SimulationId, owner: &OwnerId) -> HazardResult<ResultView> {
        let record = self.controller.get_for_owner(id, owner)?;
        match record.status {
            SimulationStatus::Completed => {
                let result = record.result.ok_or_else(|| {
                    HazardError::internal(format!("completed simulation {id} has no result"))
                })?;
                Ok(ResultView::Ready {
                    result,
                    engine: record.engine,
                    dataset_versions: record.dataset_versions,
                    parameter_hash: record.parameter_hash,
                })
            }
            SimulationStatus::Failed => Ok(ResultView::Failed {
                reason: record
                    .failure_reason
                    .unwrap_or_else(|| "simulation failed".to_string()),
            }),
            status => Ok(ResultView::Processing {
                status,
                progress: status.progress(),
            }),
        }
    }

    /// Impact zones, optionally limited to those intersecting `bbox`.
    ///
    /// # Errors
    /// `NotFound` for unknown or foreign ids.
    pub fn geometry(
        &self,
        id: SimulationId,
        owner: &OwnerId,
        bbox: Option<&BoundingBox>,
    ) -> HazardResult<GeometryView> {
        let record = self.controller.get_for_owner(id, owner)?;
        let zones = record
            .result
            .map(|r| r.zones)
            .unwrap_or_default()
            .into_iter()
            .filter(|z| bbox.map_or(true, |b| z.geometry.intersects_bbox(b)))
            .collect();

        Ok(GeometryView {
            simulation_id: record.id,
            status: record.status,
            zones,
        })
    }

    /// Risk grid over the simulation's impact zones.
    ///
    /// # Errors
    /// `NotFound` for unknown or foreign ids.
    pub fn heatmap(
        &self,
        id: SimulationId,
        owner: &OwnerId,
        resolution: HeatmapResolution,
    ) -> HazardResult<HeatmapView> {
        let record = self.controller.get_for_owner(id, owner)?;
        let cells = if record.status == SimulationStatus::Completed {
            heatmap_cells(&record, resolution)
        } else {
            Vec::new()
        };

        Ok(HeatmapView {
            simulation_id: record.id,
            status: record.status,
            resolution,
            cells,
        })
    }

    /// Filtered, paged listing of the owner's simulations.
    ///
    /// # Errors
    /// `InvalidParameters` for an out-of-range `limit`.
    pub fn list(&self, owner: &OwnerId, query: &ListQuery) -> HazardResult<Page> {
        query.validate()?;
        let matching: Vec<Simulation> = self
            .controller
            .list_for_owner(owner)?
            .into_iter()
            .filter(|s| query.matches(s))
            .collect();

        Ok(Page {
            total: matching.len(),
            limit: query.limit,
            offset: query.offset,
            items: matching
                .iter()
                .skip(query.offset)
                .take(query.limit)
                .map(SimulationSummary::from)
                .collect(),
        })
    }
}
