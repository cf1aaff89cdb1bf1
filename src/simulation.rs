//! The simulation record and its lifecycle states.
//!
//! A simulation is one user-scoped request for a computed hazard prediction.
//! It is created `QUEUED`, driven forward by the execution worker, and ends
//! in exactly one terminal state (`COMPLETED` or `FAILED`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::geo::Geometry;
use crate::parameters::{ParameterHash, ScenarioKind, SimulationParameters, TimeHorizon};

/// Maximum accepted owner id length in bytes.
pub const MAX_OWNER_ID_LEN: usize = 128;

/// Dataset name to version identifier, as consumed by a computation.
pub type DatasetVersions = BTreeMap<String, String>;

/// Stable identifier for a simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimulationId(Uuid);

impl SimulationId {
    /// Creates a new random simulation ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SimulationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SimulationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SimulationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identity of the user owning a simulation.
///
/// Always supplied by the authentication layer, never taken from request
/// payload content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Creates a validated owner id.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidOwner` if the id is blank, too long,
    /// or contains control characters.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::InvalidOwner {
                reason: "owner id cannot be empty".to_string(),
            });
        }
        if id.len() > MAX_OWNER_ID_LEN {
            return Err(ValidationError::InvalidOwner {
                reason: format!("owner id exceeds {MAX_OWNER_ID_LEN} bytes"),
            });
        }
        if id.chars().any(char::is_control) {
            return Err(ValidationError::InvalidOwner {
                reason: "owner id contains control characters".to_string(),
            });
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a simulation.
///
/// ```text
/// QUEUED -> RUNNING -> POSTPROCESSING -> COMPLETED
///              |              |
///              +-> FAILED <---+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulationStatus {
    /// Stored and handed to the work queue.
    Queued,
    /// Claimed by a worker; computation in progress.
    Running,
    /// Computation done; result shaping in progress.
    Postprocessing,
    /// Terminal: result available.
    Completed,
    /// Terminal: failure reason available.
    Failed,
}

impl SimulationStatus {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Queued,
        Self::Running,
        Self::Postprocessing,
        Self::Completed,
        Self::Failed,
    ];

    /// Returns true for `COMPLETED` and `FAILED`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position in the lifecycle partial order. Both terminal states share
    /// the top rank.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Postprocessing => 2,
            Self::Completed | Self::Failed => 3,
        }
    }

    /// Returns true if `self -> next` is an edge of the lifecycle graph.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Postprocessing | Self::Failed)
                | (Self::Postprocessing, Self::Completed | Self::Failed)
        )
    }

    /// Coarse progress estimate exposed to pollers.
    #[must_use]
    pub const fn progress(self) -> Option<f32> {
        match self {
            Self::Running => Some(0.5),
            Self::Postprocessing => Some(0.9),
            Self::Completed => Some(1.0),
            Self::Queued | Self::Failed => None,
        }
    }

    /// Upper-case wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Postprocessing => "POSTPROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SimulationStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ValidationError::OutOfRange {
                field: "status".to_string(),
                reason: format!("unknown status '{s}'"),
            })
    }
}

/// Identifies the computation implementation behind a result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineStamp {
    /// Engine name.
    pub name: String,
    /// Engine version.
    pub version: String,
}

impl EngineStamp {
    /// Creates a stamp.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for EngineStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Risk classification derived from a risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Score below 0.3.
    Low,
    /// Score in `[0.3, 0.6)`.
    Moderate,
    /// Score in `[0.6, 0.85)`.
    High,
    /// Score at or above 0.85.
    Extreme,
}

impl RiskLevel {
    /// Classifies a score in `[0, 1]`.
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score < 0.3 {
            Self::Low
        } else if score < 0.6 {
            Self::Moderate
        } else if score < 0.85 {
            Self::High
        } else {
            Self::Extreme
        }
    }
}

/// Classification of an impact zone ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoneType {
    /// Direct deposition area closest to the source.
    Fallout,
    /// Area where the hazard is expected to be critical.
    CriticalRadius,
    /// Outer spread area.
    SecondarySpread,
}

/// Expected contaminant concentration range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToxicityRange {
    /// Lower bound in parts per million.
    pub min_ppm: f64,
    /// Upper bound in parts per million.
    pub max_ppm: f64,
}

/// A projected impact zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactZone {
    /// Zone classification.
    pub zone_type: ZoneType,
    /// GeoJSON polygon in EPSG:4326.
    pub geometry: Geometry,
    /// Approximate zone area.
    pub area_sq_km: f64,
    /// Expected concentration range, for toxicity hazards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toxicity_range_ppm: Option<ToxicityRange>,
}

/// Effect of one scenario on the baseline risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioImpact {
    /// Scenario kind.
    pub kind: ScenarioKind,
    /// Risk score after applying the scenario.
    pub risk_score: f64,
    /// Change relative to the baseline.
    pub risk_delta: f64,
}

/// Hazard-family specific part of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultSummary {
    /// Ground stability hazards (landslide, subsidence).
    Hazard {
        /// Prediction horizon.
        horizon: TimeHorizon,
        /// Start of the expected event window, hours from execution.
        expected_window_from_hours: u32,
        /// End of the expected event window, hours from execution.
        expected_window_to_hours: u32,
        /// Per-scenario adjustments.
        scenario_impacts: Vec<ScenarioImpact>,
    },
    /// Contamination hazards (flood, earthquake).
    Toxicity {
        /// Radius of the critical zone.
        critical_radius_km: f64,
        /// People living inside the critical zone.
        estimated_population: u64,
        /// Agricultural land inside the critical zone.
        affected_agri_land_acres: f64,
        /// Expected dominant contaminants.
        primary_toxins: Vec<String>,
        /// Expected health effects.
        health_risks: Vec<String>,
    },
}

/// Output of a completed simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    /// Risk score in `[0, 1]`.
    pub risk_score: f64,
    /// Classification of `risk_score`.
    pub risk_level: RiskLevel,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
    /// Hazard-specific detail.
    pub summary: ResultSummary,
    /// Projected impact zones; empty when the parameters carry no location.
    pub zones: Vec<ImpactZone>,
}

/// A persisted simulation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Simulation {
    /// Identity.
    pub id: SimulationId,
    /// Owner; never changes.
    pub owner_id: OwnerId,
    /// Current lifecycle state.
    pub status: SimulationStatus,
    /// Input captured at creation; never changes.
    pub parameters: SimulationParameters,
    /// Deterministic digest of `parameters`.
    pub parameter_hash: ParameterHash,
    /// Engine selected at creation, re-stamped at execution.
    pub engine: EngineStamp,
    /// Datasets consumed by the computation; empty before execution.
    #[serde(default)]
    pub dataset_versions: DatasetVersions,
    /// Present only when `COMPLETED`.
    #[serde(default)]
    pub result: Option<SimulationResult>,
    /// Present only when `FAILED`.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last status change.
    pub updated_at: DateTime<Utc>,
    /// Time a worker claimed the simulation.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Time a terminal state was reached.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Simulation {
    /// Creates a fresh `QUEUED` record.
    #[must_use]
    pub fn queued(
        owner_id: OwnerId,
        parameters: SimulationParameters,
        parameter_hash: ParameterHash,
        engine: EngineStamp,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SimulationId::new(),
            owner_id,
            status: SimulationStatus::Queued,
            parameters,
            parameter_hash,
            engine,
            dataset_versions: DatasetVersions::new(),
            result: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Returns true once the record can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if `owner` owns this record.
    #[must_use]
    pub fn is_owned_by(&self, owner: &OwnerId) -> bool {
        &self.owner_id == owner
    }
}
