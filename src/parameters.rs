//! Simulation input parameters and their reproducibility hash.
//!
//! Parameters are validated syntactically at creation and frozen on the
//! record. The hash is a pure function of the parameters, so two requests
//! with identical input always share a hash.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::geo::{Geometry, Position};

/// Maximum number of scenarios per simulation.
pub const MAX_SCENARIOS: usize = 16;

/// Maximum accepted unit string length.
pub const MAX_UNIT_LEN: usize = 32;

/// Upper bound for moment magnitudes.
const MAX_EARTHQUAKE_MAGNITUDE: f64 = 10.0;

const HASH_DOMAIN: &[u8] = b"hazardsim.parameters.v1\0";

static AREA_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.:\-]{1,64}$").expect("area id pattern is a valid regex")
});

/// Hazard families with a registered computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HazardType {
    /// Slope failure.
    Landslide,
    /// Ground subsidence.
    Subsidence,
    /// Flood-driven contamination spread.
    Flood,
    /// Earthquake-driven contamination release.
    Earthquake,
}

impl HazardType {
    /// All hazard types.
    pub const ALL: [Self; 4] = [Self::Landslide, Self::Subsidence, Self::Flood, Self::Earthquake];

    /// Lower-case wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Landslide => "landslide",
            Self::Subsidence => "subsidence",
            Self::Flood => "flood",
            Self::Earthquake => "earthquake",
        }
    }

    /// True for hazards modelled as contaminant release.
    #[must_use]
    pub const fn is_toxicity(self) -> bool {
        matches!(self, Self::Flood | Self::Earthquake)
    }
}

impl fmt::Display for HazardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HazardType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|h| h.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ValidationError::OutOfRange {
                field: "hazard".to_string(),
                reason: format!("unknown hazard '{s}'"),
            })
    }
}

/// Prediction horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimeHorizon {
    /// Six hours.
    #[serde(rename = "6h")]
    Hours6,
    /// One day.
    #[default]
    #[serde(rename = "24h")]
    Hours24,
    /// Three days.
    #[serde(rename = "72h")]
    Hours72,
    /// One week.
    #[serde(rename = "7d")]
    Days7,
}

impl TimeHorizon {
    /// Horizon length in hours.
    #[must_use]
    pub const fn hours(self) -> u32 {
        match self {
            Self::Hours6 => 6,
            Self::Hours24 => 24,
            Self::Hours72 => 72,
            Self::Days7 => 168,
        }
    }
}

/// What-if scenario family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    /// Additional rainfall.
    Rainfall,
    /// Soil saturation increase.
    SoilSaturation,
    /// Groundwater table rise.
    GroundwaterRise,
    /// Surface load increase.
    LoadIncrease,
}

/// A what-if adjustment applied on top of the baseline prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Scenario family.
    pub kind: ScenarioKind,
    /// Accumulated rainfall in millimetres.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_mm: Option<f64>,
    /// Groundwater rise in metres.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rise_meters: Option<f64>,
}

impl Scenario {
    /// Creates a scenario without quantities.
    #[must_use]
    pub const fn new(kind: ScenarioKind) -> Self {
        Self {
            kind,
            total_mm: None,
            rise_meters: None,
        }
    }
}

fn non_negative(field: &str, value: Option<f64>) -> Result<(), ValidationError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(ValidationError::OutOfRange {
            field: field.to_string(),
            reason: format!("must be a finite, non-negative number (got {v})"),
        }),
        _ => Ok(()),
    }
}

/// Structured simulation input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationParameters {
    /// Hazard family; selects the engine.
    pub hazard: HazardType,
    /// Area or site reference.
    pub area_id: String,
    /// Prediction horizon.
    #[serde(default)]
    pub horizon: TimeHorizon,
    /// Event magnitude (required for flood and earthquake).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnitude: Option<f64>,
    /// Unit of `magnitude`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Source location in EPSG:4326.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Position>,
    /// Area outline in EPSG:4326.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<Geometry>,
    /// What-if scenarios (stability hazards only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scenarios: Vec<Scenario>,
    /// Free-form metadata object.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl SimulationParameters {
    /// Creates minimal parameters for `hazard` over `area_id`.
    #[must_use]
    pub fn new(hazard: HazardType, area_id: impl Into<String>) -> Self {
        Self {
            hazard,
            area_id: area_id.into(),
            horizon: TimeHorizon::default(),
            magnitude: None,
            unit: None,
            location: None,
            area: None,
            scenarios: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Sets magnitude and unit.
    #[must_use]
    pub fn with_magnitude(mut self, magnitude: f64, unit: impl Into<String>) -> Self {
        self.magnitude = Some(magnitude);
        self.unit = Some(unit.into());
        self
    }

    /// Sets the source location.
    #[must_use]
    pub const fn with_location(mut self, location: Position) -> Self {
        self.location = Some(location);
        self
    }

    /// Sets the horizon.
    #[must_use]
    pub const fn with_horizon(mut self, horizon: TimeHorizon) -> Self {
        self.horizon = horizon;
        self
    }

    /// Appends a scenario.
    #[must_use]
    pub fn with_scenario(mut self, scenario: Scenario) -> Self {
        self.scenarios.push(scenario);
        self
    }

    /// Parses and validates an untyped request body.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if the value does not have the expected
    /// shape or fails `validate`.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ValidationError> {
        let params: Self = serde_json::from_value(value)
            .map_err(|e| ValidationError::parameters(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// Syntactic validation. No scientific plausibility checks.
    ///
    /// # Errors
    ///
    /// Returns the first structural defect found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.area_id.is_empty() {
            return Err(ValidationError::MissingField {
                field: "area_id".to_string(),
            });
        }
        if !AREA_ID.is_match(&self.area_id) {
            return Err(ValidationError::parameters(format!(
                "area_id '{}' must be 1-64 characters of [A-Za-z0-9_.:-]",
                self.area_id
            )));
        }

        if let Some(unit) = &self.unit {
            if unit.len() > MAX_UNIT_LEN {
                return Err(ValidationError::FieldTooLong {
                    field: "unit".to_string(),
                    max_length: MAX_UNIT_LEN,
                });
            }
        }

        if self.hazard.is_toxicity() {
            self.validate_magnitude()?;
            if !self.scenarios.is_empty() {
                return Err(ValidationError::parameters(format!(
                    "scenarios are not supported for {} simulations",
                    self.hazard
                )));
            }
        } else {
            non_negative("magnitude", self.magnitude)?;
        }

        if let Some(location) = &self.location {
            location.validate()?;
        }
        if let Some(area) = &self.area {
            if matches!(area, Geometry::Point { .. }) {
                return Err(ValidationError::InvalidGeometry {
                    reason: "area must be a Polygon or MultiPolygon".to_string(),
                });
            }
            area.validate()?;
        }

        if self.scenarios.len() > MAX_SCENARIOS {
            return Err(ValidationError::OutOfRange {
                field: "scenarios".to_string(),
                reason: format!("at most {MAX_SCENARIOS} scenarios are allowed"),
            });
        }
        for scenario in &self.scenarios {
            non_negative("scenarios.total_mm", scenario.total_mm)?;
            non_negative("scenarios.rise_meters", scenario.rise_meters)?;
        }

        if !(self.metadata.is_null() || self.metadata.is_object()) {
            return Err(ValidationError::parameters("metadata must be an object"));
        }

        Ok(())
    }

    fn validate_magnitude(&self) -> Result<(), ValidationError> {
        let magnitude = self.magnitude.ok_or_else(|| ValidationError::MissingField {
            field: "magnitude".to_string(),
        })?;
        if !magnitude.is_finite() || magnitude <= 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "magnitude".to_string(),
                reason: format!("must be a finite, positive number (got {magnitude})"),
            });
        }
        if self.unit.is_none() {
            return Err(ValidationError::MissingField {
                field: "unit".to_string(),
            });
        }
        if self.canonical_magnitude().is_none() {
            return Err(ValidationError::parameters(format!(
                "unit '{}' is not valid for {} magnitude",
                self.unit.as_deref().unwrap_or_default(),
                self.hazard
            )));
        }
        if self.hazard == HazardType::Earthquake && magnitude > MAX_EARTHQUAKE_MAGNITUDE {
            return Err(ValidationError::OutOfRange {
                field: "magnitude".to_string(),
                reason: format!("earthquake magnitude must not exceed {MAX_EARTHQUAKE_MAGNITUDE}"),
            });
        }
        Ok(())
    }

    /// Magnitude normalized to the hazard's canonical unit (metres of water
    /// for floods, moment magnitude for earthquakes). `None` when absent or
    /// the unit does not fit the hazard.
    #[must_use]
    pub fn canonical_magnitude(&self) -> Option<f64> {
        let magnitude = self.magnitude?;
        let unit = self.unit.as_deref()?.trim().to_ascii_lowercase();
        match (self.hazard, unit.as_str()) {
            (HazardType::Flood, "m" | "meter" | "meters" | "metre" | "metres") => Some(magnitude),
            (HazardType::Flood, "ft" | "foot" | "feet") => Some(magnitude * 0.3048),
            (HazardType::Earthquake, "mw" | "richter" | "ml") => Some(magnitude),
            _ => None,
        }
    }

    /// Point that zone rings are projected around: the explicit location,
    /// else the area centroid.
    #[must_use]
    pub fn anchor(&self) -> Option<Position> {
        self.location.or_else(|| self.area.as_ref().and_then(Geometry::centroid))
    }

    /// Numeric metadata lookup.
    #[must_use]
    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(serde_json::Value::as_f64)
    }

    /// Computes the reproducibility hash.
    ///
    /// The encoding is canonical JSON (object keys sorted at every level) so
    /// the hash does not depend on serde_json's map ordering features.
    #[must_use]
    pub fn parameter_hash(&self) -> ParameterHash {
        let value = serde_json::to_value(self).map_or(serde_json::Value::Null, canonicalize);
        let encoded = serde_json::to_vec(&value).unwrap_or_default();

        let mut hasher = blake3::Hasher::new();
        hasher.update(HASH_DOMAIN);
        hasher.update(&encoded);
        ParameterHash(hasher.finalize().to_hex().to_string())
    }
}

fn canonicalize(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, canonicalize(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Hex BLAKE3 digest of canonical parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterHash(String);

impl ParameterHash {
    /// Returns the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic 64-bit seed derived from the digest.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.0
            .get(..16)
            .and_then(|prefix| u64::from_str_radix(prefix, 16).ok())
            .unwrap_or(0)
    }
}

impl fmt::Display for ParameterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_landslide_request() {
        let params = SimulationParameters::from_json(json!({
            "hazard": "landslide",
            "area_id": "A1"
        }))
        .unwrap();
        assert_eq!(params.hazard, HazardType::Landslide);
        assert_eq!(params.horizon, TimeHorizon::Hours24);
        assert!(params.scenarios.is_empty());
    }

    #[test]
    fn rejects_unknown_fields_and_hazards() {
        let err = SimulationParameters::from_json(json!({
            "hazard": "landslide",
            "area_id": "A1",
            "owner_id": "someone-else"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("owner_id"));

        let unknown = json!({"hazard": "tsunami", "area_id": "A1"});
        assert!(SimulationParameters::from_json(unknown).is_err());
        assert!(SimulationParameters::from_json(json!({"area_id": "A1"})).is_err());
    }

    #[test]
    fn rejects_malformed_area_id() {
        let params = SimulationParameters::new(HazardType::Landslide, "");
        assert!(matches!(params.validate(), Err(ValidationError::MissingField { .. })));

        let params = SimulationParameters::new(HazardType::Landslide, "has spaces");
        assert!(params.validate().is_err());

        let params = SimulationParameters::new(HazardType::Landslide, "x".repeat(65));
        assert!(params.validate().is_err());
    }

    #[test]
    fn toxicity_requires_magnitude_and_compatible_unit() {
        let site = |hazard| SimulationParameters::new(hazard, "SITE_001");
        assert!(matches!(
            site(HazardType::Flood).validate(),
            Err(ValidationError::MissingField { .. })
        ));

        let params = site(HazardType::Flood).with_magnitude(7.5, "meters");
        params.validate().unwrap();
        assert_eq!(params.canonical_magnitude(), Some(7.5));

        let params = site(HazardType::Flood).with_magnitude(10.0, "feet");
        assert!((params.canonical_magnitude().unwrap() - 3.048).abs() < 1e-9);

        let params = site(HazardType::Flood).with_magnitude(7.5, "richter");
        assert!(params.validate().is_err());

        let params = site(HazardType::Earthquake).with_magnitude(11.0, "mw");
        assert!(params.validate().is_err());

        let params = site(HazardType::Earthquake).with_magnitude(-1.0, "mw");
        assert!(params.validate().is_err());
    }

    #[test]
    fn scenarios_are_bounded_and_checked() {
        let mut params = SimulationParameters::new(HazardType::Landslide, "A1");
        for _ in 0..=MAX_SCENARIOS {
            params.scenarios.push(Scenario::new(ScenarioKind::Rainfall));
        }
        assert!(params.validate().is_err());

        let params = SimulationParameters::new(HazardType::Landslide, "A1").with_scenario(Scenario {
            kind: ScenarioKind::Rainfall,
            total_mm: Some(f64::NAN),
            rise_meters: None,
        });
        assert!(params.validate().is_err());

        let params = SimulationParameters::new(HazardType::Flood, "S1")
            .with_magnitude(2.0, "m")
            .with_scenario(Scenario::new(ScenarioKind::Rainfall));
        assert!(params.validate().is_err());
    }

    #[test]
    fn metadata_must_be_object() {
        let err = SimulationParameters::from_json(json!({
            "hazard": "landslide",
            "area_id": "A1",
            "metadata": [1, 2, 3]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("metadata"));
    }

    #[test]
    fn area_must_be_polygonal() {
        let err = SimulationParameters::from_json(json!({
            "hazard": "subsidence",
            "area_id": "A1",
            "area": {"type": "Point", "coordinates": [75.0, 26.0]}
        }))
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidGeometry { .. }));
    }

    #[test]
    fn parameter_hash_is_deterministic() {
        let a = SimulationParameters::from_json(json!({
            "hazard": "landslide",
            "area_id": "A1",
            "metadata": {"b": 1, "a": {"y": 2, "x": 3}}
        }))
        .unwrap();
        let b = SimulationParameters::from_json(json!({
            "metadata": {"a": {"x": 3, "y": 2}, "b": 1},
            "area_id": "A1",
            "hazard": "landslide"
        }))
        .unwrap();
        assert_eq!(a.parameter_hash(), b.parameter_hash());
        assert_eq!(a.parameter_hash().as_str().len(), 64);

        let c = SimulationParameters::new(HazardType::Landslide, "A2");
        assert_ne!(a.parameter_hash(), c.parameter_hash());
    }

    #[test]
    fn seed_comes_from_hash_prefix() {
        let params = SimulationParameters::new(HazardType::Landslide, "A1");
        let hash = params.parameter_hash();
        assert_eq!(hash.seed(), params.parameter_hash().seed());
        assert_eq!(hash.seed(), u64::from_str_radix(&hash.as_str()[..16], 16).unwrap());
    }

    #[test]
    fn anchor_prefers_location_over_area() {
        let location = Position::new(75.8, 26.9).unwrap();
        let params = SimulationParameters::new(HazardType::Landslide, "A1").with_location(location);
        assert_eq!(params.anchor(), Some(location));

        let params = SimulationParameters::from_json(json!({
            "hazard": "landslide",
            "area_id": "A1",
            "area": {
                "type": "Polygon",
                "coordinates": [[[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0], [0.0, 0.0]]]
            }
        }))
        .unwrap();
        let anchor = params.anchor().unwrap();
        assert!((anchor.lon - 1.0).abs() < 1e-9 && (anchor.lat - 1.0).abs() < 1e-9);
    }
}
