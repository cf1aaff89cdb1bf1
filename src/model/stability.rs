//! Ground stability model for landslide and subsidence.
//!
//! Deterministic: every quantity is derived from the parameter hash, so the
//! same parameters always produce the same result.

use crate::parameters::{HazardType, Scenario, ScenarioKind, TimeHorizon};
use crate::simulation::{DatasetVersions, ResultSummary, ScenarioImpact, ZoneType};

use super::{round2, unit_from_seed, ComputeInput, HazardModel, ModelError, ModelOutput, ZoneSpec};

const NAME: &str = "stability";
const VERSION: &str = "1.2.0";

/// Scenario risk multiplier before quantity adjustments.
const fn scenario_multiplier(kind: ScenarioKind) -> f64 {
    match kind {
        ScenarioKind::Rainfall => 1.3,
        ScenarioKind::SoilSaturation => 1.2,
        ScenarioKind::GroundwaterRise => 1.25,
        ScenarioKind::LoadIncrease => 1.15,
    }
}

const fn horizon_factor(horizon: TimeHorizon) -> f64 {
    match horizon {
        TimeHorizon::Hours6 => 0.8,
        TimeHorizon::Hours24 => 1.0,
        TimeHorizon::Hours72 => 1.1,
        TimeHorizon::Days7 => 1.2,
    }
}

/// Applies one scenario to a baseline risk.
pub(crate) fn apply_scenario(baseline: f64, scenario: &Scenario) -> ScenarioImpact {
    let mut multiplier = scenario_multiplier(scenario.kind);
    if scenario.total_mm.is_some_and(|mm| mm > 200.0) {
        multiplier += 0.1;
    }
    if scenario.rise_meters.is_some_and(|m| m > 1.0) {
        multiplier += 0.15;
    }

    let risk_score = round2((baseline * multiplier).min(1.0));
    ScenarioImpact {
        kind: scenario.kind,
        risk_score,
        risk_delta: round2(risk_score - baseline),
    }
}

/// Landslide / subsidence risk model.
#[derive(Debug, Default, Clone, Copy)]
pub struct StabilityModel;

impl StabilityModel {
    /// Creates the model.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn datasets(hazard: HazardType) -> DatasetVersions {
        let mut versions = DatasetVersions::new();
        versions.insert("DEM".to_string(), "SRTM-2024.1".to_string());
        match hazard {
            HazardType::Subsidence => {
                versions.insert("INSAR".to_string(), "SENTINEL1-2024-03".to_string());
            }
            _ => {
                versions.insert("RAINFALL".to_string(), "IMD-2024-06".to_string());
            }
        }
        versions
    }
}

impl HazardModel for StabilityModel {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn compute(&self, input: &ComputeInput<'_>) -> Result<ModelOutput, ModelError> {
        let params = input.parameters;
        if !matches!(params.hazard, HazardType::Landslide | HazardType::Subsidence) {
            return Err(ModelError::UnsupportedInput {
                model: NAME.to_string(),
                reason: format!("hazard '{}' is not a ground stability hazard", params.hazard),
            });
        }

        let seed = input.parameter_hash.seed();
        // Subsidence develops more slowly than slope failure.
        let hazard_factor = if params.hazard == HazardType::Subsidence { 0.85 } else { 1.0 };
        let base = 0.3 + 0.5 * unit_from_seed(seed, "risk");
        let risk_score = round2((base * horizon_factor(params.horizon) * hazard_factor).min(1.0));
        let confidence = round2(0.8 + 0.15 * unit_from_seed(seed, "confidence"));

        let scenario_impacts = params
            .scenarios
            .iter()
            .map(|s| apply_scenario(risk_score, s))
            .collect();

        let hours = params.horizon.hours();
        let critical_km = round2(0.5 + 2.5 * risk_score);

        Ok(ModelOutput {
            risk_score,
            confidence,
            summary: ResultSummary::Hazard {
                horizon: params.horizon,
                expected_window_from_hours: hours / 2,
                expected_window_to_hours: hours,
                scenario_impacts,
            },
            zones: vec![
                ZoneSpec {
                    zone_type: ZoneType::CriticalRadius,
                    radius_km: critical_km,
                    toxicity_ppm: None,
                },
                ZoneSpec {
                    zone_type: ZoneType::SecondarySpread,
                    radius_km: round2(critical_km * 2.0),
                    toxicity_ppm: None,
                },
            ],
            dataset_versions: Self::datasets(params.hazard),
        })
    }
}
