//! Contamination model for floods and earthquakes.
//!
//! The critical radius grows linearly with event magnitude; everything
//! else (risk, exposed population, farmland, zone rings) follows from it.

use std::f64::consts::PI;

use crate::parameters::HazardType;
use crate::simulation::{DatasetVersions, ResultSummary, ToxicityRange, ZoneType};

use super::{round2, unit_from_seed, ComputeInput, HazardModel, ModelError, ModelOutput, ZoneSpec};

const NAME: &str = "toxicity";
const VERSION: &str = "1.0.3";

/// Radius cap for the critical zone.
pub const MAX_CRITICAL_RADIUS_KM: f64 = 100.0;
/// Population density used when the request does not provide one.
pub const DEFAULT_POPULATION_DENSITY: f64 = 400.0;
/// Share of land under cultivation used when the request does not provide one.
pub const DEFAULT_AGRI_FRACTION: f64 = 0.35;

const ACRES_PER_SQ_KM: f64 = 247.105;

/// Flood / earthquake contamination model.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToxicityModel;

fn critical_radius_km(hazard: HazardType, magnitude: f64) -> f64 {
    let per_unit = match hazard {
        HazardType::Earthquake => 0.8,
        _ => 0.5,
    };
    round2((magnitude * per_unit).min(MAX_CRITICAL_RADIUS_KM))
}

fn metadata_fraction(input: &ComputeInput<'_>, key: &str, default: f64) -> Result<f64, ModelError> {
    match input.parameters.metadata_f64(key) {
        None => Ok(default),
        Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
        Some(v) => Err(ModelError::UnsupportedInput {
            model: NAME.to_string(),
            reason: format!("metadata.{key} must be a non-negative number (got {v})"),
        }),
    }
}

fn profile(hazard: HazardType) -> (Vec<String>, Vec<String>) {
    let (toxins, risks): (&[&str], &[&str]) = match hazard {
        HazardType::Earthquake => (
            &["Asbestos", "Silica dust", "Ammonia", "Hydrocarbons"],
            &["Respiratory distress", "Chemical burns", "Long-term lung disease"],
        ),
        _ => (
            &["E. coli", "Lead", "Arsenic", "Nitrates"],
            &["Waterborne infections", "Heavy-metal poisoning", "Skin irritation"],
        ),
    };
    (
        toxins.iter().map(ToString::to_string).collect(),
        risks.iter().map(ToString::to_string).collect(),
    )
}

impl ToxicityModel {
    /// Creates the model.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn datasets(hazard: HazardType) -> DatasetVersions {
        let mut versions = DatasetVersions::new();
        versions.insert("CPCB".to_string(), "2024-01".to_string());
        versions.insert("CENSUS".to_string(), "2011-R".to_string());
        match hazard {
            HazardType::Earthquake => {
                versions.insert("USGS-SHAKEMAP".to_string(), "2024-02".to_string());
            }
            _ => {
                versions.insert("CWC-FLOOD".to_string(), "2023-11".to_string());
            }
        }
        versions
    }
}

impl HazardModel for ToxicityModel {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn compute(&self, input: &ComputeInput<'_>) -> Result<ModelOutput, ModelError> {
        let params = input.parameters;
        if !params.hazard.is_toxicity() {
            return Err(ModelError::UnsupportedInput {
                model: NAME.to_string(),
                reason: format!("hazard '{}' has no contamination profile", params.hazard),
            });
        }
        let magnitude = params.canonical_magnitude().ok_or_else(|| ModelError::UnsupportedInput {
            model: NAME.to_string(),
            reason: "magnitude with a compatible unit is required".to_string(),
        })?;

        let density = metadata_fraction(input, "population_density", DEFAULT_POPULATION_DENSITY)?;
        let agri_fraction =
            metadata_fraction(input, "agri_fraction", DEFAULT_AGRI_FRACTION)?.min(1.0);

        let radius = critical_radius_km(params.hazard, magnitude);
        let risk_score = round2(1.0 - (-radius / 5.0).exp());
        let area_sq_km = PI * radius * radius;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let estimated_population = (area_sq_km * density).round() as u64;
        let affected_agri_land_acres = round2(area_sq_km * agri_fraction * ACRES_PER_SQ_KM);

        let seed = input.parameter_hash.seed();
        let confidence = round2(0.75 + 0.15 * unit_from_seed(seed, "confidence"));

        // Peak concentration scales with magnitude; outer rings dilute it.
        let peak_ppm = round2(20.0 * magnitude.max(1.0));
        let (primary_toxins, health_risks) = profile(params.hazard);

        Ok(ModelOutput {
            risk_score,
            confidence,
            summary: ResultSummary::Toxicity {
                critical_radius_km: radius,
                estimated_population,
                affected_agri_land_acres,
                primary_toxins,
                health_risks,
            },
            zones: vec![
                ZoneSpec {
                    zone_type: ZoneType::Fallout,
                    radius_km: round2(radius * 0.4),
                    toxicity_ppm: Some(ToxicityRange {
                        min_ppm: round2(peak_ppm * 0.5),
                        max_ppm: peak_ppm,
                    }),
                },
                ZoneSpec {
                    zone_type: ZoneType::CriticalRadius,
                    radius_km: radius,
                    toxicity_ppm: Some(ToxicityRange {
                        min_ppm: round2(peak_ppm * 0.1),
                        max_ppm: round2(peak_ppm * 0.5),
                    }),
                },
                ZoneSpec {
                    zone_type: ZoneType::SecondarySpread,
                    radius_km: round2(radius * 1.8),
                    toxicity_ppm: Some(ToxicityRange {
                        min_ppm: round2(peak_ppm * 0.01),
                        max_ppm: round2(peak_ppm * 0.1),
                    }),
                },
            ],
            dataset_versions: Self::datasets(params.hazard),
        })
    }
}
