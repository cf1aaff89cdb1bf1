//! Hazard computation models.
//!
//! Every hazard family is served by a [`HazardModel`] behind one capability
//! interface. The [`ModelRegistry`] maps a [`HazardType`] to the model that
//! computes it; the lifecycle controller stamps the engine at creation and
//! the worker resolves it again at execution.

mod stability;
mod toxicity;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::error::ValidationError;
use crate::parameters::{HazardType, ParameterHash, SimulationParameters};
use crate::simulation::{
    DatasetVersions, EngineStamp, ResultSummary, SimulationId, ToxicityRange, ZoneType,
};

pub use stability::StabilityModel;
pub use toxicity::ToxicityModel;

/// Errors a model may report. The message ends up in `failure_reason`.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Input not supported by {model}: {reason}")]
    UnsupportedInput {
        model: String,
        reason: String,
    },

    #[error("Dataset unavailable: {dataset}")]
    DatasetUnavailable {
        dataset: String,
    },

    #[error("Computation failed: {message}")]
    Computation {
        message: String,
    },
}

/// Input handed to a model.
#[derive(Debug, Clone, Copy)]
pub struct ComputeInput<'a> {
    /// Simulation being computed.
    pub simulation_id: SimulationId,
    /// Validated parameters.
    pub parameters: &'a SimulationParameters,
    /// Digest of `parameters`; the seed source for deterministic models.
    pub parameter_hash: &'a ParameterHash,
}

/// A zone ring before it is projected onto the map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneSpec {
    /// Zone classification.
    pub zone_type: ZoneType,
    /// Ring radius around the anchor point.
    pub radius_km: f64,
    /// Expected concentration range.
    pub toxicity_ppm: Option<ToxicityRange>,
}

/// Raw model output, shaped into a `SimulationResult` by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    /// Risk score; must lie in `[0, 1]`.
    pub risk_score: f64,
    /// Confidence; must lie in `[0, 1]`.
    pub confidence: f64,
    /// Hazard-specific detail.
    pub summary: ResultSummary,
    /// Zone rings, innermost first.
    pub zones: Vec<ZoneSpec>,
    /// Datasets consumed.
    pub dataset_versions: DatasetVersions,
}

/// Capability interface for hazard computation.
pub trait HazardModel: Send + Sync {
    /// Engine name, recorded on every simulation it runs.
    fn name(&self) -> &str;

    /// Engine version.
    fn version(&self) -> &str;

    /// Runs the computation.
    ///
    /// # Errors
    /// Returns `ModelError` when the computation cannot produce a result.
    /// Panics are caught by the worker and treated the same way.
    fn compute(&self, input: &ComputeInput<'_>) -> Result<ModelOutput, ModelError>;

    /// Identity stamped on simulations.
    fn stamp(&self) -> EngineStamp {
        EngineStamp::new(self.name(), self.version())
    }
}

/// Maps hazard types to models.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<HazardType, Arc<dyn HazardModel>>,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.models.iter().map(|(h, m)| (h, m.stamp().to_string())))
            .finish()
    }
}

impl ModelRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled models for every hazard type.
    #[must_use]
    pub fn builtin() -> Self {
        let stability: Arc<dyn HazardModel> = Arc::new(StabilityModel::new());
        let toxicity: Arc<dyn HazardModel> = Arc::new(ToxicityModel::new());

        let mut registry = Self::new();
        registry.register(HazardType::Landslide, Arc::clone(&stability));
        registry.register(HazardType::Subsidence, stability);
        registry.register(HazardType::Flood, Arc::clone(&toxicity));
        registry.register(HazardType::Earthquake, toxicity);
        registry
    }

    /// Registers `model` for `hazard`, returning the model it replaced.
    pub fn register(
        &mut self,
        hazard: HazardType,
        model: Arc<dyn HazardModel>,
    ) -> Option<Arc<dyn HazardModel>> {
        self.models.insert(hazard, model)
    }

    /// Model serving `hazard`.
    ///
    /// # Errors
    /// Returns `UnsupportedHazard` if nothing is registered for it.
    pub fn resolve(&self, hazard: HazardType) -> Result<Arc<dyn HazardModel>, ValidationError> {
        self.models
            .get(&hazard)
            .cloned()
            .ok_or_else(|| ValidationError::UnsupportedHazard {
                hazard: hazard.to_string(),
            })
    }

    /// Hazard types with a registered model.
    pub fn hazards(&self) -> impl Iterator<Item = HazardType> + '_ {
        self.models.keys().copied()
    }
}

/// Uniform value in `[0, 1)` derived from `seed` and a salt, so one seed
/// can drive several independent quantities.
pub(crate) fn unit_from_seed(seed: u64, salt: &str) -> f64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    hasher.update(salt.as_bytes());
    let bytes = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes.as_bytes()[..8]);
    // 53 high bits give an exact f64 mantissa.
    #[allow(clippy::cast_precision_loss)]
    let value = (u64::from_le_bytes(word) >> 11) as f64 / (1u64 << 53) as f64;
    value
}

/// Rounds to two decimals, the precision results are reported at.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    impl HazardModel for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn version(&self) -> &str {
            "0.0.1"
        }

        fn compute(&self, _input: &ComputeInput<'_>) -> Result<ModelOutput, ModelError> {
            Err(ModelError::Computation {
                message: "not implemented".to_string(),
            })
        }
    }

    #[test]
    fn builtin_covers_every_hazard() {
        let registry = ModelRegistry::builtin();
        for hazard in HazardType::ALL {
            assert!(registry.resolve(hazard).is_ok(), "{hazard} unresolved");
        }
        assert_eq!(registry.resolve(HazardType::Landslide).unwrap().name(), "stability");
        assert_eq!(registry.resolve(HazardType::Flood).unwrap().name(), "toxicity");
    }

    #[test]
    fn empty_registry_rejects_hazard() {
        let registry = ModelRegistry::new();
        assert!(matches!(
            registry.resolve(HazardType::Flood),
            Err(ValidationError::UnsupportedHazard { .. })
        ));
    }

    #[test]
    fn register_replaces_and_stamps() {
        let mut registry = ModelRegistry::builtin();
        let previous = registry.register(HazardType::Landslide, Arc::new(Fixed));
        assert_eq!(previous.unwrap().name(), "stability");

        let stamp = registry.resolve(HazardType::Landslide).unwrap().stamp();
        assert_eq!(stamp.to_string(), "fixed@0.0.1");
    }

    #[test]
    fn seeded_units_are_stable_and_bounded() {
        let a = unit_from_seed(42, "risk");
        assert_eq!(a, unit_from_seed(42, "risk"));
        assert_ne!(a, unit_from_seed(42, "confidence"));
        for seed in 0..256 {
            let v = unit_from_seed(seed, "risk");
            assert!((0.0..1.0).contains(&v));
        }
    }
}
