//! Service configuration.
//!
//! Every knob has a default; `from_env` overrides them from `HAZARDSIM_*`
//! variables. Loading goes through a lookup closure so tests never touch the
//! process environment.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ValidationError;
use crate::lifecycle::DEFAULT_FAILURE_REASON_MAX_LEN;

/// Worker thread count variable.
pub const ENV_WORKERS: &str = "HAZARDSIM_WORKERS";
/// Queue capacity variable.
pub const ENV_QUEUE_CAPACITY: &str = "HAZARDSIM_QUEUE_CAPACITY";
/// Failure reason bound variable.
pub const ENV_FAILURE_REASON_MAX_LEN: &str = "HAZARDSIM_FAILURE_REASON_MAX_LEN";
/// Requeue sweep interval variable, in milliseconds.
pub const ENV_REQUEUE_INTERVAL_MS: &str = "HAZARDSIM_REQUEUE_INTERVAL_MS";
/// Persistent data directory variable.
pub const ENV_DATA_DIR: &str = "HAZARDSIM_DATA_DIR";

/// Upper bound on worker threads.
pub const MAX_WORKERS: usize = 256;

/// Upper bound on the requeue interval.
pub const MAX_REQUEUE_INTERVAL: Duration = Duration::from_secs(3600);

/// Runtime configuration for [`crate::HazardSim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HazardSimConfig {
    /// Worker threads in the pool.
    pub workers: usize,
    /// Bound of the work queue; a full queue rejects new dispatches.
    pub queue_capacity: usize,
    /// Bound on stored failure reasons, in bytes.
    pub failure_reason_max_len: usize,
    /// Pause between sweeps that re-dispatch records left `QUEUED`.
    pub requeue_interval: Duration,
    /// Directory for the persistent store. `None` keeps records in memory.
    pub data_dir: Option<PathBuf>,
}

impl Default for HazardSimConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            failure_reason_max_len: DEFAULT_FAILURE_REASON_MAX_LEN,
            requeue_interval: Duration::from_secs(1),
            data_dir: None,
        }
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidConfig {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T, ValidationError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| invalid(key, format!("'{raw}' is not valid: {e}")))
}

impl HazardSimConfig {
    /// Defaults overridden by `HAZARDSIM_*` environment variables.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for unparsable or out-of-range values.
    pub fn from_env() -> Result<Self, ValidationError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    ///
    /// Blank values are treated as unset.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for unparsable or out-of-range values.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ValidationError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(v) = get(ENV_WORKERS) {
            cfg.workers = parse_var(ENV_WORKERS, &v)?;
        }
        if let Some(v) = get(ENV_QUEUE_CAPACITY) {
            cfg.queue_capacity = parse_var(ENV_QUEUE_CAPACITY, &v)?;
        }
        if let Some(v) = get(ENV_FAILURE_REASON_MAX_LEN) {
            cfg.failure_reason_max_len = parse_var(ENV_FAILURE_REASON_MAX_LEN, &v)?;
        }
        if let Some(v) = get(ENV_REQUEUE_INTERVAL_MS) {
            cfg.requeue_interval = Duration::from_millis(parse_var(ENV_REQUEUE_INTERVAL_MS, &v)?);
        }
        if let Some(v) = get(ENV_DATA_DIR) {
            cfg.data_dir = Some(PathBuf::from(v.trim()));
        }

        cfg.validate()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if a bound is zero, `workers` exceeds
    /// [`MAX_WORKERS`] or the requeue interval exceeds
    /// [`MAX_REQUEUE_INTERVAL`].
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(invalid(
                "workers",
                format!("must be between 1 and {MAX_WORKERS} (got {})", self.workers),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if self.failure_reason_max_len == 0 {
            return Err(invalid("failure_reason_max_len", "must be at least 1"));
        }
        if self.requeue_interval.is_zero() || self.requeue_interval > MAX_REQUEUE_INTERVAL {
            return Err(invalid(
                "requeue_interval",
                format!(
                    "must be between 1ms and {MAX_REQUEUE_INTERVAL:?} (got {:?})",
                    self.requeue_interval
                ),
            ));
        }
        Ok(self)
    }
}
