//! Error types for hazardsim.
//!
//! All errors are strongly typed using thiserror so callers can pattern
//! match on specific conditions. Worker-side failures never surface here:
//! they are recorded on the simulation as a `FAILED` state instead.

use thiserror::Error;

use crate::simulation::{SimulationId, SimulationStatus};
use crate::storage::StorageError;

/// Validation errors raised by structurally malformed input.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid parameters: {reason}")]
    InvalidParameters {
        reason: String,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        field: String,
        max_length: usize,
    },

    #[error("Field '{field}' is out of range: {reason}")]
    OutOfRange {
        field: String,
        reason: String,
    },

    #[error("Invalid geometry: {reason}")]
    InvalidGeometry {
        reason: String,
    },

    #[error("No engine registered for hazard '{hazard}'")]
    UnsupportedHazard {
        hazard: String,
    },

    #[error("Invalid owner id: {reason}")]
    InvalidOwner {
        reason: String,
    },

    #[error("Invalid transition payload for {to}: {reason}")]
    InvalidTransitionPayload {
        to: SimulationStatus,
        reason: String,
    },

    #[error("Invalid configuration '{field}': {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },
}

impl ValidationError {
    /// Shorthand for `InvalidParameters`.
    #[must_use]
    pub fn parameters(reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            reason: reason.into(),
        }
    }
}

/// Errors raised while moving a simulation through its lifecycle.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Illegal transition for simulation {id}: {from} -> {to} ({detail})")]
    IllegalTransition {
        id: SimulationId,
        from: SimulationStatus,
        to: SimulationStatus,
        detail: String,
    },

    #[error("Execution failed: {message}")]
    ExecutionFailure {
        message: String,
    },

    #[error("Work queue is full (capacity: {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Work queue disconnected")]
    Disconnected,

    #[error("Simulation {id} was stored but could not be dispatched: {reason}")]
    Dispatch {
        id: SimulationId,
        reason: String,
    },
}

/// Top-level error type for hazardsim.
#[derive(Debug, Error)]
pub enum HazardError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(#[from] ValidationError),

    #[error("Simulation not found: {id}")]
    NotFound {
        id: SimulationId,
    },

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl HazardError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub const fn not_found(id: SimulationId) -> Self {
        Self::NotFound { id }
    }

    /// Returns true if this is a caller input error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidParameters(_))
    }

    /// Returns true if this is a not-found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if a CAS guard rejected a transition.
    #[must_use]
    pub const fn is_illegal_transition(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::IllegalTransition { .. }))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the caller may retry the same request later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidParameters(_) | Self::NotFound { .. } | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::QueueFull { .. } | ExecutionError::Dispatch { .. }
            ),
            Self::Storage(e) => e.is_transient(),
        }
    }

    /// HTTP status class the outer transport should answer with.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidParameters(_) => 422,
            Self::NotFound { .. } => 404,
            Self::Execution(ExecutionError::QueueFull { .. } | ExecutionError::Dispatch { .. }) => {
                503
            }
            Self::Execution(_) | Self::Storage(_) | Self::Internal { .. } => 500,
        }
    }

    /// Message safe to return to an external caller.
    ///
    /// Validation details are the caller's own input and are echoed back.
    /// Everything else collapses to a generic string.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidParameters(e) => e.to_string(),
            Self::NotFound { .. } => "Simulation not found".to_string(),
            Self::Execution(ExecutionError::QueueFull { .. } | ExecutionError::Dispatch { .. }) => {
                "Simulation queue is temporarily unavailable".to_string()
            }
            Self::Execution(_) | Self::Storage(_) | Self::Internal { .. } => {
                "Internal server error".to_string()
            }
        }
    }
}

/// Result type alias for hazardsim operations.
pub type HazardResult<T> = Result<T, HazardError>;
