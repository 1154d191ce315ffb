use serde::Serialize;
use thiserror::Error;

use crate::optimizer::DroppedConstraint;

/// Errors raised by the power distribution core.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PowerError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("No feasible solution after dropping {} constraint(s)", dropped.len())]
    InfeasibleConstraintSet { dropped: Vec<DroppedConstraint> },
    #[error("Solver exceeded time budget of {budget_ms} ms (took {elapsed_ms} ms)")]
    SolverTimeout { budget_ms: u64, elapsed_ms: u64 },
    #[error("Failed to apply power to {ess_id}: {reason}")]
    HardwareApply { ess_id: String, reason: String },
    #[error("No cycle is open; call initialize_cycle first")]
    CycleNotOpen,
    #[error("Numerical error in solver backend: {0}")]
    Numerical(String),
}

impl PowerError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// True for the failures a scheduler recovers from by holding the last setpoints.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InfeasibleConstraintSet { .. } | Self::SolverTimeout { .. } | Self::Numerical(_)
        )
    }
}

pub type PowerResult<T> = std::result::Result<T, PowerError>;
