//! Write path to physical ESS.
//!
//! The scheduler only talks to hardware through [`EssWriter`]; the owning
//! device component decides how a set-point reaches the inverter and retries
//! failed writes on its own.

#[cfg(feature = "sim")]
pub mod simulated;

#[cfg(feature = "sim")]
pub use simulated::{SimulatedEss, SimulatedUnit};

use crate::error::PowerResult;
use crate::optimizer::PhaseSetpoint;

#[cfg_attr(test, mockall::automock)]
pub trait EssWriter {
    /// Symmetric set-point: total active and reactive power (W, VAr).
    fn apply_power(&self, ess_id: &str, active_power: i32, reactive_power: i32) -> PowerResult<()>;

    /// One set-point per phase, L1 to L3.
    fn apply_power_asymmetric(&self, ess_id: &str, phases: [PhaseSetpoint; 3]) -> PowerResult<()>;
}
