//! Allocation strategies
//!
//! Each strategy turns a group total into one reference value per leaf
//! column. The solver then projects the references onto the feasible set:
//! - KeepAllEqual: same utilization ratio `P/Smax` for every device
//! - KeepAllNearEqual: even split, clipped, excess spread by headroom
//! - KeepAllNearEqualSoc: SoC-weighted split for long-run balancing
//! - MoveTowardsTarget: bounded step from the last good point toward the
//!   SoC-preferred extreme point

pub mod keep_all_equal;
pub mod move_towards_target;
pub mod near_equal;

pub use keep_all_equal::*;
pub use move_towards_target::*;
pub use near_equal::*;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Values closer than this are considered equal when distributing power (W).
pub(crate) const EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumIter, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SolverStrategy {
    KeepAllEqual,
    KeepAllNearEqual,
    KeepAllNearEqualSoc,
    #[default]
    MoveTowardsTarget,
}

/// Everything a strategy may look at for one group of leaf columns.
#[derive(Debug, Clone, Copy)]
pub struct GroupInput<'a> {
    /// Power the group has to deliver in total.
    pub total: f64,
    /// `(lower, upper)` per column.
    pub bounds: &'a [(f64, f64)],
    pub soc: &'a [Option<f64>],
    /// Rating per column, used as the utilization denominator.
    pub max_apparent_power: &'a [f64],
    /// Previous operating point per column, `None` before the first cycle.
    pub last: Option<&'a [f64]>,
}

impl SolverStrategy {
    pub fn allocate(&self, input: &GroupInput<'_>, approach_rate: f64) -> Vec<f64> {
        match self {
            SolverStrategy::KeepAllEqual => keep_all_equal(input.total, input.bounds, input.max_apparent_power),
            SolverStrategy::KeepAllNearEqual => keep_all_near_equal(input.total, input.bounds),
            SolverStrategy::KeepAllNearEqualSoc => keep_all_near_equal_soc(input.total, input.bounds, input.soc),
            SolverStrategy::MoveTowardsTarget => {
                move_towards_target(input.total, input.bounds, input.soc, input.last, approach_rate)
            }
        }
    }
}

/// `clamp` that tolerates inverted bounds by preferring the lower one.
pub(crate) fn clamp(value: f64, lower: f64, upper: f64) -> f64 {
    value.min(upper).max(lower)
}
