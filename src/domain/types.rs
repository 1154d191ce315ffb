use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Electrical phase a solver variable refers to.
///
/// `All` is the aggregate of the three phases and is the only phase used in
/// symmetric mode. Asymmetric mode uses `L1`..`L3` exclusively.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumIter, EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Phase {
    All,
    L1,
    L2,
    L3,
}

impl Phase {
    pub const SINGLE: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    /// Phases that carry solver columns in the given mode.
    pub fn columns(symmetric_mode: bool) -> &'static [Phase] {
        if symmetric_mode {
            &[Phase::All]
        } else {
            &Self::SINGLE
        }
    }
}

/// Power type of a solver variable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumIter, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Pwr {
    Active,
    Reactive,
}

impl Pwr {
    pub const BOTH: [Pwr; 2] = [Pwr::Active, Pwr::Reactive];

    pub fn symbol(&self) -> &'static str {
        match self {
            Pwr::Active => "p",
            Pwr::Reactive => "q",
        }
    }
}

/// Relation between the linear expression and the constant of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
pub enum Relationship {
    #[strum(serialize = "=")]
    Eq,
    #[strum(serialize = "<=")]
    Leq,
    #[strum(serialize = ">=")]
    Geq,
}

impl Relationship {
    /// Checks `lhs REL rhs` with an absolute tolerance.
    pub fn holds(&self, lhs: f64, rhs: f64, tolerance: f64) -> bool {
        match self {
            Relationship::Eq => (lhs - rhs).abs() <= tolerance,
            Relationship::Leq => lhs <= rhs + tolerance,
            Relationship::Geq => lhs >= rhs - tolerance,
        }
    }
}
