use indexmap::IndexMap;
use itertools::Itertools;
use serde::Serialize;
use std::fmt;

use crate::domain::{Phase, Pwr, Relationship};
use crate::error::{PowerError, PowerResult};
use crate::optimizer::Coefficients;

/// One term of a linear constraint, already resolved to a solver column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinearCoefficient {
    pub index: usize,
    pub value: f64,
}

/// Where a constraint came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConstraintOrigin {
    /// Submitted by a controller during the open phase of a cycle.
    Controller(String),
    /// Sum of a cluster's children equals the cluster.
    ClusterFlow,
    /// Charge/discharge bounds and phase coupling of a leaf.
    DeviceLimit,
    /// Edge of an apparent power polygon.
    ApparentPower,
    /// Faulted or unmanaged leaf pinned to zero.
    Fault,
}

impl fmt::Display for ConstraintOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintOrigin::Controller(id) => write!(f, "controller:{}", id),
            ConstraintOrigin::ClusterFlow => write!(f, "cluster-flow"),
            ConstraintOrigin::DeviceLimit => write!(f, "device-limit"),
            ConstraintOrigin::ApparentPower => write!(f, "apparent-power"),
            ConstraintOrigin::Fault => write!(f, "fault"),
        }
    }
}

/// `Σ coefficient·x REL value` over solver columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Constraint {
    pub description: String,
    pub coefficients: Vec<LinearCoefficient>,
    pub relationship: Relationship,
    pub value: f64,
    pub origin: ConstraintOrigin,
    /// Relax priority; `None` marks a hard constraint that is never dropped.
    pub priority: Option<u32>,
}

impl Constraint {
    pub fn new(
        description: impl Into<String>,
        coefficients: Vec<LinearCoefficient>,
        relationship: Relationship,
        value: f64,
        origin: ConstraintOrigin,
    ) -> Self {
        Self {
            description: description.into(),
            coefficients,
            relationship,
            value,
            origin,
            priority: None,
        }
    }

    pub fn lhs(&self, x: &[f64]) -> f64 {
        self.coefficients
            .iter()
            .map(|c| c.value * x.get(c.index).copied().unwrap_or(0.0))
            .sum()
    }

    pub fn is_satisfied_by(&self, x: &[f64], tolerance: f64) -> bool {
        self.relationship.holds(self.lhs(x), self.value, tolerance)
    }

    pub fn is_relaxable(&self) -> bool {
        self.priority.is_some()
    }

    /// Human readable form with column names, used by debug logging.
    pub fn render(&self, coefficients: &Coefficients) -> String {
        let lhs = self
            .coefficients
            .iter()
            .map(|c| match coefficients.key_of(c.index) {
                Some(key) => format!("{:+}*{}.{}{}", c.value, key.ess_id, key.pwr.symbol(), key.phase),
                None => format!("{:+}*x{}", c.value, c.index),
            })
            .join(" ");
        format!("[{}] {}: {} {} {}", self.origin, self.description, lhs, self.relationship, self.value)
    }
}

/// Handle of a controller-submitted constraint within its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConstraintId(pub usize);

/// A relaxable constraint that was dropped to make a cycle feasible.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedConstraint {
    pub id: ConstraintId,
    pub contributor: String,
    pub description: String,
    pub priority: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    pub ess_id: String,
    pub phase: Phase,
    pub pwr: Pwr,
    pub coefficient: f64,
}

/// A constraint as a controller states it, in terms of ESS ids and phases.
///
/// ```
/// use ess_power::domain::{Phase, Pwr, Relationship};
/// use ess_power::optimizer::ConstraintRequest;
///
/// let balance = ConstraintRequest::new("balancing0", "grid balance", Relationship::Eq, -5000.0)
///     .term("cluster0", Phase::All, Pwr::Active, 1.0)
///     .with_priority(10);
/// assert_eq!(balance.terms.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintRequest {
    pub contributor: String,
    pub description: String,
    pub terms: Vec<Term>,
    pub relationship: Relationship,
    pub value: f64,
    pub priority: Option<u32>,
}

impl ConstraintRequest {
    pub fn new(
        contributor: impl Into<String>,
        description: impl Into<String>,
        relationship: Relationship,
        value: f64,
    ) -> Self {
        Self {
            contributor: contributor.into(),
            description: description.into(),
            terms: Vec::new(),
            relationship,
            value,
            priority: None,
        }
    }

    /// Single-variable bound `1·(ess_id, phase, pwr) REL value`.
    pub fn simple(
        contributor: impl Into<String>,
        description: impl Into<String>,
        ess_id: impl Into<String>,
        phase: Phase,
        pwr: Pwr,
        relationship: Relationship,
        value: f64,
    ) -> Self {
        Self::new(contributor, description, relationship, value).term(ess_id, phase, pwr, 1.0)
    }

    pub fn term(mut self, ess_id: impl Into<String>, phase: Phase, pwr: Pwr, coefficient: f64) -> Self {
        self.terms.push(Term {
            ess_id: ess_id.into(),
            phase,
            pwr,
            coefficient,
        });
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Resolves ESS ids and phases against this cycle's columns. Terms that
    /// land on the same column are summed.
    pub fn resolve(&self, coefficients: &Coefficients) -> PowerResult<Constraint> {
        if self.terms.is_empty() {
            return Err(PowerError::configuration(format!(
                "constraint '{}' from {} has no terms",
                self.description, self.contributor
            )));
        }
        if !self.value.is_finite() || self.terms.iter().any(|t| !t.coefficient.is_finite()) {
            return Err(PowerError::configuration(format!(
                "constraint '{}' from {} is not finite",
                self.description, self.contributor
            )));
        }

        let mut merged: IndexMap<usize, f64> = IndexMap::new();
        for term in &self.terms {
            for lc in coefficients.terms(&term.ess_id, term.phase, term.pwr, term.coefficient)? {
                *merged.entry(lc.index).or_insert(0.0) += lc.value;
            }
        }

        Ok(Constraint {
            description: self.description.clone(),
            coefficients: merged
                .into_iter()
                .map(|(index, value)| LinearCoefficient { index, value })
                .collect(),
            relationship: self.relationship,
            value: self.value,
            origin: ConstraintOrigin::Controller(self.contributor.clone()),
            priority: self.priority,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EssDescriptor, Topology};

    fn coefficients(symmetric: bool) -> Coefficients {
        let topology = Topology::new(vec![
            EssDescriptor::leaf("ess0").with_limits(-1000.0, 1000.0, 1000.0),
            EssDescriptor::leaf("ess1").with_limits(-1000.0, 1000.0, 1000.0),
        ])
        .unwrap();
        Coefficients::new(&topology, symmetric)
    }

    #[test]
    fn test_resolve_simple_request() {
        let c = coefficients(true);
        let constraint = ConstraintRequest::simple("ctrl", "limit", "ess1", Phase::All, Pwr::Active, Relationship::Leq, 500.0)
            .resolve(&c)
            .unwrap();
        assert_eq!(constraint.coefficients, vec![LinearCoefficient { index: 2, value: 1.0 }]);
        assert_eq!(constraint.origin, ConstraintOrigin::Controller("ctrl".into()));
        assert!(!constraint.is_relaxable());
    }

    #[test]
    fn test_resolve_merges_duplicate_columns() {
        let c = coefficients(true);
        let constraint = ConstraintRequest::new("ctrl", "dup", Relationship::Eq, 0.0)
            .term("ess0", Phase::All, Pwr::Active, 1.0)
            .term("ess0", Phase::All, Pwr::Active, 2.0)
            .with_priority(3)
            .resolve(&c)
            .unwrap();
        assert_eq!(constraint.coefficients, vec![LinearCoefficient { index: 0, value: 3.0 }]);
        assert_eq!(constraint.priority, Some(3));
    }

    #[test]
    fn test_resolve_rejects_unknown_ess_and_empty_terms() {
        let c = coefficients(false);
        let unknown = ConstraintRequest::simple("ctrl", "x", "ess9", Phase::L1, Pwr::Active, Relationship::Eq, 0.0);
        assert!(matches!(unknown.resolve(&c), Err(PowerError::Configuration(_))));
        let empty = ConstraintRequest::new("ctrl", "x", Relationship::Eq, 0.0);
        assert!(empty.resolve(&c).is_err());
        let nan = ConstraintRequest::simple("ctrl", "x", "ess0", Phase::L1, Pwr::Active, Relationship::Eq, f64::NAN);
        assert!(nan.resolve(&c).is_err());
    }

    #[test]
    fn test_satisfaction() {
        let constraint = Constraint::new(
            "sum",
            vec![LinearCoefficient { index: 0, value: 1.0 }, LinearCoefficient { index: 1, value: -1.0 }],
            Relationship::Eq,
            0.0,
            ConstraintOrigin::ClusterFlow,
        );
        assert!(constraint.is_satisfied_by(&[5.0, 5.0], 1e-9));
        assert!(!constraint.is_satisfied_by(&[5.0, 4.0], 1e-9));
    }

    #[test]
    fn test_render_names_columns() {
        let c = coefficients(true);
        let constraint = ConstraintRequest::simple("ctrl", "limit", "ess1", Phase::All, Pwr::Active, Relationship::Leq, 500.0)
            .resolve(&c)
            .unwrap();
        let text = constraint.render(&c);
        assert!(text.contains("ess1.pALL"), "{}", text);
        assert!(text.contains("<= 500"), "{}", text);
    }
}
