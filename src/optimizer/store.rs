//! Per-cycle constraint set.
//!
//! A `ConstraintStore` is built fresh from a topology snapshot at the start of
//! every cycle. Generated constraints (cluster flow, device limits) are fixed
//! at construction; controllers then add their own until the cycle is solved.

use std::time::Duration;

use tracing::debug;

use crate::domain::{Phase, Pwr, Relationship, Topology};
use crate::error::{PowerError, PowerResult};
use crate::optimizer::{
    cluster_flow_constraints, device_limit_constraints, optimize_expression, qp, Coefficients, Constraint,
    ConstraintId, ConstraintRequest, GoalType, QpOutcome, SolverSettings,
};

#[derive(Debug, Clone)]
pub struct ConstraintStore {
    topology: Topology,
    coefficients: Coefficients,
    generated: Vec<Constraint>,
    submitted: Vec<Constraint>,
    check_time_limit: Duration,
    max_polygon_resolution: usize,
}

impl ConstraintStore {
    /// Rebuilds the variable index and regenerates cluster flow and device
    /// limit constraints for `topology`.
    pub fn initialize_cycle(topology: Topology, settings: &SolverSettings) -> PowerResult<Self> {
        let coefficients = Coefficients::new(&topology, settings.symmetric_mode);
        let mut generated = cluster_flow_constraints(&topology, &coefficients)?;
        generated.extend(device_limit_constraints(
            &topology,
            &coefficients,
            settings.max_polygon_resolution,
        )?);
        debug!(
            ess = topology.len(),
            columns = coefficients.len(),
            generated = generated.len(),
            "cycle constraints generated"
        );
        Ok(Self {
            topology,
            coefficients,
            generated,
            submitted: Vec::new(),
            check_time_limit: settings.time_budget,
            max_polygon_resolution: settings.max_polygon_resolution,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn coefficients(&self) -> &Coefficients {
        &self.coefficients
    }

    pub fn max_polygon_resolution(&self) -> usize {
        self.max_polygon_resolution
    }

    pub fn generated(&self) -> &[Constraint] {
        &self.generated
    }

    /// Controller constraints in submission order; the position is the `ConstraintId`.
    pub fn submitted(&self) -> &[Constraint] {
        &self.submitted
    }

    pub fn constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.generated.iter().chain(self.submitted.iter())
    }

    pub fn add_constraint(&mut self, request: &ConstraintRequest) -> PowerResult<ConstraintId> {
        let constraint = request.resolve(&self.coefficients)?;
        debug!(
            contributor = %request.contributor,
            constraint = %constraint.render(&self.coefficients),
            "constraint added"
        );
        self.submitted.push(constraint);
        Ok(ConstraintId(self.submitted.len() - 1))
    }

    /// Hard single-variable bound `(ess_id, phase, pwr) REL value`.
    pub fn add_simple_constraint(
        &mut self,
        contributor: &str,
        ess_id: &str,
        phase: Phase,
        pwr: Pwr,
        relationship: Relationship,
        value: f64,
    ) -> PowerResult<ConstraintId> {
        let description = format!("{} {}{} {} {}", ess_id, pwr.symbol(), phase, relationship, value);
        self.add_constraint(&ConstraintRequest::simple(
            contributor,
            description,
            ess_id,
            phase,
            pwr,
            relationship,
            value,
        ))
    }

    /// Adds `request` only if the constraint set stays feasible with it.
    pub fn add_constraint_and_validate(&mut self, request: &ConstraintRequest) -> PowerResult<ConstraintId> {
        let id = self.add_constraint(request)?;
        match self.is_solvable() {
            Ok(true) => Ok(id),
            Ok(false) => {
                self.submitted.pop();
                Err(PowerError::InfeasibleConstraintSet { dropped: Vec::new() })
            }
            Err(e) => {
                self.submitted.pop();
                Err(e)
            }
        }
    }

    /// Whether the current constraints admit any solution.
    pub fn is_solvable(&self) -> PowerResult<bool> {
        let constraints: Vec<&Constraint> = self.constraints().collect();
        let objective = qp::Objective::feasibility(self.coefficients.len());
        match qp::solve(&objective, &constraints, self.check_time_limit)? {
            QpOutcome::Solved { .. } => Ok(true),
            QpOutcome::Infeasible => Ok(false),
            QpOutcome::TimedOut => Err(PowerError::SolverTimeout {
                budget_ms: self.check_time_limit.as_millis() as u64,
                elapsed_ms: self.check_time_limit.as_millis() as u64,
            }),
        }
    }

    /// Smallest value `(ess_id, phase, pwr)` can take under the current constraints.
    pub fn min_power(&self, ess_id: &str, phase: Phase, pwr: Pwr) -> PowerResult<f64> {
        self.extremum(ess_id, phase, pwr, GoalType::Minimize)
    }

    /// Largest value `(ess_id, phase, pwr)` can take under the current constraints.
    pub fn max_power(&self, ess_id: &str, phase: Phase, pwr: Pwr) -> PowerResult<f64> {
        self.extremum(ess_id, phase, pwr, GoalType::Maximize)
    }

    fn extremum(&self, ess_id: &str, phase: Phase, pwr: Pwr, goal: GoalType) -> PowerResult<f64> {
        let target = self.coefficients.terms(ess_id, phase, pwr, 1.0)?;
        let constraints: Vec<&Constraint> = self.constraints().collect();
        optimize_expression(self.coefficients.len(), &constraints, &target, goal)
    }

    /// Clamps `value` into `[min_power, max_power]` of the addressed variable.
    pub fn fit_into_min_max(&self, ess_id: &str, phase: Phase, pwr: Pwr, value: f64) -> PowerResult<f64> {
        let min = self.min_power(ess_id, phase, pwr)?;
        let max = self.max_power(ess_id, phase, pwr)?;
        Ok(value.min(max).max(min))
    }

    /// Requests `value` of active power for `ess_id`, saturating at what the
    /// current constraints still allow instead of making the set infeasible.
    pub fn set_active_power_equals(&mut self, contributor: &str, ess_id: &str, value: f64) -> PowerResult<ConstraintId> {
        let fitted = self.fit_into_min_max(ess_id, Phase::All, Pwr::Active, value)?;
        self.add_simple_constraint(contributor, ess_id, Phase::All, Pwr::Active, Relationship::Eq, fitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EssDescriptor;

    fn store() -> ConstraintStore {
        let topology = Topology::new(vec![
            EssDescriptor::cluster("c0", ["ess0", "ess1"]),
            EssDescriptor::leaf("ess0").with_limits(-5000.0, 5000.0, 6000.0),
            EssDescriptor::leaf("ess1").with_limits(-3000.0, 4000.0, 6000.0),
        ])
        .unwrap();
        ConstraintStore::initialize_cycle(topology, &SolverSettings::default()).unwrap()
    }

    #[test]
    fn test_initialize_generates_constraints() {
        let store = store();
        assert!(store.submitted().is_empty());
        assert!(!store.generated().is_empty());
        assert_eq!(store.coefficients().len(), 6);
    }

    #[test]
    fn test_add_constraints_returns_sequential_ids() {
        let mut store = store();
        let a = store
            .add_simple_constraint("ctrl", "c0", Phase::All, Pwr::Active, Relationship::Leq, 1000.0)
            .unwrap();
        let b = store
            .add_constraint(&ConstraintRequest::simple("ctrl", "x", "ess0", Phase::All, Pwr::Reactive, Relationship::Eq, 0.0).with_priority(1))
            .unwrap();
        assert_eq!((a, b), (ConstraintId(0), ConstraintId(1)));
        assert_eq!(store.submitted()[1].priority, Some(1));
    }

    #[test]
    fn test_unknown_ess_is_rejected_without_side_effects() {
        let mut store = store();
        let result = store.add_simple_constraint("ctrl", "ess7", Phase::All, Pwr::Active, Relationship::Eq, 0.0);
        assert!(matches!(result, Err(PowerError::Configuration(_))));
        assert!(store.submitted().is_empty());
    }

    #[test]
    fn test_min_max_power_of_cluster() {
        let store = store();
        let max = store.max_power("c0", Phase::All, Pwr::Active).unwrap();
        let min = store.min_power("c0", Phase::All, Pwr::Active).unwrap();
        assert!((max - 9000.0).abs() < 1.0, "max {}", max);
        assert!((min + 8000.0).abs() < 1.0, "min {}", min);
    }

    #[test]
    fn test_set_active_power_equals_saturates() {
        let mut store = store();
        store.set_active_power_equals("ctrl", "c0", 1_000_000.0).unwrap();
        let value = store.submitted()[0].value;
        assert!((value - 9000.0).abs() < 1.0, "value {}", value);
        assert!(store.is_solvable().unwrap());
    }

    #[test]
    fn test_validated_insertion_rolls_back_conflicts() {
        let mut store = store();
        store
            .add_simple_constraint("ctrl", "ess0", Phase::All, Pwr::Active, Relationship::Geq, 4000.0)
            .unwrap();
        let conflicting = ConstraintRequest::simple("ctrl", "x", "ess0", Phase::All, Pwr::Active, Relationship::Leq, 1000.0);
        let result = store.add_constraint_and_validate(&conflicting);
        assert!(matches!(result, Err(PowerError::InfeasibleConstraintSet { .. })));
        assert_eq!(store.submitted().len(), 1);

        let fine = ConstraintRequest::simple("ctrl", "y", "ess0", Phase::All, Pwr::Active, Relationship::Leq, 4500.0);
        assert_eq!(store.add_constraint_and_validate(&fine).unwrap(), ConstraintId(1));
    }
}
