//! Linear extrema of a single expression under the current constraint set,
//! used by controllers to learn how much power an ESS can still take.

use good_lp::solvers::clarabel::clarabel;
use good_lp::{constraint, variable, Expression, ProblemVariables, ResolutionError, Solution, SolverModel, Variable};
use serde::{Deserialize, Serialize};

use crate::domain::Relationship;
use crate::error::{PowerError, PowerResult};
use crate::optimizer::{Constraint, LinearCoefficient};

const SCALE: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoalType {
    Minimize,
    Maximize,
}

/// Minimizes or maximizes `Σ target` over `n` free columns subject to `constraints`.
pub fn optimize_expression(
    n: usize,
    constraints: &[&Constraint],
    target: &[LinearCoefficient],
    goal: GoalType,
) -> PowerResult<f64> {
    let out_of_range = target
        .iter()
        .chain(constraints.iter().flat_map(|c| c.coefficients.iter()))
        .any(|lc| lc.index >= n);
    if out_of_range {
        return Err(PowerError::Numerical(format!("expression references a column beyond {}", n)));
    }

    let mut vars = ProblemVariables::new();
    let xs: Vec<Variable> = (0..n).map(|_| vars.add(variable())).collect();
    let linear = |terms: &[LinearCoefficient]| -> Expression { terms.iter().map(|lc| lc.value * xs[lc.index]).sum() };

    let objective = linear(target);
    let problem = match goal {
        GoalType::Minimize => vars.minimise(objective),
        GoalType::Maximize => vars.maximise(objective),
    };
    let mut model = problem.using(clarabel);
    for c in constraints {
        let lhs = linear(&c.coefficients);
        let rhs = c.value / SCALE;
        model = model.with(match c.relationship {
            Relationship::Eq => constraint!(lhs == rhs),
            Relationship::Leq => constraint!(lhs <= rhs),
            Relationship::Geq => constraint!(lhs >= rhs),
        });
    }

    let solution = model.solve().map_err(|e| match e {
        ResolutionError::Infeasible => PowerError::InfeasibleConstraintSet { dropped: Vec::new() },
        other => PowerError::Numerical(format!("{:?} of expression failed: {}", goal, other)),
    })?;

    Ok(target.iter().map(|lc| lc.value * solution.value(xs[lc.index])).sum::<f64>() * SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::ConstraintOrigin;

    fn bound(index: usize, relationship: Relationship, value: f64) -> Constraint {
        Constraint::new(
            "bound",
            vec![LinearCoefficient { index, value: 1.0 }],
            relationship,
            value,
            ConstraintOrigin::DeviceLimit,
        )
    }

    #[test]
    fn test_sum_extrema() {
        let constraints = [
            bound(0, Relationship::Geq, -3000.0),
            bound(0, Relationship::Leq, 2000.0),
            bound(1, Relationship::Geq, -1000.0),
            bound(1, Relationship::Leq, 4000.0),
        ];
        let refs: Vec<&Constraint> = constraints.iter().collect();
        let sum = [LinearCoefficient { index: 0, value: 1.0 }, LinearCoefficient { index: 1, value: 1.0 }];
        let max = optimize_expression(2, &refs, &sum, GoalType::Maximize).unwrap();
        let min = optimize_expression(2, &refs, &sum, GoalType::Minimize).unwrap();
        assert!((max - 6000.0).abs() < 0.5, "max {}", max);
        assert!((min + 4000.0).abs() < 0.5, "min {}", min);
    }

    #[test]
    fn test_infeasible_set_is_reported() {
        let constraints = [bound(0, Relationship::Geq, 10.0), bound(0, Relationship::Leq, -10.0)];
        let refs: Vec<&Constraint> = constraints.iter().collect();
        let target = [LinearCoefficient { index: 0, value: 1.0 }];
        let result = optimize_expression(1, &refs, &target, GoalType::Maximize);
        assert!(matches!(result, Err(PowerError::InfeasibleConstraintSet { .. })));
    }

    #[test]
    fn test_rejects_unknown_column() {
        let target = [LinearCoefficient { index: 5, value: 1.0 }];
        assert!(optimize_expression(1, &[], &target, GoalType::Minimize).is_err());
    }
}
