//! Clarabel backend for the per-cycle quadratic programs.
//!
//! Clarabel solves
//!
//! ```text
//!   minimize    ½ xᵀPx + qᵀx
//!   subject to  Ax + s = b,  s ∈ K
//! ```
//!
//! EQ rows go into a zero cone and LEQ/GEQ rows into the nonnegative
//! orthant. Variables are solved in kW so that device limits of a few hundred
//! kW stay well conditioned.

use std::collections::BTreeMap;
use std::time::Duration;

use clarabel::algebra::CscMatrix;
use clarabel::solver::{DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus, SupportedConeT};

use crate::domain::Relationship;
use crate::error::{PowerError, PowerResult};
use crate::optimizer::Constraint;

const SCALE: f64 = 1000.0;
const MAX_ITER: u32 = 200;
const TOLERANCE: f64 = 1e-9;

/// Separable tracking objective `Σ wᵢ (xᵢ − rᵢ)²` in watts.
#[derive(Debug, Clone, PartialEq)]
pub struct Objective {
    pub weights: Vec<f64>,
    pub reference: Vec<f64>,
}

impl Objective {
    /// No objective; solving only checks feasibility.
    pub fn feasibility(n: usize) -> Self {
        Self {
            weights: vec![0.0; n],
            reference: vec![0.0; n],
        }
    }

    pub fn value(&self, x: &[f64]) -> f64 {
        self.weights
            .iter()
            .zip(&self.reference)
            .zip(x)
            .map(|((w, r), x)| w * (x - r).powi(2))
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QpOutcome {
    Solved { x: Vec<f64>, iterations: u32 },
    Infeasible,
    TimedOut,
}

pub fn solve(objective: &Objective, constraints: &[&Constraint], time_limit: Duration) -> PowerResult<QpOutcome> {
    let n = objective.weights.len();
    if objective.reference.len() != n {
        return Err(PowerError::Numerical(format!(
            "objective has {} weights but {} reference values",
            n,
            objective.reference.len()
        )));
    }
    if n == 0 {
        return Ok(QpOutcome::Solved {
            x: Vec::new(),
            iterations: 0,
        });
    }
    if constraints.is_empty() {
        let x = objective
            .weights
            .iter()
            .zip(&objective.reference)
            .map(|(w, r)| if *w > 0.0 { *r } else { 0.0 })
            .collect();
        return Ok(QpOutcome::Solved { x, iterations: 0 });
    }

    // Σ w (SCALE·xs − r)² = Σ w·SCALE² (xs − r/SCALE)², divided by
    // max(w)·SCALE² so the Hessian is O(1) whatever the weight scale
    let max_weight = objective.weights.iter().copied().fold(0.0, f64::max);
    let norm = if max_weight > 0.0 { 1.0 / max_weight } else { 0.0 };
    let mut p_col_ptr = Vec::with_capacity(n + 1);
    let mut p_row_idx = Vec::new();
    let mut p_values = Vec::new();
    let mut q = vec![0.0; n];
    for (i, (w, r)) in objective.weights.iter().zip(&objective.reference).enumerate() {
        p_col_ptr.push(p_values.len());
        if *w > 0.0 {
            p_row_idx.push(i);
            p_values.push(2.0 * w * norm);
            q[i] = -2.0 * w * norm * r / SCALE;
        }
    }
    p_col_ptr.push(p_values.len());
    let p_mat = CscMatrix::new(n, n, p_col_ptr, p_row_idx, p_values);

    let (a_mat, b, cones) = assemble_constraints(n, constraints)?;

    let settings = DefaultSettingsBuilder::default()
        .verbose(false)
        .max_iter(MAX_ITER)
        .time_limit(time_limit.as_secs_f64())
        .tol_feas(TOLERANCE)
        .tol_gap_abs(TOLERANCE)
        .tol_gap_rel(TOLERANCE)
        .build()
        .map_err(|e| PowerError::Numerical(format!("Clarabel settings error: {:?}", e)))?;

    let mut solver = DefaultSolver::new(&p_mat, &q, &a_mat, &b, &cones, settings)
        .map_err(|e| PowerError::Numerical(format!("Clarabel initialization failed: {:?}", e)))?;
    solver.solve();

    let solution = &solver.solution;
    match &solution.status {
        SolverStatus::Solved | SolverStatus::AlmostSolved => Ok(QpOutcome::Solved {
            x: solution.x.iter().map(|v| v * SCALE).collect(),
            iterations: solution.iterations,
        }),
        SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => Ok(QpOutcome::Infeasible),
        SolverStatus::MaxTime => Ok(QpOutcome::TimedOut),
        status => Err(PowerError::Numerical(format!("Clarabel returned status {:?}", status))),
    }
}

/// Builds `A`, `b` and the cone list with all EQ rows first.
fn assemble_constraints(
    n: usize,
    constraints: &[&Constraint],
) -> PowerResult<(CscMatrix<f64>, Vec<f64>, Vec<SupportedConeT<f64>>)> {
    let (equalities, inequalities): (Vec<&Constraint>, Vec<&Constraint>) = constraints
        .iter()
        .copied()
        .partition(|c| c.relationship == Relationship::Eq);

    let mut entries: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    let mut b = Vec::with_capacity(constraints.len());
    for (row, constraint) in equalities.iter().chain(inequalities.iter()).enumerate() {
        let sign = match constraint.relationship {
            Relationship::Eq | Relationship::Leq => 1.0,
            Relationship::Geq => -1.0,
        };
        for lc in &constraint.coefficients {
            if lc.index >= n {
                return Err(PowerError::Numerical(format!(
                    "constraint '{}' references column {} of {}",
                    constraint.description, lc.index, n
                )));
            }
            *entries.entry((lc.index, row)).or_insert(0.0) += sign * lc.value;
        }
        b.push(sign * constraint.value / SCALE);
    }

    let mut col_ptr = Vec::with_capacity(n + 1);
    let mut row_idx = Vec::with_capacity(entries.len());
    let mut values = Vec::with_capacity(entries.len());
    let mut entries = entries.into_iter().peekable();
    for col in 0..n {
        col_ptr.push(values.len());
        while let Some(((_, row), value)) = entries.next_if(|((c, _), _)| *c == col) {
            row_idx.push(row);
            values.push(value);
        }
    }
    col_ptr.push(values.len());

    let mut cones = Vec::with_capacity(2);
    if !equalities.is_empty() {
        cones.push(SupportedConeT::ZeroConeT(equalities.len()));
    }
    if !inequalities.is_empty() {
        cones.push(SupportedConeT::NonnegativeConeT(inequalities.len()));
    }

    Ok((CscMatrix::new(b.len(), n, col_ptr, row_idx, values), b, cones))
}
