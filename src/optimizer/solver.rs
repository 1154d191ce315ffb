//! Per-cycle solver.
//!
//! Solving runs in two stages over the same constraint set:
//! 1. a baseline QP (`Σ x²/Smax` over leaf columns) that establishes
//!    feasibility and the total of every root group; infeasibility is
//!    resolved here by dropping relaxable constraints, lowest priority first;
//! 2. a tracking QP that pulls every leaf toward the reference allocation of
//!    the configured strategy. Reactive references follow the active shares
//!    so P and Q stay balanced the same way.
//!
//! Both stages share one time budget.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{Phase, Pwr, Relationship};
use crate::error::{PowerError, PowerResult};
use crate::optimizer::qp::{self, Objective, QpOutcome};
use crate::optimizer::strategies::near_equal::spread_residual;
use crate::optimizer::{
    strategies::EPSILON, Constraint, ConstraintId, ConstraintOrigin, ConstraintStore, DroppedConstraint, GroupInput,
    SolverStrategy,
};

#[derive(Debug, Clone, PartialEq)]
pub struct SolverSettings {
    pub strategy: SolverStrategy,
    /// One `All` column per ESS instead of one per phase.
    pub symmetric_mode: bool,
    /// Logs every constraint and the solution at info level.
    pub debug_mode: bool,
    pub time_budget: Duration,
    pub max_relax_retries: usize,
    pub max_polygon_resolution: usize,
    /// Step fraction of `MoveTowardsTarget`.
    pub approach_rate: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            strategy: SolverStrategy::default(),
            symmetric_mode: true,
            debug_mode: false,
            time_budget: Duration::from_millis(300),
            max_relax_retries: 5,
            max_polygon_resolution: 32,
            approach_rate: 0.0605,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Solution {
    /// One value per column of the cycle's `Coefficients`.
    pub values: Vec<f64>,
    pub dropped: Vec<DroppedConstraint>,
    pub iterations: u32,
    #[serde(skip)]
    pub elapsed: Duration,
}

type PointKey = (String, Phase, Pwr);

#[derive(Debug, Clone, Default)]
pub struct Solver {
    settings: SolverSettings,
    last_good_point: HashMap<PointKey, f64>,
}

impl Solver {
    pub fn new(settings: SolverSettings) -> Self {
        Self {
            settings,
            last_good_point: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    /// Solves the cycle held by `store`. Does not touch the last good point;
    /// call [`Solver::commit`] once the result has been applied.
    pub fn solve(&self, store: &ConstraintStore) -> PowerResult<Solution> {
        let started = Instant::now();
        self.log_constraints(store);

        let submitted = store.submitted();
        let mut active = vec![true; submitted.len()];
        let mut candidates = relax_order(submitted).into_iter();
        let mut dropped = Vec::new();

        let baseline_objective = self.baseline_objective(store);
        let mut iterations = 0;
        let baseline = loop {
            let constraints = active_constraints(store, &active);
            match qp::solve(&baseline_objective, &constraints, self.remaining(started)?)? {
                QpOutcome::Solved { x, iterations: it } => {
                    iterations += it;
                    break x;
                }
                QpOutcome::TimedOut => return Err(self.timeout(started)),
                QpOutcome::Infeasible => {
                    let next = if dropped.len() < self.settings.max_relax_retries {
                        candidates.next()
                    } else {
                        None
                    };
                    let Some(index) = next else {
                        warn!(dropped = dropped.len(), "constraint set infeasible, giving up");
                        return Err(PowerError::InfeasibleConstraintSet { dropped });
                    };
                    active[index] = false;
                    let relaxed = dropped_entry(index, &submitted[index]);
                    warn!(
                        contributor = %relaxed.contributor,
                        priority = relaxed.priority,
                        description = %relaxed.description,
                        "infeasible, dropping constraint"
                    );
                    dropped.push(relaxed);
                }
            }
        };

        let bounds = column_bounds(store, &active);
        let objective = self.strategy_objective(store, &baseline, &bounds)?;
        let constraints = active_constraints(store, &active);
        let values = match qp::solve(&objective, &constraints, self.remaining(started)?) {
            Ok(QpOutcome::Solved { x, iterations: it }) => {
                iterations += it;
                x
            }
            Ok(QpOutcome::TimedOut) => return Err(self.timeout(started)),
            Ok(QpOutcome::Infeasible) => {
                warn!(strategy = %self.settings.strategy, "strategy stage infeasible, using baseline");
                baseline
            }
            Err(e) => {
                warn!(error = %e, strategy = %self.settings.strategy, "strategy stage failed, using baseline");
                baseline
            }
        };
        if started.elapsed() > self.settings.time_budget {
            return Err(self.timeout(started));
        }

        let solution = Solution {
            values,
            dropped,
            iterations,
            elapsed: started.elapsed(),
        };
        self.log_solution(store, &solution);
        Ok(solution)
    }

    /// Records `values` as the last good point for every ESS `accepted`
    /// reports as written. Other ESS keep their previous point; ESS no
    /// longer in the topology are forgotten.
    pub fn commit(&mut self, store: &ConstraintStore, values: &[f64], accepted: impl Fn(&str) -> bool) {
        let topology = store.topology();
        self.last_good_point.retain(|(id, _, _), _| topology.get(id).is_some());
        for (index, key) in store.coefficients().iter() {
            if !accepted(key.ess_id) {
                continue;
            }
            if let Some(value) = values.get(index).filter(|v| v.is_finite()) {
                self.last_good_point
                    .insert((key.ess_id.to_string(), key.phase, key.pwr), *value);
            }
        }
    }

    pub fn last_good_point(&self, ess_id: &str, phase: Phase, pwr: Pwr) -> Option<f64> {
        self.last_good_point.get(&(ess_id.to_string(), phase, pwr)).copied()
    }

    pub fn clear_last_good_point(&mut self) {
        self.last_good_point.clear();
    }

    fn remaining(&self, started: Instant) -> PowerResult<Duration> {
        let elapsed = started.elapsed();
        if elapsed >= self.settings.time_budget {
            return Err(self.timeout(started));
        }
        Ok(self.settings.time_budget - elapsed)
    }

    fn timeout(&self, started: Instant) -> PowerError {
        PowerError::SolverTimeout {
            budget_ms: self.settings.time_budget.as_millis() as u64,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// `Σ x²/Smax` over leaf columns, which splits any total in proportion to
    /// the device ratings.
    fn baseline_objective(&self, store: &ConstraintStore) -> Objective {
        let coefficients = store.coefficients();
        let share = coefficients.phases().len() as f64;
        let mut objective = Objective::feasibility(coefficients.len());
        for (index, key) in coefficients.iter() {
            if let Some(ess) = store.topology().get(key.ess_id).filter(|e| e.is_leaf()) {
                objective.weights[index] = 1.0 / (ess.max_apparent_power / share).max(1.0);
            }
        }
        objective
    }

    fn strategy_objective(
        &self,
        store: &ConstraintStore,
        baseline: &[f64],
        bounds: &[(f64, f64)],
    ) -> PowerResult<Objective> {
        let topology = store.topology();
        let coefficients = store.coefficients();
        let share = coefficients.phases().len() as f64;
        let mut objective = Objective {
            weights: vec![0.0; coefficients.len()],
            reference: baseline.to_vec(),
        };

        for root in topology.roots() {
            let leaves = topology.leaves_of(&root.id);
            let max_apparent_power: Vec<f64> = leaves.iter().map(|l| l.max_apparent_power / share).collect();
            for phase in coefficients.phases() {
                let mut active_share: Option<(f64, Vec<f64>)> = None;
                for pwr in Pwr::BOTH {
                    let columns: Vec<usize> = leaves
                        .iter()
                        .map(|l| coefficients.of(&l.id, *phase, pwr))
                        .collect::<PowerResult<_>>()?;
                    let group_bounds: Vec<(f64, f64)> = columns.iter().map(|c| bounds[*c]).collect();
                    let total = baseline[coefficients.of(&root.id, *phase, pwr)?];

                    let allocation = match (pwr, &active_share) {
                        (Pwr::Reactive, Some((p_total, p_alloc))) if p_total.abs() > EPSILON => {
                            let shares = p_alloc.iter().map(|p| total * p / p_total).collect();
                            spread_residual(total, shares, &group_bounds)
                        }
                        _ => {
                            let soc: Vec<Option<f64>> = match pwr {
                                Pwr::Active => leaves.iter().map(|l| l.soc).collect(),
                                Pwr::Reactive => vec![None; leaves.len()],
                            };
                            let last: Vec<Option<f64>> = leaves
                                .iter()
                                .map(|l| self.last_good_point(&l.id, *phase, pwr))
                                .collect();
                            let last: Option<Vec<f64>> = last
                                .iter()
                                .any(Option::is_some)
                                .then(|| last.iter().map(|v| v.unwrap_or(0.0)).collect());
                            let input = GroupInput {
                                total,
                                bounds: &group_bounds,
                                soc: &soc,
                                max_apparent_power: &max_apparent_power,
                                last: last.as_deref(),
                            };
                            self.settings.strategy.allocate(&input, self.settings.approach_rate)
                        }
                    };
                    if pwr == Pwr::Active {
                        active_share = Some((total, allocation.clone()));
                    }
                    for ((column, value), smax) in columns.iter().zip(allocation).zip(&max_apparent_power) {
                        objective.reference[*column] = value;
                        objective.weights[*column] = 1.0 / smax.max(1.0).powi(2);
                    }
                }
            }
        }
        Ok(objective)
    }

    fn log_constraints(&self, store: &ConstraintStore) {
        let coefficients = store.coefficients();
        for constraint in store.constraints() {
            if self.settings.debug_mode {
                info!(constraint = %constraint.render(coefficients), "cycle constraint");
            } else {
                debug!(constraint = %constraint.render(coefficients), "cycle constraint");
            }
        }
    }

    fn log_solution(&self, store: &ConstraintStore, solution: &Solution) {
        let rendered = || {
            store
                .coefficients()
                .iter()
                .zip(&solution.values)
                .map(|((_, key), v)| format!("{}.{}{}={:.0}", key.ess_id, key.pwr.symbol(), key.phase, v))
                .join(" ")
        };
        let elapsed_ms = solution.elapsed.as_millis() as u64;
        if self.settings.debug_mode {
            info!(
                strategy = %self.settings.strategy,
                elapsed_ms,
                iterations = solution.iterations,
                dropped = solution.dropped.len(),
                solution = %rendered(),
                "solved"
            );
        } else {
            debug!(
                strategy = %self.settings.strategy,
                elapsed_ms,
                iterations = solution.iterations,
                dropped = solution.dropped.len(),
                solution = %rendered(),
                "solved"
            );
        }
    }
}

/// Relaxable constraints in drop order: lowest priority first, later
/// submissions first within a priority.
fn relax_order(submitted: &[Constraint]) -> Vec<usize> {
    submitted
        .iter()
        .enumerate()
        .filter_map(|(i, c)| c.priority.map(|p| (p, i)))
        .sorted_by_key(|(p, i)| (*p, Reverse(*i)))
        .map(|(_, i)| i)
        .collect()
}

fn active_constraints<'a>(store: &'a ConstraintStore, active: &[bool]) -> Vec<&'a Constraint> {
    store
        .generated()
        .iter()
        .chain(
            store
                .submitted()
                .iter()
                .zip(active)
                .filter(|(_, keep)| **keep)
                .map(|(c, _)| c),
        )
        .collect()
}

fn dropped_entry(index: usize, constraint: &Constraint) -> DroppedConstraint {
    let contributor = match &constraint.origin {
        ConstraintOrigin::Controller(id) => id.clone(),
        other => other.to_string(),
    };
    DroppedConstraint {
        id: ConstraintId(index),
        contributor,
        description: constraint.description.clone(),
        priority: constraint.priority.unwrap_or_default(),
    }
}

/// Per-column box used by the strategies: device limits split across phases,
/// narrowed by active single-column controller constraints.
fn column_bounds(store: &ConstraintStore, active: &[bool]) -> Vec<(f64, f64)> {
    let coefficients = store.coefficients();
    let share = coefficients.phases().len() as f64;
    let mut bounds = vec![(f64::NEG_INFINITY, f64::INFINITY); coefficients.len()];

    for (index, key) in coefficients.iter() {
        let Some(ess) = store.topology().get(key.ess_id).filter(|e| e.is_leaf()) else {
            continue;
        };
        bounds[index] = if !ess.is_controllable() {
            (0.0, 0.0)
        } else {
            let smax = ess.max_apparent_power / share;
            match key.pwr {
                Pwr::Active => (
                    (ess.allowed_charge_power / share).max(-smax),
                    (ess.allowed_discharge_power / share).min(smax),
                ),
                Pwr::Reactive => (-smax, smax),
            }
        };
    }

    let single_column = store
        .submitted()
        .iter()
        .zip(active)
        .filter(|(c, keep)| **keep && c.coefficients.len() == 1)
        .map(|(c, _)| c);
    for constraint in single_column {
        let term = constraint.coefficients[0];
        if term.value.abs() < EPSILON || term.index >= bounds.len() {
            continue;
        }
        let value = constraint.value / term.value;
        let relationship = match (constraint.relationship, term.value < 0.0) {
            (Relationship::Leq, true) => Relationship::Geq,
            (Relationship::Geq, true) => Relationship::Leq,
            (rel, _) => rel,
        };
        let (lower, upper) = &mut bounds[term.index];
        match relationship {
            Relationship::Eq => {
                *lower = lower.max(value);
                *upper = upper.min(value);
            }
            Relationship::Leq => *upper = upper.min(value),
            Relationship::Geq => *lower = lower.max(value),
        }
        if *lower > *upper {
            *upper = *lower;
        }
    }
    bounds
}
