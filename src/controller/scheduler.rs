use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::controller::{PidFilter, PidSettings};
use crate::domain::{Phase, Pwr, Relationship, Topology};
use crate::error::{PowerError, PowerResult};
use crate::hardware::EssWriter;
use crate::optimizer::{
    ConstraintId, ConstraintRequest, ConstraintStore, DroppedConstraint, EssSetpoint, MergedResult, ResultMerger,
    Solver, SolverSettings,
};

/// Cycle statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    /// Cycles that kept the previous set-points after an infeasible or timed out solve
    pub held_count: u64,
    pub dropped_constraint_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CycleOutcome {
    /// New set-points were dispatched.
    Applied,
    /// Solving failed recoverably; the previous set-points stay in force.
    Held { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub outcome: CycleOutcome,
    pub merged: Option<MergedResult>,
    pub dropped: Vec<DroppedConstraint>,
    /// Per-ESS write failures. Dispatch to the other ESS went ahead.
    pub apply_errors: Vec<PowerError>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn is_applied(&self) -> bool {
        self.outcome == CycleOutcome::Applied
    }
}

/// Handle of a static constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StaticConstraintId(u64);

/// Drives one cycle at a time: `initialize_cycle`, then controllers add
/// constraints, then `run_cycle` solves, merges and dispatches.
pub struct CycleScheduler<W: EssWriter> {
    solver: Solver,
    writer: W,
    pid: PidSettings,
    cycle: Option<ConstraintStore>,
    cycle_count: u64,
    status: CycleStatus,
    last_applied: IndexMap<String, EssSetpoint>,
    pid_filters: HashMap<String, PidFilter>,
    static_constraints: IndexMap<StaticConstraintId, ConstraintRequest>,
    next_static_id: u64,
}

impl<W: EssWriter> CycleScheduler<W> {
    pub fn new(settings: SolverSettings, pid: PidSettings, writer: W) -> Self {
        Self {
            solver: Solver::new(settings),
            writer,
            pid,
            cycle: None,
            cycle_count: 0,
            status: CycleStatus::default(),
            last_applied: IndexMap::new(),
            pid_filters: HashMap::new(),
            static_constraints: IndexMap::new(),
            next_static_id: 0,
        }
    }

    pub fn status(&self) -> &CycleStatus {
        &self.status
    }

    pub fn solver(&self) -> &Solver {
        &self.solver
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Set-points of the last successful dispatch per ESS.
    pub fn last_applied(&self) -> &IndexMap<String, EssSetpoint> {
        &self.last_applied
    }

    pub fn is_cycle_open(&self) -> bool {
        self.cycle.is_some()
    }

    /// The open cycle's constraint set.
    pub fn store(&self) -> PowerResult<&ConstraintStore> {
        self.cycle.as_ref().ok_or(PowerError::CycleNotOpen)
    }

    fn store_mut(&mut self) -> PowerResult<&mut ConstraintStore> {
        self.cycle.as_mut().ok_or(PowerError::CycleNotOpen)
    }

    /// Opens a new cycle on `topology`, discarding any constraints of a cycle
    /// that was never run, and re-submits the static constraints.
    pub fn initialize_cycle(&mut self, topology: Topology) -> PowerResult<()> {
        if self.cycle.is_some() {
            warn!(cycle = self.cycle_count + 1, "previous cycle was never run, discarding it");
        }
        let mut store = ConstraintStore::initialize_cycle(topology, self.solver.settings())?;
        for (id, request) in &self.static_constraints {
            if let Err(e) = store.add_constraint(request) {
                warn!(static_id = id.0, contributor = %request.contributor, error = %e, "skipping static constraint");
            }
        }
        self.pid_filters.retain(|ess_id, _| store.topology().get(ess_id).is_some());
        self.cycle = Some(store);
        Ok(())
    }

    pub fn add_constraint(&mut self, request: &ConstraintRequest) -> PowerResult<ConstraintId> {
        self.store_mut()?.add_constraint(request)
    }

    pub fn add_simple_constraint(
        &mut self,
        contributor: &str,
        ess_id: &str,
        phase: Phase,
        pwr: Pwr,
        relationship: Relationship,
        value: f64,
    ) -> PowerResult<ConstraintId> {
        self.store_mut()?
            .add_simple_constraint(contributor, ess_id, phase, pwr, relationship, value)
    }

    pub fn add_constraint_and_validate(&mut self, request: &ConstraintRequest) -> PowerResult<ConstraintId> {
        self.store_mut()?.add_constraint_and_validate(request)
    }

    pub fn min_power(&self, ess_id: &str, phase: Phase, pwr: Pwr) -> PowerResult<f64> {
        self.store()?.min_power(ess_id, phase, pwr)
    }

    pub fn max_power(&self, ess_id: &str, phase: Phase, pwr: Pwr) -> PowerResult<f64> {
        self.store()?.max_power(ess_id, phase, pwr)
    }

    pub fn set_active_power_equals(&mut self, contributor: &str, ess_id: &str, value: f64) -> PowerResult<ConstraintId> {
        self.store_mut()?.set_active_power_equals(contributor, ess_id, value)
    }

    /// Like [`CycleScheduler::set_active_power_equals`], but with the target
    /// smoothed by a per-ESS PID filter when PID assist is enabled.
    pub fn set_active_power_with_pid(&mut self, contributor: &str, ess_id: &str, target: f64) -> PowerResult<ConstraintId> {
        if !self.pid.enabled {
            return self.set_active_power_equals(contributor, ess_id, target);
        }
        let store = self.cycle.as_mut().ok_or(PowerError::CycleNotOpen)?;
        let min = store.min_power(ess_id, Phase::All, Pwr::Active)?;
        let max = store.max_power(ess_id, Phase::All, Pwr::Active)?;
        let input = store
            .topology()
            .get(ess_id)
            .and_then(|e| e.active_power)
            .or_else(|| self.last_applied.get(ess_id).map(|s| f64::from(s.active_power)))
            .unwrap_or(0.0);

        let pid = self.pid;
        let filter = self
            .pid_filters
            .entry(ess_id.to_string())
            .or_insert_with(|| PidFilter::from_settings(&pid));
        filter.set_limits(Some(min), Some(max));
        let output = filter.apply(input, target);
        debug!(ess_id, input, target, output, min, max, "pid filtered set-point");
        store.add_simple_constraint(contributor, ess_id, Phase::All, Pwr::Active, Relationship::Eq, output)
    }

    /// Registers a constraint that is re-submitted at every `initialize_cycle`.
    /// It applies from the next cycle on.
    pub fn add_static_constraint(&mut self, request: ConstraintRequest) -> StaticConstraintId {
        let id = StaticConstraintId(self.next_static_id);
        self.next_static_id += 1;
        info!(static_id = id.0, contributor = %request.contributor, description = %request.description, "static constraint added");
        self.static_constraints.insert(id, request);
        id
    }

    pub fn remove_static_constraint(&mut self, id: StaticConstraintId) -> bool {
        self.static_constraints.shift_remove(&id).is_some()
    }

    /// Forgets the last good point and all PID state.
    pub fn reset(&mut self) {
        self.solver.clear_last_good_point();
        self.pid_filters.clear();
    }

    /// Solves, merges and dispatches the open cycle, then closes it.
    ///
    /// Infeasible, timed out and numerically failed solves are held: nothing
    /// is dispatched and the previous set-points stay in force. Only
    /// non-recoverable errors are returned.
    pub fn run_cycle(&mut self) -> PowerResult<CycleReport> {
        let store = self.cycle.take().ok_or(PowerError::CycleNotOpen)?;
        let started = Instant::now();
        self.cycle_count += 1;
        let now = Utc::now();
        self.status.last_run = Some(now);
        self.status.run_count += 1;

        let solution = match self.solver.solve(&store) {
            Ok(solution) => solution,
            Err(e) if e.is_recoverable() => {
                if let PowerError::InfeasibleConstraintSet { dropped } = &e {
                    self.status.dropped_constraint_count += dropped.len() as u64;
                }
                self.status.held_count += 1;
                self.status.last_error = Some(e.to_string());
                warn!(cycle = self.cycle_count, error = %e, held = self.last_applied.len(), "cycle held, keeping last set-points");
                return Ok(CycleReport {
                    cycle: self.cycle_count,
                    outcome: CycleOutcome::Held { reason: e.to_string() },
                    merged: None,
                    dropped: match e {
                        PowerError::InfeasibleConstraintSet { dropped } => dropped,
                        _ => Vec::new(),
                    },
                    apply_errors: Vec::new(),
                    elapsed: started.elapsed(),
                });
            }
            Err(e) => {
                self.status.last_error = Some(e.to_string());
                error!(cycle = self.cycle_count, error = %e, "cycle failed");
                return Err(e);
            }
        };

        let merged = ResultMerger::new(&store).merge(&solution.values);
        if !merged.failed_indices.is_empty() {
            warn!(cycle = self.cycle_count, failed = ?merged.failed_indices, "solution columns could not be merged");
        }
        let apply_errors = self.dispatch(&store, &merged);
        let failed: Vec<&str> = apply_errors
            .iter()
            .filter_map(|e| match e {
                PowerError::HardwareApply { ess_id, .. } => Some(ess_id.as_str()),
                _ => None,
            })
            .collect();
        self.solver
            .commit(&store, &solution.values, |id| !failed.iter().any(|f| *f == id));

        self.status.last_success = Some(now);
        self.status.success_count += 1;
        self.status.dropped_constraint_count += solution.dropped.len() as u64;
        self.status.last_error = apply_errors.first().map(ToString::to_string);

        let elapsed = started.elapsed();
        info!(
            cycle = self.cycle_count,
            elapsed_ms = elapsed.as_millis() as u64,
            solve_ms = solution.elapsed.as_millis() as u64,
            dropped = solution.dropped.len(),
            apply_errors = apply_errors.len(),
            "cycle applied"
        );
        let report = CycleReport {
            cycle: self.cycle_count,
            outcome: CycleOutcome::Applied,
            merged: Some(merged),
            dropped: solution.dropped,
            apply_errors,
            elapsed,
        };
        if self.solver.settings().debug_mode {
            match serde_json::to_string(&report) {
                Ok(json) => info!(cycle = self.cycle_count, report = %json, "cycle report"),
                Err(e) => warn!(cycle = self.cycle_count, error = %e, "failed to serialize cycle report"),
            }
        }
        Ok(report)
    }

    /// Writes every managed leaf's set-point. A failed write is recorded and
    /// does not stop the others.
    fn dispatch(&mut self, store: &ConstraintStore, merged: &MergedResult) -> Vec<PowerError> {
        let asymmetric_mode = !store.coefficients().is_symmetric_mode();
        let mut errors = Vec::new();
        for ess in store.topology().leaves().filter(|e| e.is_managed()) {
            let Some(setpoint) = merged.get(&ess.id) else {
                continue;
            };
            let result = if asymmetric_mode && ess.is_asymmetric() {
                self.writer.apply_power_asymmetric(&ess.id, setpoint.phases)
            } else {
                self.writer
                    .apply_power(&ess.id, setpoint.active_power, setpoint.reactive_power)
            };
            match result {
                Ok(()) => {
                    self.last_applied.insert(ess.id.clone(), setpoint.clone());
                }
                Err(e) => {
                    let e = match e {
                        PowerError::HardwareApply { .. } => e,
                        other => PowerError::HardwareApply {
                            ess_id: ess.id.clone(),
                            reason: other.to_string(),
                        },
                    };
                    error!(ess_id = %ess.id, error = %e, "apply power failed");
                    errors.push(e);
                }
            }
        }
        errors
    }
}
