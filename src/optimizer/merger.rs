//! Maps a solved vector back onto per-ESS set-points.
//!
//! Leaves are rounded to their power precision. Whatever the rounding took
//! off a cluster total is handed back to the leaves that lost it, as far as
//! their limits allow, so cluster totals survive rounding. Clusters are the
//! sum of their rounded leaves. In symmetric mode the phase view of a
//! set-point is one third of the total on every phase.

use std::cmp::Reverse;

use indexmap::IndexMap;
use serde::Serialize;

use crate::domain::{EssDescriptor, Pwr, Topology};
use crate::optimizer::{ApparentPowerPolygon, Coefficients, ConstraintStore};

/// Distance (W) below which a value counts as already on the precision grid.
const SNAP_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PhaseSetpoint {
    pub active_power: f64,
    pub reactive_power: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EssSetpoint {
    pub ess_id: String,
    pub active_power: i32,
    pub reactive_power: i32,
    /// L1, L2, L3.
    pub phases: [PhaseSetpoint; 3],
    pub symmetric: bool,
}

impl EssSetpoint {
    fn zero(ess_id: &str, symmetric: bool) -> Self {
        Self {
            ess_id: ess_id.to_string(),
            active_power: 0,
            reactive_power: 0,
            phases: [PhaseSetpoint::default(); 3],
            symmetric,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergedResult {
    /// Leaves and clusters in snapshot order.
    pub setpoints: IndexMap<String, EssSetpoint>,
    /// Solution columns that were missing or not finite. The owning ESS has
    /// no set-point.
    pub failed_indices: Vec<usize>,
}

impl MergedResult {
    pub fn get(&self, ess_id: &str) -> Option<&EssSetpoint> {
        self.setpoints.get(ess_id)
    }
}

/// Rounded `[p, q]` per phase column of one leaf, next to the solver values.
#[derive(Debug, Clone)]
struct LeafDraft {
    rounded: Vec<[f64; 2]>,
    raw: Vec<[f64; 2]>,
}

pub struct ResultMerger<'a> {
    store: &'a ConstraintStore,
}

impl<'a> ResultMerger<'a> {
    pub fn new(store: &'a ConstraintStore) -> Self {
        Self { store }
    }

    pub fn merge(&self, values: &[f64]) -> MergedResult {
        let topology = self.store.topology();
        let coefficients = self.store.coefficients();
        let symmetric_mode = coefficients.is_symmetric_mode();
        let mut merged = MergedResult::default();

        for (index, _) in coefficients.iter() {
            if !values.get(index).is_some_and(|v| v.is_finite()) {
                merged.failed_indices.push(index);
            }
        }

        let mut drafts = IndexMap::new();
        for ess in topology.leaves() {
            let columns = match ess_columns(coefficients, &ess.id) {
                Some(columns) if columns.iter().all(|c| !merged.failed_indices.contains(c)) => columns,
                _ => continue,
            };
            let raw: Vec<[f64; 2]> = columns.chunks(2).map(|pq| [values[pq[0]], values[pq[1]]]).collect();
            let rounded = if !ess.is_controllable() {
                vec![[0.0, 0.0]; raw.len()]
            } else if symmetric_mode {
                vec![self.symmetric_leaf(ess, raw[0][0], raw[0][1])]
            } else {
                self.asymmetric_leaf(ess, &raw)
            };
            drafts.insert(ess.id.clone(), LeafDraft { rounded, raw });
        }
        self.settle_cluster_totals(values, &mut drafts);

        for ess in topology.iter() {
            if ess.is_leaf() {
                if let Some(draft) = drafts.get(&ess.id) {
                    merged
                        .setpoints
                        .insert(ess.id.clone(), leaf_setpoint(&ess.id, &draft.rounded, symmetric_mode));
                }
                continue;
            }
            let members: Vec<EssSetpoint> = topology
                .leaves_of(&ess.id)
                .iter()
                .filter_map(|leaf| drafts.get(&leaf.id).map(|d| leaf_setpoint(&leaf.id, &d.rounded, symmetric_mode)))
                .collect();
            merged
                .setpoints
                .insert(ess.id.clone(), sum_of(&ess.id, &members, symmetric_mode));
        }
        merged
    }

    fn polygon(&self, ess: &EssDescriptor) -> ApparentPowerPolygon {
        let share = if self.store.coefficients().is_symmetric_mode() { 1.0 } else { 3.0 };
        ApparentPowerPolygon::new(
            ess.max_apparent_power / share,
            ess.power_precision,
            self.store.max_polygon_resolution(),
        )
    }

    fn symmetric_leaf(&self, ess: &EssDescriptor, p: f64, q: f64) -> [f64; 2] {
        let polygon = self.polygon(ess);
        let q = round_setpoint(q, ess.power_precision, None, |_| true);
        let p = round_setpoint(p, ess.power_precision, ess.soc, |p| {
            within(p, ess.allowed_charge_power, ess.allowed_discharge_power)
                && polygon.contains(p, q, SNAP_TOLERANCE)
        });
        [clamp_to_bounds(p, ess.allowed_charge_power, ess.allowed_discharge_power), q]
    }

    fn asymmetric_leaf(&self, ess: &EssDescriptor, raw: &[[f64; 2]]) -> Vec<[f64; 2]> {
        let polygon = self.polygon(ess);
        let mut phases: Vec<[f64; 2]> = raw
            .iter()
            .map(|[p, q]| {
                let q = round_setpoint(*q, ess.power_precision, None, |_| true);
                let p = round_setpoint(*p, ess.power_precision, ess.soc, |p| polygon.contains(p, q, SNAP_TOLERANCE));
                [p, q]
            })
            .collect();
        let total: f64 = phases.iter().map(|pq| pq[0]).sum();
        if !within(total, ess.allowed_charge_power, ess.allowed_discharge_power) {
            for (phase, [p, _]) in phases.iter_mut().zip(raw) {
                phase[0] = round_setpoint(*p, ess.power_precision, None, |_| true);
            }
        }
        phases
    }

    /// True when `rounded` respects the leaf's limits and apparent power.
    fn fits(&self, ess: &EssDescriptor, rounded: &[[f64; 2]]) -> bool {
        let polygon = self.polygon(ess);
        let total: f64 = rounded.iter().map(|pq| pq[0]).sum();
        within(total, ess.allowed_charge_power, ess.allowed_discharge_power)
            && rounded.iter().all(|[p, q]| polygon.contains(*p, *q, SNAP_TOLERANCE))
    }

    /// Deepest clusters first, so an outer cluster sees settled inner ones.
    fn settle_cluster_totals(&self, values: &[f64], drafts: &mut IndexMap<String, LeafDraft>) {
        let topology = self.store.topology();
        let coefficients = self.store.coefficients();
        let mut clusters: Vec<&EssDescriptor> = topology.clusters().collect();
        clusters.sort_by_key(|c| Reverse(depth(topology, &c.id)));

        for cluster in clusters {
            let leaves = topology.leaves_of(&cluster.id);
            if leaves.iter().any(|l| !drafts.contains_key(&l.id)) {
                continue;
            }
            for (phase, phase_id) in coefficients.phases().iter().enumerate() {
                for (slot, pwr) in Pwr::BOTH.into_iter().enumerate() {
                    let total = coefficients
                        .of(&cluster.id, *phase_id, pwr)
                        .ok()
                        .and_then(|c| values.get(c))
                        .filter(|v| v.is_finite());
                    if let Some(total) = total {
                        self.settle(&cluster.id, &leaves, (phase, slot), total.round(), drafts);
                    }
                }
            }
        }
    }

    /// Steps leaves that were rounded away from `desired` back toward it, one
    /// precision step each, direct children and the largest losses first.
    fn settle(
        &self,
        cluster_id: &str,
        leaves: &[&EssDescriptor],
        (phase, slot): (usize, usize),
        desired: f64,
        drafts: &mut IndexMap<String, LeafDraft>,
    ) {
        let topology = self.store.topology();
        let symmetric_mode = self.store.coefficients().is_symmetric_mode();
        let mut residual = desired
            - leaves
                .iter()
                .filter_map(|l| drafts.get(&l.id))
                .map(|d| d.rounded[phase][slot])
                .sum::<f64>();
        if residual.abs() < SNAP_TOLERANCE {
            return;
        }
        let direction = residual.signum();

        let mut candidates: Vec<(bool, f64, usize, &EssDescriptor)> = leaves
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_controllable() && (symmetric_mode || l.is_asymmetric()))
            .filter_map(|(i, l)| {
                let draft = drafts.get(&l.id)?;
                let loss = (draft.raw[phase][slot] - draft.rounded[phase][slot]) * direction;
                let direct = topology.parent_of(&l.id) == Some(cluster_id);
                (loss > SNAP_TOLERANCE).then_some((direct, loss, i, *l))
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.total_cmp(&a.1)).then(a.2.cmp(&b.2)));

        for (_, _, _, leaf) in candidates {
            let step = if leaf.power_precision > 0.0 { leaf.power_precision } else { 1.0 };
            if residual * direction <= step / 2.0 {
                continue;
            }
            let Some(draft) = drafts.get_mut(&leaf.id) else {
                continue;
            };
            let mut next = draft.rounded.clone();
            next[phase][slot] += step * direction;
            if self.fits(leaf, &next) {
                draft.rounded = next;
                residual -= step * direction;
            }
        }
    }
}

fn leaf_setpoint(ess_id: &str, rounded: &[[f64; 2]], symmetric_mode: bool) -> EssSetpoint {
    if symmetric_mode {
        let [p, q] = rounded.first().copied().unwrap_or_default();
        let (active_power, reactive_power) = (p.round() as i32, q.round() as i32);
        let third = PhaseSetpoint {
            active_power: f64::from(active_power) / 3.0,
            reactive_power: f64::from(reactive_power) / 3.0,
        };
        return EssSetpoint {
            ess_id: ess_id.to_string(),
            active_power,
            reactive_power,
            phases: [third; 3],
            symmetric: true,
        };
    }
    let mut setpoint = EssSetpoint::zero(ess_id, false);
    for (phase, [p, q]) in setpoint.phases.iter_mut().zip(rounded) {
        phase.active_power = *p;
        phase.reactive_power = *q;
    }
    setpoint.active_power = setpoint.phases.iter().map(|p| p.active_power).sum::<f64>().round() as i32;
    setpoint.reactive_power = setpoint.phases.iter().map(|p| p.reactive_power).sum::<f64>().round() as i32;
    setpoint
}

/// Number of clusters above `id`.
fn depth(topology: &Topology, id: &str) -> usize {
    std::iter::successors(topology.parent_of(id), |p| topology.parent_of(p))
        .take(topology.len())
        .count()
}

/// Active and reactive column of every phase of `ess_id`, in phase order.
fn ess_columns(coefficients: &Coefficients, ess_id: &str) -> Option<Vec<usize>> {
    let mut columns = Vec::new();
    for phase in coefficients.phases() {
        for pwr in Pwr::BOTH {
            columns.push(coefficients.of(ess_id, *phase, pwr).ok()?);
        }
    }
    Some(columns)
}

fn sum_of(ess_id: &str, members: &[EssSetpoint], symmetric: bool) -> EssSetpoint {
    let mut sum = EssSetpoint::zero(ess_id, symmetric);
    for member in members {
        sum.active_power += member.active_power;
        sum.reactive_power += member.reactive_power;
        for (total, phase) in sum.phases.iter_mut().zip(&member.phases) {
            total.active_power += phase.active_power;
            total.reactive_power += phase.reactive_power;
        }
    }
    sum
}

fn within(value: f64, lower: f64, upper: f64) -> bool {
    value >= lower - SNAP_TOLERANCE && value <= upper + SNAP_TOLERANCE
}

fn clamp_to_bounds(value: f64, lower: f64, upper: f64) -> f64 {
    if lower > upper {
        return value;
    }
    value.min(upper).max(lower)
}

/// Rounds `value` onto the `precision` grid.
///
/// Off-grid values round in the direction that moves SoC toward 50 %
/// (discharge with SoC above 50 rounds up, charge with SoC below 50 rounds
/// toward more charge) as long as `fits` accepts the result; otherwise, and
/// without SoC, they round toward zero.
pub fn round_setpoint(value: f64, precision: f64, soc: Option<f64>, fits: impl Fn(f64) -> bool) -> f64 {
    let precision = if precision > 0.0 { precision } else { 1.0 };
    let steps = value / precision;
    let nearest = steps.round();
    if (steps - nearest).abs() * precision < SNAP_TOLERANCE {
        return nearest * precision;
    }

    let toward_zero = steps.trunc() * precision;
    let preferred = match soc {
        Some(soc) if value > 0.0 && soc > 50.0 => steps.ceil() * precision,
        Some(soc) if value < 0.0 && soc < 50.0 => steps.floor() * precision,
        _ => toward_zero,
    };
    if preferred != toward_zero && fits(preferred) {
        preferred
    } else {
        toward_zero
    }
}
