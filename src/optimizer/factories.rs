//! Constraints generated from the topology snapshot at cycle start.

use crate::domain::{EssDescriptor, Phase, Pwr, Relationship, Topology};
use crate::error::PowerResult;
use crate::optimizer::{ApparentPowerPolygon, Coefficients, Constraint, ConstraintOrigin, LinearCoefficient};

/// `Σ children − cluster = 0` for every cluster, phase column and power type.
pub fn cluster_flow_constraints(topology: &Topology, coefficients: &Coefficients) -> PowerResult<Vec<Constraint>> {
    let mut constraints = Vec::new();
    for cluster in topology.clusters() {
        for phase in coefficients.phases() {
            for pwr in Pwr::BOTH {
                let mut terms = Vec::with_capacity(cluster.children.len() + 1);
                for child in &cluster.children {
                    terms.push(LinearCoefficient {
                        index: coefficients.of(child, *phase, pwr)?,
                        value: 1.0,
                    });
                }
                terms.push(LinearCoefficient {
                    index: coefficients.of(&cluster.id, *phase, pwr)?,
                    value: -1.0,
                });
                constraints.push(Constraint::new(
                    format!("{} {}{} = sum of children", cluster.id, pwr.symbol(), phase),
                    terms,
                    Relationship::Eq,
                    0.0,
                    ConstraintOrigin::ClusterFlow,
                ));
            }
        }
    }
    Ok(constraints)
}

/// Physical limits of every leaf: charge/discharge bounds, apparent power
/// polygon, phase coupling for symmetric-only devices, and zero pins for
/// faulted or unmanaged devices.
pub fn device_limit_constraints(
    topology: &Topology,
    coefficients: &Coefficients,
    max_polygon_resolution: usize,
) -> PowerResult<Vec<Constraint>> {
    let mut constraints = Vec::new();
    for ess in topology.leaves() {
        if !ess.is_controllable() {
            constraints.extend(zero_pins(ess, coefficients)?);
            continue;
        }
        constraints.extend(active_bounds(ess, coefficients)?);
        constraints.extend(polygons(ess, coefficients, max_polygon_resolution)?);
        if !coefficients.is_symmetric_mode() && !ess.is_asymmetric() {
            constraints.extend(balanced_phases(ess, coefficients)?);
        }
    }
    Ok(constraints)
}

fn zero_pins(ess: &EssDescriptor, coefficients: &Coefficients) -> PowerResult<Vec<Constraint>> {
    let reason = if ess.faulted { "faulted" } else { "not managed" };
    let mut constraints = Vec::new();
    for phase in coefficients.phases() {
        for pwr in Pwr::BOTH {
            constraints.push(Constraint::new(
                format!("{} {}: {}{} = 0", ess.id, reason, pwr.symbol(), phase),
                vec![LinearCoefficient {
                    index: coefficients.of(&ess.id, *phase, pwr)?,
                    value: 1.0,
                }],
                Relationship::Eq,
                0.0,
                ConstraintOrigin::Fault,
            ));
        }
    }
    Ok(constraints)
}

fn active_bounds(ess: &EssDescriptor, coefficients: &Coefficients) -> PowerResult<Vec<Constraint>> {
    let terms: Vec<_> = coefficients
        .columns_of(&ess.id, Pwr::Active)?
        .into_iter()
        .map(|index| LinearCoefficient { index, value: 1.0 })
        .collect();
    Ok(vec![
        Constraint::new(
            format!("{} allowed charge power", ess.id),
            terms.clone(),
            Relationship::Geq,
            ess.allowed_charge_power,
            ConstraintOrigin::DeviceLimit,
        ),
        Constraint::new(
            format!("{} allowed discharge power", ess.id),
            terms,
            Relationship::Leq,
            ess.allowed_discharge_power,
            ConstraintOrigin::DeviceLimit,
        ),
    ])
}

fn polygons(ess: &EssDescriptor, coefficients: &Coefficients, max_resolution: usize) -> PowerResult<Vec<Constraint>> {
    let share = coefficients.phases().len() as f64;
    let polygon = ApparentPowerPolygon::new(ess.max_apparent_power / share, ess.power_precision, max_resolution);
    let mut constraints = Vec::new();
    for phase in coefficients.phases() {
        let p = coefficients.of(&ess.id, *phase, Pwr::Active)?;
        let q = coefficients.of(&ess.id, *phase, Pwr::Reactive)?;
        constraints.extend(polygon.constraints(&format!("{} {}", ess.id, phase), p, q));
    }
    Ok(constraints)
}

fn balanced_phases(ess: &EssDescriptor, coefficients: &Coefficients) -> PowerResult<Vec<Constraint>> {
    let mut constraints = Vec::new();
    for pwr in Pwr::BOTH {
        for pair in [[Phase::L1, Phase::L2], [Phase::L2, Phase::L3]] {
            constraints.push(Constraint::new(
                format!("{} symmetric {} {} = {}", ess.id, pwr.symbol(), pair[0], pair[1]),
                vec![
                    LinearCoefficient {
                        index: coefficients.of(&ess.id, pair[0], pwr)?,
                        value: 1.0,
                    },
                    LinearCoefficient {
                        index: coefficients.of(&ess.id, pair[1], pwr)?,
                        value: -1.0,
                    },
                ],
                Relationship::Eq,
                0.0,
                ConstraintOrigin::DeviceLimit,
            ));
        }
    }
    Ok(constraints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EssDescriptor;

    fn topology() -> Topology {
        Topology::new(vec![
            EssDescriptor::cluster("c0", ["ess0", "ess1"]),
            EssDescriptor::leaf("ess0").with_limits(-3000.0, 4000.0, 5000.0),
            EssDescriptor::leaf("ess1").with_limits(-3000.0, 4000.0, 5000.0).faulted(),
        ])
        .unwrap()
    }

    #[test]
    fn test_cluster_flow_symmetric() {
        let topology = topology();
        let coefficients = Coefficients::new(&topology, true);
        let constraints = cluster_flow_constraints(&topology, &coefficients).unwrap();
        assert_eq!(constraints.len(), 2);
        // c0 = 0 + 0, ess0.p = 100, ess1.p = -100
        let x = [0.0, 0.0, 100.0, 0.0, -100.0, 0.0];
        assert!(constraints.iter().all(|c| c.is_satisfied_by(&x, 1e-9)));
        let broken = [10.0, 0.0, 100.0, 0.0, -100.0, 0.0];
        assert!(!constraints[0].is_satisfied_by(&broken, 1e-9));
    }

    #[test]
    fn test_cluster_flow_asymmetric_has_one_row_per_phase() {
        let topology = topology();
        let coefficients = Coefficients::new(&topology, false);
        assert_eq!(cluster_flow_constraints(&topology, &coefficients).unwrap().len(), 6);
    }

    #[test]
    fn test_faulted_leaf_is_pinned() {
        let topology = topology();
        let coefficients = Coefficients::new(&topology, true);
        let constraints = device_limit_constraints(&topology, &coefficients, 8).unwrap();
        let pins: Vec<_> = constraints.iter().filter(|c| c.origin == ConstraintOrigin::Fault).collect();
        assert_eq!(pins.len(), 2);
        assert!(pins.iter().all(|c| c.coefficients[0].index >= 4));
    }

    #[test]
    fn test_active_bounds_and_polygon() {
        let topology = topology();
        let coefficients = Coefficients::new(&topology, true);
        let constraints = device_limit_constraints(&topology, &coefficients, 8).unwrap();
        let ess0: Vec<_> = constraints
            .iter()
            .filter(|c| c.origin != ConstraintOrigin::Fault)
            .collect();
        // two bounds plus a 16-gon
        assert_eq!(ess0.len(), 18);
        let inside = [0.0, 0.0, 4000.0, 0.0, 0.0, 0.0];
        assert!(ess0.iter().all(|c| c.is_satisfied_by(&inside, 1e-6)));
        let too_much = [0.0, 0.0, 4500.0, 0.0, 0.0, 0.0];
        assert!(!ess0.iter().all(|c| c.is_satisfied_by(&too_much, 1e-6)));
        let over_rating = [0.0, 0.0, 0.0, 5001.0, 0.0, 0.0];
        assert!(!ess0.iter().all(|c| c.is_satisfied_by(&over_rating, 1e-6)));
    }

    #[test]
    fn test_symmetric_only_leaf_in_asymmetric_mode_is_balanced() {
        let topology = Topology::new(vec![EssDescriptor::leaf("ess0").with_limits(-3000.0, 3000.0, 3000.0)]).unwrap();
        let coefficients = Coefficients::new(&topology, false);
        let constraints = device_limit_constraints(&topology, &coefficients, 4).unwrap();
        let coupling = constraints
            .iter()
            .filter(|c| c.origin == ConstraintOrigin::DeviceLimit && c.relationship == Relationship::Eq)
            .count();
        assert_eq!(coupling, 4);

        let asymmetric = Topology::new(vec![EssDescriptor::leaf("ess0")
            .with_limits(-3000.0, 3000.0, 3000.0)
            .asymmetric()])
        .unwrap();
        let coefficients = Coefficients::new(&asymmetric, false);
        let constraints = device_limit_constraints(&asymmetric, &coefficients, 4).unwrap();
        assert!(constraints.iter().all(|c| c.relationship != Relationship::Eq));
    }
}
