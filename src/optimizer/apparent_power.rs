//! Linear approximation of the apparent power limit `P² + Q² <= Smax²`.
//!
//! The disc is replaced by a regular 2N-gon inscribed in it. Vertices sit on
//! the circle at multiples of π/N, so the pure active and pure reactive
//! limits are exact and every point of the polygon is inside the disc.

use std::f64::consts::PI;

use crate::domain::Relationship;
use crate::optimizer::{Constraint, ConstraintOrigin, LinearCoefficient};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApparentPowerPolygon {
    pub max_apparent_power: f64,
    /// Half the number of edges.
    pub resolution: usize,
}

impl ApparentPowerPolygon {
    pub const MIN_RESOLUTION: usize = 4;

    pub fn new(max_apparent_power: f64, power_precision: f64, max_resolution: usize) -> Self {
        Self {
            max_apparent_power,
            resolution: Self::resolution_for(max_apparent_power, power_precision, max_resolution),
        }
    }

    /// Smallest N whose radial gap `Smax·(1 − cos(π/2N))` is below the
    /// device precision, bounded to `[MIN_RESOLUTION, max_resolution]`.
    pub fn resolution_for(max_apparent_power: f64, power_precision: f64, max_resolution: usize) -> usize {
        let upper = max_resolution.max(Self::MIN_RESOLUTION);
        let tolerance = power_precision.max(1.0);
        if max_apparent_power <= tolerance {
            return Self::MIN_RESOLUTION;
        }
        let half_angle = (1.0 - tolerance / max_apparent_power).acos();
        let needed = (PI / (2.0 * half_angle)).ceil();
        if !needed.is_finite() {
            return upper;
        }
        (needed as usize).clamp(Self::MIN_RESOLUTION, upper)
    }

    /// Distance from the origin to every edge.
    pub fn apothem(&self) -> f64 {
        self.max_apparent_power * (PI / (2 * self.resolution) as f64).cos()
    }

    /// Edge normals `(cos φ, sin φ)` with the common right-hand side.
    pub fn edges(&self) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
        let n = self.resolution;
        let rhs = self.apothem();
        (0..2 * n).map(move |k| {
            let phi = (2 * k + 1) as f64 * PI / (2 * n) as f64;
            (snap(phi.cos()), snap(phi.sin()), rhs)
        })
    }

    pub fn vertices(&self) -> Vec<(f64, f64)> {
        let n = self.resolution;
        (0..2 * n)
            .map(|j| {
                let theta = j as f64 * PI / n as f64;
                (
                    self.max_apparent_power * snap(theta.cos()),
                    self.max_apparent_power * snap(theta.sin()),
                )
            })
            .collect()
    }

    pub fn contains(&self, p: f64, q: f64, tolerance: f64) -> bool {
        if self.max_apparent_power <= 0.0 {
            return p.abs() <= tolerance && q.abs() <= tolerance;
        }
        self.edges().all(|(c, s, rhs)| p * c + q * s <= rhs + tolerance)
    }

    /// Constraints over the active column `p` and reactive column `q`.
    pub fn constraints(&self, label: &str, p: usize, q: usize) -> Vec<Constraint> {
        if self.max_apparent_power <= 0.0 {
            return vec![
                Constraint::new(
                    format!("{} no active power", label),
                    vec![LinearCoefficient { index: p, value: 1.0 }],
                    Relationship::Eq,
                    0.0,
                    ConstraintOrigin::ApparentPower,
                ),
                Constraint::new(
                    format!("{} no reactive power", label),
                    vec![LinearCoefficient { index: q, value: 1.0 }],
                    Relationship::Eq,
                    0.0,
                    ConstraintOrigin::ApparentPower,
                ),
            ];
        }

        self.edges()
            .enumerate()
            .map(|(k, (c, s, rhs))| {
                let coefficients = [(p, c), (q, s)]
                    .into_iter()
                    .filter(|(_, v)| *v != 0.0)
                    .map(|(index, value)| LinearCoefficient { index, value })
                    .collect();
                Constraint::new(
                    format!("{} apparent power edge {}", label, k),
                    coefficients,
                    Relationship::Leq,
                    rhs,
                    ConstraintOrigin::ApparentPower,
                )
            })
            .collect()
    }
}

fn snap(v: f64) -> f64 {
    if v.abs() < 1e-12 {
        0.0
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_resolution_is_deterministic_and_bounded() {
        assert_eq!(ApparentPowerPolygon::resolution_for(92000.0, 1.0, 32), 32);
        assert_eq!(ApparentPowerPolygon::resolution_for(12000.0, 100.0, 32), 13);
        assert_eq!(ApparentPowerPolygon::resolution_for(50.0, 100.0, 32), 4);
        assert_eq!(
            ApparentPowerPolygon::resolution_for(12000.0, 100.0, 32),
            ApparentPowerPolygon::resolution_for(12000.0, 100.0, 32)
        );
    }

    #[test]
    fn test_vertices_lie_on_circle_and_axes() {
        let polygon = ApparentPowerPolygon::new(10000.0, 1.0, 8);
        let vertices = polygon.vertices();
        assert_eq!(vertices.len(), 16);
        assert_eq!(vertices[0], (10000.0, 0.0));
        assert!(vertices.iter().any(|(p, q)| *p == 0.0 && *q == 10000.0));
        for (p, q) in &vertices {
            assert!(((p * p + q * q).sqrt() - 10000.0).abs() < 1e-6);
            assert!(polygon.contains(*p, *q, 1e-6));
        }
    }

    #[test]
    fn test_constraint_count_and_pure_active_limit() {
        let polygon = ApparentPowerPolygon::new(12000.0, 1.0, 8);
        let constraints = polygon.constraints("ess0", 0, 1);
        assert_eq!(constraints.len(), 16);
        assert!(constraints.iter().all(|c| c.is_satisfied_by(&[12000.0, 0.0], 1e-6)));
        assert!(!constraints.iter().all(|c| c.is_satisfied_by(&[12001.0, 0.0], 1e-6)));
    }

    #[test]
    fn test_zero_rating_pins_to_origin() {
        let polygon = ApparentPowerPolygon::new(0.0, 1.0, 8);
        let constraints = polygon.constraints("ess0", 4, 5);
        assert_eq!(constraints.len(), 2);
        assert!(constraints.iter().all(|c| c.relationship == Relationship::Eq));
        assert!(polygon.contains(0.0, 0.0, 0.0));
        assert!(!polygon.contains(1.0, 0.0, 0.0));
    }

    proptest! {
        #[test]
        fn prop_polygon_is_inscribed(
            smax in 1.0f64..200_000.0,
            resolution in 4usize..64,
            angle in 0.0f64..(2.0 * PI),
        ) {
            let polygon = ApparentPowerPolygon { max_apparent_power: smax, resolution };
            // Furthest point along `angle` allowed by the edges.
            let (dx, dy) = (angle.cos(), angle.sin());
            let reach = polygon
                .edges()
                .filter_map(|(c, s, rhs)| {
                    let dot = dx * c + dy * s;
                    (dot > 1e-12).then(|| rhs / dot)
                })
                .fold(f64::INFINITY, f64::min);
            prop_assert!(reach <= smax * (1.0 + 1e-9));
            prop_assert!(reach >= polygon.apothem() * (1.0 - 1e-9));
        }
    }
}
