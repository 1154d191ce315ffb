//! Column index of the solver vector.
//!
//! Every ESS in the snapshot (leaves and clusters) owns one column per
//! phase and power type. Columns are laid out ESS-major in snapshot order,
//! then by phase, then active before reactive, so identical topologies always
//! produce identical vectors.

use indexmap::IndexSet;

use crate::domain::{Phase, Pwr, Topology};
use crate::error::{PowerError, PowerResult};
use crate::optimizer::LinearCoefficient;

#[derive(Debug, Clone, PartialEq)]
pub struct Coefficients {
    symmetric_mode: bool,
    ess_ids: IndexSet<String>,
}

/// Identity of one solver column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableKey<'a> {
    pub ess_id: &'a str,
    pub phase: Phase,
    pub pwr: Pwr,
}

impl Coefficients {
    pub fn new(topology: &Topology, symmetric_mode: bool) -> Self {
        Self {
            symmetric_mode,
            ess_ids: topology.iter().map(|e| e.id.clone()).collect(),
        }
    }

    pub fn is_symmetric_mode(&self) -> bool {
        self.symmetric_mode
    }

    pub fn phases(&self) -> &'static [Phase] {
        Phase::columns(self.symmetric_mode)
    }

    fn columns_per_ess(&self) -> usize {
        self.phases().len() * Pwr::BOTH.len()
    }

    pub fn len(&self) -> usize {
        self.ess_ids.len() * self.columns_per_ess()
    }

    pub fn is_empty(&self) -> bool {
        self.ess_ids.is_empty()
    }

    /// Column of `(ess_id, phase, pwr)`.
    ///
    /// Fails for unknown ESS ids and for phases that have no column in the
    /// current mode.
    pub fn of(&self, ess_id: &str, phase: Phase, pwr: Pwr) -> PowerResult<usize> {
        let ess = self
            .ess_ids
            .get_index_of(ess_id)
            .ok_or_else(|| PowerError::configuration(format!("unknown ESS {}", ess_id)))?;
        let phase_offset = self.phases().iter().position(|p| *p == phase).ok_or_else(|| {
            PowerError::configuration(format!(
                "phase {} has no column in {} mode",
                phase,
                if self.symmetric_mode { "symmetric" } else { "asymmetric" }
            ))
        })?;
        let pwr_offset = match pwr {
            Pwr::Active => 0,
            Pwr::Reactive => 1,
        };
        Ok(ess * self.columns_per_ess() + phase_offset * Pwr::BOTH.len() + pwr_offset)
    }

    pub fn key_of(&self, index: usize) -> Option<VariableKey<'_>> {
        let per_ess = self.columns_per_ess();
        let ess_id = self.ess_ids.get_index(index / per_ess)?;
        let within = index % per_ess;
        Some(VariableKey {
            ess_id,
            phase: self.phases()[within / Pwr::BOTH.len()],
            pwr: Pwr::BOTH[within % Pwr::BOTH.len()],
        })
    }

    /// Every column of one ESS and power type, in phase order.
    pub fn columns_of(&self, ess_id: &str, pwr: Pwr) -> PowerResult<Vec<usize>> {
        self.phases().iter().map(|phase| self.of(ess_id, *phase, pwr)).collect()
    }

    /// Resolves a reference to `(ess_id, phase, pwr)` scaled by `value` into
    /// concrete terms, expanding between phase conventions:
    ///
    /// * asymmetric mode, `Phase::All`: one term per single phase;
    /// * symmetric mode, `Phase::L1..L3`: a third of the `All` column.
    pub fn terms(&self, ess_id: &str, phase: Phase, pwr: Pwr, value: f64) -> PowerResult<Vec<LinearCoefficient>> {
        match (self.symmetric_mode, phase) {
            (false, Phase::All) => Ok(self
                .columns_of(ess_id, pwr)?
                .into_iter()
                .map(|index| LinearCoefficient { index, value })
                .collect()),
            (true, Phase::L1 | Phase::L2 | Phase::L3) => Ok(vec![LinearCoefficient {
                index: self.of(ess_id, Phase::All, pwr)?,
                value: value / 3.0,
            }]),
            _ => Ok(vec![LinearCoefficient {
                index: self.of(ess_id, phase, pwr)?,
                value,
            }]),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, VariableKey<'_>)> + '_ {
        (0..self.len()).filter_map(move |i| self.key_of(i).map(|k| (i, k)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EssDescriptor;

    fn topology() -> Topology {
        Topology::new(vec![
            EssDescriptor::cluster("c0", ["ess0", "ess1"]),
            EssDescriptor::leaf("ess0").with_limits(-1000.0, 1000.0, 1000.0),
            EssDescriptor::leaf("ess1").with_limits(-1000.0, 1000.0, 1000.0),
        ])
        .unwrap()
    }

    #[test]
    fn test_symmetric_layout() {
        let c = Coefficients::new(&topology(), true);
        assert_eq!(c.len(), 6);
        assert_eq!(c.of("c0", Phase::All, Pwr::Active).unwrap(), 0);
        assert_eq!(c.of("c0", Phase::All, Pwr::Reactive).unwrap(), 1);
        assert_eq!(c.of("ess1", Phase::All, Pwr::Reactive).unwrap(), 5);
        let key = c.key_of(2).unwrap();
        assert_eq!((key.ess_id, key.phase, key.pwr), ("ess0", Phase::All, Pwr::Active));
    }

    #[test]
    fn test_asymmetric_layout() {
        let c = Coefficients::new(&topology(), false);
        assert_eq!(c.len(), 18);
        assert_eq!(c.of("ess0", Phase::L1, Pwr::Active).unwrap(), 6);
        assert_eq!(c.of("ess0", Phase::L3, Pwr::Reactive).unwrap(), 11);
        assert!(c.iter().all(|(i, key)| c.of(key.ess_id, key.phase, key.pwr).unwrap() == i));
    }

    #[test]
    fn test_unknown_lookups_are_configuration_errors() {
        let symmetric = Coefficients::new(&topology(), true);
        assert!(matches!(
            symmetric.of("nope", Phase::All, Pwr::Active),
            Err(PowerError::Configuration(_))
        ));
        assert!(symmetric.of("ess0", Phase::L1, Pwr::Active).is_err());

        let asymmetric = Coefficients::new(&topology(), false);
        assert!(asymmetric.of("ess0", Phase::All, Pwr::Active).is_err());
    }

    #[test]
    fn test_phase_expansion() {
        let asymmetric = Coefficients::new(&topology(), false);
        let terms = asymmetric.terms("ess0", Phase::All, Pwr::Active, 2.0).unwrap();
        assert_eq!(terms.iter().map(|t| t.index).collect::<Vec<_>>(), [6, 8, 10]);
        assert!(terms.iter().all(|t| t.value == 2.0));

        let symmetric = Coefficients::new(&topology(), true);
        let terms = symmetric.terms("ess0", Phase::L2, Pwr::Reactive, 3.0).unwrap();
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].index, 3);
        assert!((terms[0].value - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_identical_topologies_give_identical_order() {
        let a = Coefficients::new(&topology(), false);
        let b = Coefficients::new(&topology(), false);
        assert_eq!(a, b);
    }
}
