use enumset::{EnumSet, EnumSetType};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{PowerError, PowerResult};

/// Whether an ESS is a physical inverter or a logical grouping of others.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EssKind {
    Leaf,
    Cluster,
}

/// Capabilities of a leaf ESS.
#[derive(EnumSetType, Debug, Serialize, Deserialize)]
#[enumset(serialize_repr = "list")]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Accepts power setpoints.
    Managed,
    /// Accepts a separate setpoint per phase.
    Asymmetric,
}

/// Read-only snapshot of one ESS, taken when a cycle is initialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EssDescriptor {
    pub id: String,
    pub kind: EssKind,
    pub capabilities: EnumSet<Capability>,
    /// Child ids (clusters only).
    pub children: Vec<String>,
    /// Most negative active power the device accepts (W, <= 0).
    pub allowed_charge_power: f64,
    /// Most positive active power the device accepts (W, >= 0).
    pub allowed_discharge_power: f64,
    pub max_apparent_power: f64,
    /// Rounding granularity of setpoints (W).
    pub power_precision: f64,
    pub soc: Option<f64>,
    /// Measured active power, used as PID input.
    pub active_power: Option<f64>,
    pub faulted: bool,
}

impl EssDescriptor {
    /// A managed, symmetric leaf with zero limits. Use the `with_*` builders to set limits.
    pub fn leaf(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: EssKind::Leaf,
            capabilities: Capability::Managed.into(),
            children: Vec::new(),
            allowed_charge_power: 0.0,
            allowed_discharge_power: 0.0,
            max_apparent_power: 0.0,
            power_precision: 1.0,
            soc: None,
            active_power: None,
            faulted: false,
        }
    }

    pub fn cluster<I, S>(id: impl Into<String>, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: EssKind::Cluster,
            children: children.into_iter().map(Into::into).collect(),
            ..Self::leaf(id)
        }
    }

    /// Sets charge, discharge and apparent power limits in one go.
    pub fn with_limits(mut self, allowed_charge_power: f64, allowed_discharge_power: f64, max_apparent_power: f64) -> Self {
        self.allowed_charge_power = allowed_charge_power;
        self.allowed_discharge_power = allowed_discharge_power;
        self.max_apparent_power = max_apparent_power;
        self
    }

    pub fn with_power_precision(mut self, precision: f64) -> Self {
        self.power_precision = precision;
        self
    }

    pub fn with_soc(mut self, soc: f64) -> Self {
        self.soc = Some(soc);
        self
    }

    pub fn with_active_power(mut self, watts: f64) -> Self {
        self.active_power = Some(watts);
        self
    }

    pub fn with_capabilities(mut self, capabilities: EnumSet<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn asymmetric(mut self) -> Self {
        self.capabilities |= Capability::Asymmetric;
        self
    }

    pub fn faulted(mut self) -> Self {
        self.faulted = true;
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == EssKind::Leaf
    }

    pub fn is_managed(&self) -> bool {
        self.capabilities.contains(Capability::Managed)
    }

    pub fn is_asymmetric(&self) -> bool {
        self.capabilities.contains(Capability::Asymmetric)
    }

    /// Leaves that may receive a non-zero setpoint.
    pub fn is_controllable(&self) -> bool {
        self.is_leaf() && self.is_managed() && !self.faulted
    }

    fn validate(&self) -> PowerResult<()> {
        if self.id.trim().is_empty() {
            return Err(PowerError::configuration("ESS id must not be empty"));
        }
        match self.kind {
            EssKind::Cluster => {
                if self.children.is_empty() {
                    return Err(PowerError::configuration(format!(
                        "cluster {} has no children",
                        self.id
                    )));
                }
            }
            EssKind::Leaf => {
                if !self.children.is_empty() {
                    return Err(PowerError::configuration(format!("leaf {} lists children", self.id)));
                }
                let finite = [
                    self.allowed_charge_power,
                    self.allowed_discharge_power,
                    self.max_apparent_power,
                    self.power_precision,
                ]
                .iter()
                .all(|v| v.is_finite());
                if !finite {
                    return Err(PowerError::configuration(format!("ESS {} has non-finite limits", self.id)));
                }
                if self.allowed_charge_power > 0.0 || self.allowed_discharge_power < 0.0 {
                    return Err(PowerError::configuration(format!(
                        "ESS {}: allowed charge power must be <= 0 and allowed discharge power >= 0 (got {} / {})",
                        self.id, self.allowed_charge_power, self.allowed_discharge_power
                    )));
                }
                if self.max_apparent_power < 0.0 {
                    return Err(PowerError::configuration(format!(
                        "ESS {}: negative max apparent power {}",
                        self.id, self.max_apparent_power
                    )));
                }
                if self.power_precision <= 0.0 {
                    return Err(PowerError::configuration(format!(
                        "ESS {}: power precision must be positive",
                        self.id
                    )));
                }
                if let Some(soc) = self.soc {
                    if !(0.0..=100.0).contains(&soc) {
                        return Err(PowerError::configuration(format!("ESS {}: SoC {} out of range", self.id, soc)));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Validated, ordered set of ESS descriptors for one cycle.
///
/// Iteration order is the order the descriptors were supplied in, which fixes
/// the solver column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    esss: IndexMap<String, EssDescriptor>,
    parents: HashMap<String, String>,
}

impl Topology {
    pub fn new(esss: impl IntoIterator<Item = EssDescriptor>) -> PowerResult<Self> {
        let mut map = IndexMap::new();
        for ess in esss {
            ess.validate()?;
            if map.contains_key(&ess.id) {
                return Err(PowerError::configuration(format!("duplicate ESS id {}", ess.id)));
            }
            map.insert(ess.id.clone(), ess);
        }

        let mut parents = HashMap::new();
        for cluster in map.values().filter(|e| !e.is_leaf()) {
            for child in &cluster.children {
                if !map.contains_key(child) {
                    return Err(PowerError::configuration(format!(
                        "cluster {} references unknown ESS {}",
                        cluster.id, child
                    )));
                }
                if let Some(previous) = parents.insert(child.clone(), cluster.id.clone()) {
                    return Err(PowerError::configuration(format!(
                        "ESS {} belongs to both {} and {}",
                        child, previous, cluster.id
                    )));
                }
            }
        }

        let topology = Self { esss: map, parents };
        topology.check_acyclic()?;
        Ok(topology)
    }

    fn check_acyclic(&self) -> PowerResult<()> {
        for id in self.esss.keys() {
            let mut current = id;
            let mut depth = 0;
            while let Some(parent) = self.parents.get(current) {
                depth += 1;
                if parent == id || depth > self.esss.len() {
                    return Err(PowerError::configuration(format!("cluster cycle through {}", id)));
                }
                current = parent;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.esss.len()
    }

    pub fn is_empty(&self) -> bool {
        self.esss.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&EssDescriptor> {
        self.esss.get(id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.esss.get_index_of(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EssDescriptor> {
        self.esss.values()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &EssDescriptor> {
        self.iter().filter(|e| e.is_leaf())
    }

    pub fn clusters(&self) -> impl Iterator<Item = &EssDescriptor> {
        self.iter().filter(|e| !e.is_leaf())
    }

    pub fn parent_of(&self, id: &str) -> Option<&str> {
        self.parents.get(id).map(String::as_str)
    }

    /// ESS without a parent cluster, in snapshot order.
    pub fn roots(&self) -> impl Iterator<Item = &EssDescriptor> {
        self.iter().filter(|e| !self.parents.contains_key(&e.id))
    }

    /// All leaves below `id` (or `id` itself for a leaf), depth first.
    pub fn leaves_of(&self, id: &str) -> Vec<&EssDescriptor> {
        let mut out = Vec::new();
        self.collect_leaves(id, &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, id: &str, out: &mut Vec<&'a EssDescriptor>) {
        let Some(ess) = self.esss.get(id) else {
            return;
        };
        match ess.kind {
            EssKind::Leaf => out.push(ess),
            EssKind::Cluster => {
                for child in &ess.children {
                    self.collect_leaves(child, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(id: &str) -> EssDescriptor {
        EssDescriptor::leaf(id).with_limits(-5000.0, 5000.0, 6000.0)
    }

    #[test]
    fn test_nested_topology() {
        let topology = Topology::new(vec![
            EssDescriptor::cluster("site", ["cluster0", "ess2"]),
            EssDescriptor::cluster("cluster0", ["ess0", "ess1"]),
            leaf("ess0"),
            leaf("ess1"),
            leaf("ess2"),
        ])
        .unwrap();

        let ids: Vec<_> = topology.leaves_of("site").iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["ess0", "ess1", "ess2"]);
        assert_eq!(topology.parent_of("ess0"), Some("cluster0"));
        assert_eq!(topology.roots().map(|e| e.id.as_str()).collect::<Vec<_>>(), ["site"]);
        assert_eq!(topology.position("ess1"), Some(3));
    }

    #[test]
    fn test_rejects_unknown_child() {
        let err = Topology::new(vec![EssDescriptor::cluster("c", ["missing"])]).unwrap_err();
        assert!(matches!(err, PowerError::Configuration(_)));
    }

    #[test]
    fn test_rejects_two_parents() {
        let result = Topology::new(vec![
            EssDescriptor::cluster("a", ["ess0"]),
            EssDescriptor::cluster("b", ["ess0"]),
            leaf("ess0"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_cluster_cycle() {
        let result = Topology::new(vec![
            EssDescriptor::cluster("a", ["b"]),
            EssDescriptor::cluster("b", ["a"]),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_positive_charge_limit() {
        let result = Topology::new(vec![EssDescriptor::leaf("ess0").with_limits(100.0, 5000.0, 5000.0)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        assert!(Topology::new(vec![leaf("ess0"), leaf("ess0")]).is_err());
    }

    #[test]
    fn test_controllable() {
        assert!(leaf("a").is_controllable());
        assert!(!leaf("a").faulted().is_controllable());
        assert!(!leaf("a").with_capabilities(EnumSet::empty()).is_controllable());
        assert!(leaf("a").asymmetric().is_asymmetric());
    }
}
