use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::domain::{EssDescriptor, Topology};
use crate::error::{PowerError, PowerResult};
use crate::hardware::EssWriter;
use crate::optimizer::PhaseSetpoint;

/// One simulated inverter with a battery behind it.
#[derive(Debug, Clone)]
pub struct SimulatedUnit {
    /// Rated limits; the snapshot narrows them when the battery is full or empty.
    pub descriptor: EssDescriptor,
    pub capacity_wh: f64,
    pub soc: f64,
    pub active_power: i32,
    pub reactive_power: i32,
    /// Makes every write to this unit fail.
    pub fail_writes: bool,
}

impl SimulatedUnit {
    pub fn new(descriptor: EssDescriptor, capacity_wh: f64) -> Self {
        let soc = descriptor.soc.unwrap_or(50.0);
        Self {
            descriptor,
            capacity_wh,
            soc,
            active_power: 0,
            reactive_power: 0,
            fail_writes: false,
        }
    }

    fn clamp_soc(soc: f64) -> f64 {
        soc.clamp(0.0, 100.0)
    }

    fn snapshot(&self) -> EssDescriptor {
        let mut descriptor = self.descriptor.clone().with_soc(self.soc);
        descriptor.active_power = Some(f64::from(self.active_power));
        if self.soc >= 100.0 {
            descriptor.allowed_charge_power = 0.0;
        }
        if self.soc <= 0.0 {
            descriptor.allowed_discharge_power = 0.0;
        }
        descriptor
    }
}

/// Bank of simulated ESS used by the demo binary.
///
/// Positive active power discharges the battery.
#[derive(Debug, Default)]
pub struct SimulatedEss {
    units: Mutex<IndexMap<String, SimulatedUnit>>,
    clusters: Vec<EssDescriptor>,
}

impl SimulatedEss {
    pub fn new(units: impl IntoIterator<Item = SimulatedUnit>, clusters: Vec<EssDescriptor>) -> Self {
        Self {
            units: Mutex::new(units.into_iter().map(|u| (u.descriptor.id.clone(), u)).collect()),
            clusters,
        }
    }

    /// Current topology with live SoC, measured power and SoC-limited bounds.
    pub fn snapshot(&self) -> PowerResult<Topology> {
        let units = self.units.lock();
        Topology::new(
            self.clusters
                .iter()
                .cloned()
                .chain(units.values().map(SimulatedUnit::snapshot)),
        )
    }

    /// Integrates SoC over `dt` from the last applied set-points.
    pub fn step(&self, dt: Duration) {
        let dt_h = dt.as_secs_f64() / 3600.0;
        let mut units = self.units.lock();
        for unit in units.values_mut() {
            let capacity = unit.capacity_wh.max(1.0);
            let energy_wh = f64::from(unit.active_power) * dt_h;
            unit.soc = SimulatedUnit::clamp_soc(unit.soc - energy_wh / capacity * 100.0);
        }
    }

    pub fn set_fail_writes(&self, ess_id: &str, fail: bool) {
        if let Some(unit) = self.units.lock().get_mut(ess_id) {
            unit.fail_writes = fail;
        }
    }

    pub fn soc(&self, ess_id: &str) -> Option<f64> {
        self.units.lock().get(ess_id).map(|u| u.soc)
    }

    pub fn applied(&self, ess_id: &str) -> Option<(i32, i32)> {
        self.units
            .lock()
            .get(ess_id)
            .map(|u| (u.active_power, u.reactive_power))
    }

    fn write(&self, ess_id: &str, active_power: i32, reactive_power: i32) -> PowerResult<()> {
        let mut units = self.units.lock();
        let unit = units.get_mut(ess_id).ok_or_else(|| PowerError::HardwareApply {
            ess_id: ess_id.to_string(),
            reason: "unknown simulated unit".into(),
        })?;
        if unit.fail_writes {
            return Err(PowerError::HardwareApply {
                ess_id: ess_id.to_string(),
                reason: "simulated write failure".into(),
            });
        }
        unit.active_power = active_power;
        unit.reactive_power = reactive_power;
        debug!(ess_id, active_power, reactive_power, soc = unit.soc, "simulated set-point");
        Ok(())
    }
}

impl EssWriter for SimulatedEss {
    fn apply_power(&self, ess_id: &str, active_power: i32, reactive_power: i32) -> PowerResult<()> {
        self.write(ess_id, active_power, reactive_power)
    }

    fn apply_power_asymmetric(&self, ess_id: &str, phases: [PhaseSetpoint; 3]) -> PowerResult<()> {
        let active: f64 = phases.iter().map(|p| p.active_power).sum();
        let reactive: f64 = phases.iter().map(|p| p.reactive_power).sum();
        self.write(ess_id, active.round() as i32, reactive.round() as i32)
    }
}
