#![allow(dead_code)]

use std::time::Duration;

use ess_power::controller::{CycleReport, CycleScheduler};
use ess_power::controller::PidSettings;
use ess_power::domain::{EssDescriptor, Topology};
use ess_power::error::{PowerError, PowerResult};
use ess_power::hardware::EssWriter;
use ess_power::optimizer::{PhaseSetpoint, SolverSettings, SolverStrategy};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Symmetric { ess_id: String, active: i32, reactive: i32 },
    Asymmetric { ess_id: String, phases: [PhaseSetpoint; 3] },
}

impl Write {
    pub fn ess_id(&self) -> &str {
        match self {
            Write::Symmetric { ess_id, .. } | Write::Asymmetric { ess_id, .. } => ess_id,
        }
    }
}

/// Records every write; writes to ids in `failing` return an error.
#[derive(Debug, Default)]
pub struct RecordingWriter {
    pub writes: Mutex<Vec<Write>>,
    pub failing: Vec<String>,
}

impl RecordingWriter {
    pub fn failing(ids: &[&str]) -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            failing: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn take(&self) -> Vec<Write> {
        std::mem::take(&mut *self.writes.lock())
    }

    fn check(&self, ess_id: &str) -> PowerResult<()> {
        if self.failing.iter().any(|f| f == ess_id) {
            return Err(PowerError::HardwareApply {
                ess_id: ess_id.to_string(),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }
}

impl EssWriter for RecordingWriter {
    fn apply_power(&self, ess_id: &str, active_power: i32, reactive_power: i32) -> PowerResult<()> {
        self.check(ess_id)?;
        self.writes.lock().push(Write::Symmetric {
            ess_id: ess_id.to_string(),
            active: active_power,
            reactive: reactive_power,
        });
        Ok(())
    }

    fn apply_power_asymmetric(&self, ess_id: &str, phases: [PhaseSetpoint; 3]) -> PowerResult<()> {
        self.check(ess_id)?;
        self.writes.lock().push(Write::Asymmetric {
            ess_id: ess_id.to_string(),
            phases,
        });
        Ok(())
    }
}

pub fn settings(strategy: SolverStrategy) -> SolverSettings {
    SolverSettings {
        strategy,
        time_budget: Duration::from_secs(5),
        ..SolverSettings::default()
    }
}

pub fn scheduler(settings: SolverSettings) -> CycleScheduler<RecordingWriter> {
    CycleScheduler::new(settings, PidSettings::default(), RecordingWriter::default())
}

/// Cluster `c0` over two leaves with the given limits and SoC.
pub fn pair(limits: [(f64, f64, f64); 2], soc: [f64; 2]) -> Topology {
    Topology::new(vec![
        EssDescriptor::cluster("c0", ["ess1", "ess2"]),
        EssDescriptor::leaf("ess1")
            .with_limits(limits[0].0, limits[0].1, limits[0].2)
            .with_soc(soc[0]),
        EssDescriptor::leaf("ess2")
            .with_limits(limits[1].0, limits[1].1, limits[1].2)
            .with_soc(soc[1]),
    ])
    .expect("valid topology")
}

pub fn active(report: &CycleReport, ess_id: &str) -> i32 {
    report
        .merged
        .as_ref()
        .and_then(|m| m.get(ess_id))
        .map(|s| s.active_power)
        .unwrap_or_else(|| panic!("no set-point for {}", ess_id))
}

pub fn reactive(report: &CycleReport, ess_id: &str) -> i32 {
    report
        .merged
        .as_ref()
        .and_then(|m| m.get(ess_id))
        .map(|s| s.reactive_power)
        .unwrap_or_else(|| panic!("no set-point for {}", ess_id))
}
