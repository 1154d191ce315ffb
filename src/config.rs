use std::time::Duration;

use anyhow::{Context, Result};
use enumset::EnumSet;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use validator::Validate;

use crate::controller::PidSettings;
use crate::domain::{Capability, EssDescriptor, EssKind};
use crate::error::{PowerError, PowerResult};
#[cfg(feature = "sim")]
use crate::hardware::{SimulatedEss, SimulatedUnit};
use crate::optimizer::{SolverSettings, SolverStrategy};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub power: PowerConfig,
    #[validate(nested)]
    pub solver: SolverConfig,
    #[validate(nested)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    #[validate(nested)]
    pub ess: Vec<EssConfig>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PowerConfig {
    #[serde(default)]
    pub strategy: SolverStrategy,
    #[serde(default = "default_true")]
    pub symmetric_mode: bool,
    #[serde(default)]
    pub debug_mode: bool,
    #[validate(range(min = 0.0, max = 1.0))]
    pub approach_rate: f64,
    #[serde(default)]
    #[validate(nested)]
    pub pid: PidSettings,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SolverConfig {
    #[validate(range(min = 1))]
    pub time_budget_ms: u64,
    pub max_relax_retries: usize,
    #[validate(range(min = 4, max = 1024))]
    pub max_polygon_resolution: usize,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SchedulerConfig {
    #[validate(range(min = 10))]
    pub cycle_ms: u64,
}

/// One ESS of the simulated bank.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct EssConfig {
    #[validate(length(min = 1))]
    pub id: String,
    #[serde(default = "default_kind")]
    pub kind: EssKind,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    #[validate(range(max = 0.0))]
    pub allowed_charge_power: f64,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub allowed_discharge_power: f64,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub max_apparent_power: f64,
    #[serde(default = "default_precision")]
    #[validate(range(min = 0.001))]
    pub power_precision: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub soc: Option<f64>,
    #[serde(default = "default_capacity")]
    #[validate(range(min = 1.0))]
    pub capacity_wh: f64,
    #[serde(default = "default_true")]
    pub managed: bool,
    #[serde(default)]
    pub asymmetric: bool,
}

fn default_true() -> bool {
    true
}

fn default_kind() -> EssKind {
    EssKind::Leaf
}

fn default_precision() -> f64 {
    1.0
}

fn default_capacity() -> f64 {
    10_000.0
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("ESS_POWER__").split("__"));
        let cfg: Self = figment.extract().context("loading configuration")?;
        cfg.validate().context("validating configuration")?;
        Ok(cfg)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let cfg: Self = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .context("parsing configuration")?;
        cfg.validate().context("validating configuration")?;
        Ok(cfg)
    }

    pub fn solver_settings(&self) -> PowerResult<SolverSettings> {
        self.validate()
            .map_err(|e| PowerError::configuration(e.to_string()))?;
        Ok(SolverSettings {
            strategy: self.power.strategy,
            symmetric_mode: self.power.symmetric_mode,
            debug_mode: self.power.debug_mode,
            time_budget: Duration::from_millis(self.solver.time_budget_ms),
            max_relax_retries: self.solver.max_relax_retries,
            max_polygon_resolution: self.solver.max_polygon_resolution,
            approach_rate: self.power.approach_rate,
        })
    }

    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.scheduler.cycle_ms)
    }

    /// Simulated bank for the configured `[[ess]]` entries.
    #[cfg(feature = "sim")]
    pub fn simulated_bank(&self) -> SimulatedEss {
        let (clusters, leaves): (Vec<_>, Vec<_>) = self.ess.iter().partition(|e| e.kind == EssKind::Cluster);
        SimulatedEss::new(
            leaves
                .into_iter()
                .map(|e| SimulatedUnit::new(e.descriptor(), e.capacity_wh)),
            clusters.into_iter().map(EssConfig::descriptor).collect(),
        )
    }
}

impl EssConfig {
    pub fn descriptor(&self) -> EssDescriptor {
        if self.kind == EssKind::Cluster {
            return EssDescriptor::cluster(self.id.clone(), self.children.iter().cloned());
        }
        let mut capabilities = EnumSet::new();
        if self.managed {
            capabilities |= Capability::Managed;
        }
        if self.asymmetric {
            capabilities |= Capability::Asymmetric;
        }
        let descriptor = EssDescriptor::leaf(self.id.clone())
            .with_limits(self.allowed_charge_power, self.allowed_discharge_power, self.max_apparent_power)
            .with_power_precision(self.power_precision)
            .with_capabilities(capabilities);
        match self.soc {
            Some(soc) => descriptor.with_soc(soc),
            None => descriptor,
        }
    }
}
