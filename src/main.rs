use anyhow::{Context, Result};
use ess_power::config::Config;
use ess_power::controller::{CycleOutcome, CycleScheduler};
use ess_power::telemetry;
use tracing::{info, warn};

/// Active power requested from every root ESS by the demo loop (W, charge).
const DEMO_TARGET_W: f64 = -5000.0;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let cfg = Config::load()?;
    let settings = cfg.solver_settings().context("invalid solver settings")?;
    let period = cfg.cycle_period();
    info!(
        strategy = %settings.strategy,
        symmetric_mode = settings.symmetric_mode,
        cycle_ms = period.as_millis() as u64,
        ess = cfg.ess.len(),
        "starting ESS power distribution"
    );

    let mut scheduler = CycleScheduler::new(settings, cfg.power.pid, cfg.simulated_bank());
    let mut interval = tokio::time::interval(period);
    let shutdown = telemetry::shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = interval.tick() => {}
        }

        let topology = scheduler.writer().snapshot().context("reading ESS snapshot")?;
        let roots: Vec<String> = topology.roots().map(|e| e.id.clone()).collect();
        scheduler.initialize_cycle(topology).context("opening cycle")?;
        for root in &roots {
            if let Err(e) = scheduler.set_active_power_with_pid("demo", root, DEMO_TARGET_W) {
                warn!(ess_id = %root, error = %e, "demo target rejected");
            }
        }

        match scheduler.run_cycle() {
            Ok(report) => {
                if let (CycleOutcome::Applied, Some(merged)) = (&report.outcome, &report.merged) {
                    for setpoint in merged.setpoints.values() {
                        info!(
                            cycle = report.cycle,
                            ess_id = %setpoint.ess_id,
                            active_power = setpoint.active_power,
                            reactive_power = setpoint.reactive_power,
                            soc = scheduler.writer().soc(&setpoint.ess_id),
                            "set-point"
                        );
                    }
                }
            }
            Err(e) => warn!(error = %e, "cycle failed"),
        }
        scheduler.writer().step(period);
    }

    let status = scheduler.status();
    info!(
        runs = status.run_count,
        successes = status.success_count,
        held = status.held_count,
        dropped = status.dropped_constraint_count,
        "shutdown complete"
    );
    Ok(())
}
