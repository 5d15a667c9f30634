use std::sync::Arc;

use anyhow::{Context, Result};
use pso_core::{init_tracing, load_settings_from_env, ResultCache, SwarmDriver};
use pso_trainer::TrainerSettings;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let settings: TrainerSettings = load_settings_from_env().context("loading trainer settings")?;
    init_tracing("pso-trainer", &settings.swarm.log_level)?;

    let space = Arc::new(settings.swarm.space()?);
    let live_dir = settings.swarm.live_cache_dir();
    let cache = ResultCache::open(&live_dir).with_context(|| format!("opening result cache at {}", live_dir.display()))?;
    let evaluator = Arc::new(settings.evaluator());
    let config = settings.swarm.driver_config();
    info!(
        target: "pso-trainer",
        particles = config.particles,
        target_epochs = config.target_epochs,
        concurrency = config.desired_concurrency(),
        cache = %live_dir.display(),
        cached_rows = cache.len(),
        "trainer_starting"
    );
    let driver = SwarmDriver::new(config, space, evaluator, cache)?;

    let report = tokio::select! {
        report = driver.run() => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!(target: "pso-trainer", cache = %live_dir.display(), "interrupted; live cache kept for the next run");
            return Ok(());
        }
    };
    println!("{report}");

    std::fs::create_dir_all(&settings.swarm.output_dir)?;
    let consolidated = settings.swarm.consolidated_cache_dir();
    ResultCache::consolidate(&consolidated, &[live_dir], true)?;
    let report_path = settings.swarm.output_dir.join("run_report.json");
    std::fs::write(&report_path, serde_json::to_vec_pretty(&report)?)?;
    info!(target: "pso-trainer", scores = %consolidated.display(), report = %report_path.display(), "trainer_finished");
    Ok(())
}
