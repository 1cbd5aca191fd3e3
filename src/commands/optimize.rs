use super::{build_cache, build_config, build_scorer, load_all_series, RunInputs};
use crate::config::Objective;
use crate::optimizer::{OptimizationReport, ParameterGrid, ParameterSweep};
use crate::orchestrator::RunOrchestrator;
use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use std::fs;
use std::path::Path;

pub struct OptimizeArgs<'a> {
    pub grid: &'a [String],
    pub objective: Objective,
    pub max_drawdown: Option<f64>,
    pub top: usize,
    pub output: Option<&'a Path>,
}

pub fn run(inputs: &RunInputs, args: OptimizeArgs) -> Result<OptimizationReport> {
    let OptimizeArgs {
        grid,
        objective,
        max_drawdown,
        top,
        output,
    } = args;

    if grid.is_empty() {
        return Err(anyhow!("At least one --grid axis is required"));
    }
    let grid = ParameterGrid::from_assignments(grid)?;
    let loaded = load_all_series(inputs)?;
    let config = build_config(inputs.config.as_deref(), &inputs.params)?;
    let scorer = build_scorer(inputs)?;

    let mut orchestrator = RunOrchestrator::new()
        .with_cache(build_cache(inputs.cache_dir.as_deref()))
        .with_progress(true);
    if let Some(workers) = inputs.workers {
        orchestrator = orchestrator.with_workers(workers);
    }

    for (key, error) in &loaded.failures {
        warn!("{} is excluded from the sweep: {}", key, error);
    }

    info!("Objective: maximize {}", objective.label());
    let mut sweep = ParameterSweep::new(&orchestrator, config, objective);
    if let Some(limit) = max_drawdown {
        info!("Demoting variants with average drawdown above {:.0}%", limit * 100.0);
        sweep = sweep.with_max_drawdown(limit);
    }

    let mut report = sweep.run(&loaded.series, &grid, scorer);
    loaded.record_failures(&mut report.run);
    report.print_results(top);

    if let Some(path) = output {
        let json = report
            .run
            .to_json_pretty()
            .context("Failed to serialize sweep report")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write sweep report to {}", path.display()))?;
        info!("Sweep run report written to {}", path.display());
    }

    Ok(report)
}
