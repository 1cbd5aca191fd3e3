use super::{build_cache, build_config, build_scorer, load_all_series, RunInputs};
use crate::orchestrator::{BacktestTask, RunOrchestrator, RunReport};
use crate::trade_log::export_trade_log;
use anyhow::{Context, Result};
use log::{info, warn};
use std::fs;
use std::path::Path;

/// Optional files written after the run.
#[derive(Debug, Clone, Copy, Default)]
pub struct BacktestOutputs<'a> {
    /// JSON run report.
    pub report: Option<&'a Path>,
    /// Closed trades of every successful task as CSV.
    pub trades_csv: Option<&'a Path>,
}

pub fn run(inputs: &RunInputs, outputs: BacktestOutputs) -> Result<RunReport> {
    let BacktestOutputs {
        report: report_path,
        trades_csv,
    } = outputs;

    let loaded = load_all_series(inputs)?;
    let config = build_config(inputs.config.as_deref(), &inputs.params)?;
    let scorer = build_scorer(inputs)?;

    let mut orchestrator = RunOrchestrator::new()
        .with_cache(build_cache(inputs.cache_dir.as_deref()))
        .with_progress(true);
    if let Some(workers) = inputs.workers {
        orchestrator = orchestrator.with_workers(workers);
    }

    let tasks: Vec<BacktestTask> = loaded
        .series
        .iter()
        .map(|data| {
            let task = BacktestTask::new(data.clone(), config.clone());
            match &scorer {
                Some(scorer) => task.with_scorer(scorer.clone()),
                None => task,
            }
        })
        .collect();

    let mut report = orchestrator.run(tasks);
    loaded.record_failures(&mut report);
    info!("Run {} finished with {} task(s)", report.run_id, report.len());

    for (_, result) in report.successes() {
        println!();
        for line in result.summary_lines() {
            println!("{}", line);
        }
    }
    for (key, error) in report.failures() {
        warn!("{}: {} ({})", key, error, error.kind());
    }
    for (key, error) in &report.rejected {
        warn!("{}: {}", key, error);
    }

    if let Some(path) = report_path {
        let json = report
            .to_json_pretty()
            .context("Failed to serialize run report")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write run report to {}", path.display()))?;
        info!("Run report written to {}", path.display());
    }
    if let Some(path) = trades_csv {
        export_trade_log(path, &report)?;
    }

    Ok(report)
}
