pub mod backtest;
pub mod clear_cache;
pub mod export_snapshot;
pub mod optimize;

use crate::cache::{FileIndicatorCache, IndicatorCache, MemoryIndicatorCache};
use crate::config::BacktestConfig;
use crate::lightgbm::LightGbmScorer;
use crate::error::TaskError;
use crate::market_data::{file_symbol, load_error, load_series};
use crate::models::BarSeries;
use crate::orchestrator::RunReport;
use crate::param_utils::parse_param_assignment;
use crate::scorer::{PrecomputedScorer, Scorer};
use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Inputs shared by every command that runs backtests.
#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    pub data: Vec<PathBuf>,
    pub symbol: Option<String>,
    pub timeframe: String,
    pub config: Option<PathBuf>,
    pub params: Vec<String>,
    pub scores: Option<PathBuf>,
    pub model: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub workers: Option<usize>,
}

/// Series that loaded, plus one failure per data file that did not, keyed
/// the way that file's task would have been.
#[derive(Default)]
pub(crate) struct LoadedSeries {
    pub series: Vec<Arc<BarSeries>>,
    pub failures: Vec<(String, TaskError)>,
}

impl LoadedSeries {
    /// Attribute every load failure to its key in `report`.
    pub fn record_failures(self, report: &mut RunReport) {
        for (key, error) in self.failures {
            report.record_failure(key, error);
        }
    }
}

/// Load every data file on its own. A file with bad bars fails only its own
/// symbol; argument errors still abort the command.
pub(crate) fn load_all_series(inputs: &RunInputs) -> Result<LoadedSeries> {
    if inputs.data.is_empty() {
        return Err(anyhow!("At least one --data file is required"));
    }
    if inputs.symbol.is_some() && inputs.data.len() > 1 {
        return Err(anyhow!("--symbol can only be used with a single --data file"));
    }

    let mut loaded = LoadedSeries::default();
    for path in &inputs.data {
        match load_series(path, inputs.symbol.as_deref(), &inputs.timeframe) {
            Ok(series) => loaded.series.extend(series.into_iter().map(Arc::new)),
            Err(err) => {
                let key = inputs
                    .symbol
                    .clone()
                    .or_else(|| file_symbol(path))
                    .unwrap_or_else(|| path.display().to_string());
                warn!("{}: skipping {}: {:#}", key, path.display(), err);
                loaded
                    .failures
                    .push((key, TaskError::Data(load_error(path, &err))));
            }
        }
    }
    info!(
        "Loaded {} bar series ({} file(s) failed)",
        loaded.series.len(),
        loaded.failures.len()
    );
    Ok(loaded)
}

pub(crate) fn build_config(
    config_path: Option<&Path>,
    params: &[String],
) -> Result<BacktestConfig> {
    let base = match config_path {
        Some(path) => BacktestConfig::from_json_file(path)?,
        None => BacktestConfig::default(),
    };

    let mut overrides = HashMap::new();
    for raw in params {
        let (key, value) = parse_param_assignment(raw)?;
        overrides.insert(key, value);
    }

    let config = base.with_overrides(&overrides);
    config.validate().context("Invalid backtest configuration")?;
    Ok(config)
}

pub(crate) fn build_scorer(inputs: &RunInputs) -> Result<Option<Arc<dyn Scorer>>> {
    match (&inputs.scores, &inputs.model) {
        (Some(_), Some(_)) => Err(anyhow!("Use either --scores or --model, not both")),
        (Some(path), None) => {
            let scorer = PrecomputedScorer::from_json_file(path)?;
            info!("Loaded {} precomputed scores from {}", scorer.len(), path.display());
            Ok(Some(Arc::new(scorer)))
        }
        (None, Some(path)) => {
            let scorer = LightGbmScorer::from_file(path)?;
            info!("Loaded LightGBM model {}", scorer.name());
            Ok(Some(Arc::new(scorer)))
        }
        (None, None) => Ok(None),
    }
}

pub(crate) fn build_cache(cache_dir: Option<&Path>) -> Arc<dyn IndicatorCache> {
    match cache_dir {
        Some(dir) => {
            info!("Using indicator cache directory {}", dir.display());
            Arc::new(FileIndicatorCache::new(dir))
        }
        None => Arc::new(MemoryIndicatorCache::new()),
    }
}
