use crate::config::{BacktestConfig, Objective};
use crate::error::ConfigError;
use crate::models::{BacktestResult, BarSeries};
use crate::orchestrator::{BacktestTask, RunOrchestrator, RunReport};
use crate::param_utils::{expand_parameter_grid, parse_grid_axis};
use crate::scorer::Scorer;
use anyhow::Result;
use log::{info, warn};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Axes of a parameter sweep, keyed by camelCase config parameter name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterGrid {
    axes: BTreeMap<String, Vec<f64>>,
}

impl ParameterGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_axis(mut self, key: impl Into<String>, values: Vec<f64>) -> Self {
        self.axes.insert(key.into(), values);
        self
    }

    /// Parse `key=v1,v2,...` assignments.
    pub fn from_assignments<S: AsRef<str>>(assignments: &[S]) -> Result<Self> {
        let mut grid = Self::new();
        for raw in assignments {
            let (key, values) = parse_grid_axis(raw.as_ref())?;
            grid.axes.insert(key, values);
        }
        Ok(grid)
    }

    pub fn variants(&self) -> Vec<HashMap<String, f64>> {
        expand_parameter_grid(&self.axes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantSummary {
    pub index: usize,
    pub parameters: BTreeMap<String, f64>,
    pub config_error: Option<ConfigError>,
    pub symbols_ok: usize,
    pub symbols_failed: usize,
    pub avg_total_return: f64,
    pub avg_sharpe_ratio: f64,
    pub avg_max_drawdown: f64,
    pub total_trades: usize,
    /// Ranking score; `None` when the variant produced no successful run.
    pub score: Option<f64>,
    pub within_drawdown_limit: bool,
}

impl VariantSummary {
    fn is_rankable(&self) -> bool {
        self.score.is_some() && self.within_drawdown_limit
    }
}

pub struct OptimizationReport {
    pub objective: Objective,
    /// Best variant first. Invalid or failed variants trail the ranking.
    pub variants: Vec<VariantSummary>,
    pub run: RunReport,
}

impl OptimizationReport {
    pub fn best(&self) -> Option<&VariantSummary> {
        self.variants.first().filter(|variant| variant.is_rankable())
    }

    pub fn print_results(&self, top_n: usize) {
        println!(
            "\n=== TOP {} PARAMETER VARIANTS ({}) ===\n",
            std::cmp::min(top_n, self.variants.len()),
            self.objective.label()
        );

        for (rank, variant) in self.variants.iter().take(top_n).enumerate() {
            println!("Rank {}: variant #{}", rank + 1, variant.index);
            if let Some(error) = &variant.config_error {
                println!("  Invalid: {}", error);
            } else {
                println!("  Avg Return: {:.2}%", variant.avg_total_return * 100.0);
                println!("  Avg Sharpe Ratio: {:.4}", variant.avg_sharpe_ratio);
                println!("  Avg Max Drawdown: {:.2}%", variant.avg_max_drawdown * 100.0);
                println!("  Total Trades: {}", variant.total_trades);
                println!(
                    "  Symbols: {} ok, {} failed",
                    variant.symbols_ok, variant.symbols_failed
                );
            }
            println!("  Parameters:");
            for (key, value) in &variant.parameters {
                println!("    {}: {}", key, value);
            }
            println!();
        }
    }
}

/// Grid search over config overrides, executed through the run orchestrator.
pub struct ParameterSweep<'a> {
    orchestrator: &'a RunOrchestrator,
    base_config: BacktestConfig,
    objective: Objective,
    max_drawdown: Option<f64>,
}

impl<'a> ParameterSweep<'a> {
    pub fn new(
        orchestrator: &'a RunOrchestrator,
        base_config: BacktestConfig,
        objective: Objective,
    ) -> Self {
        Self {
            orchestrator,
            base_config,
            objective,
            max_drawdown: None,
        }
    }

    /// Variants whose average drawdown exceeds `limit` rank behind all others.
    pub fn with_max_drawdown(mut self, limit: f64) -> Self {
        self.max_drawdown = Some(limit);
        self
    }

    fn objective_score(&self, returns: f64, sharpe: f64) -> f64 {
        let score = match self.objective {
            Objective::TotalReturn => returns,
            Objective::Sharpe => sharpe,
        };
        if score.is_finite() {
            score
        } else {
            f64::NEG_INFINITY
        }
    }

    pub fn run(
        &self,
        series: &[Arc<BarSeries>],
        grid: &ParameterGrid,
        scorer: Option<Arc<dyn Scorer>>,
    ) -> OptimizationReport {
        let variants = grid.variants();
        info!(
            "Sweeping {} parameter variant(s) over {} symbol(s)",
            variants.len(),
            series.len()
        );

        let mut configs = Vec::with_capacity(variants.len());
        let mut tasks = Vec::new();
        for (index, parameters) in variants.iter().enumerate() {
            let config = self.base_config.with_overrides(parameters);
            match config.validate() {
                Ok(()) => {
                    for data in series {
                        let mut task = BacktestTask::new(Arc::clone(data), config.clone())
                            .with_key(variant_task_key(&data.symbol, index));
                        if let Some(scorer) = &scorer {
                            task = task.with_scorer(Arc::clone(scorer));
                        }
                        tasks.push(task);
                    }
                    configs.push(Ok(()));
                }
                Err(error) => {
                    warn!("Skipping parameter variant #{}: {}", index, error);
                    configs.push(Err(error));
                }
            }
        }

        let run = self.orchestrator.run(tasks);

        let mut summaries: Vec<VariantSummary> = variants
            .into_iter()
            .zip(configs)
            .enumerate()
            .map(|(index, (parameters, validity))| {
                let parameters: BTreeMap<String, f64> = parameters.into_iter().collect();
                match validity {
                    Err(error) => VariantSummary {
                        index,
                        parameters,
                        config_error: Some(error),
                        symbols_ok: 0,
                        symbols_failed: series.len(),
                        avg_total_return: 0.0,
                        avg_sharpe_ratio: 0.0,
                        avg_max_drawdown: 0.0,
                        total_trades: 0,
                        score: None,
                        within_drawdown_limit: false,
                    },
                    Ok(()) => self.summarize_variant(index, parameters, series, &run),
                }
            })
            .collect();

        summaries.sort_by(|a, b| compare_variants(a, b));

        OptimizationReport {
            objective: self.objective,
            variants: summaries,
            run,
        }
    }

    fn summarize_variant(
        &self,
        index: usize,
        parameters: BTreeMap<String, f64>,
        series: &[Arc<BarSeries>],
        run: &RunReport,
    ) -> VariantSummary {
        let mut successes: Vec<&BacktestResult> = Vec::new();
        let mut symbols_failed = 0;
        for data in series {
            match run.get(&variant_task_key(&data.symbol, index)) {
                Some(Ok(result)) => successes.push(result),
                _ => symbols_failed += 1,
            }
        }

        let count = successes.len();
        let average = |f: fn(&BacktestResult) -> f64| {
            if count == 0 {
                0.0
            } else {
                successes.iter().map(|r| f(r)).sum::<f64>() / count as f64
            }
        };
        let avg_total_return = average(|r| r.metrics.total_return);
        let avg_sharpe_ratio = average(|r| r.metrics.sharpe_ratio);
        let avg_max_drawdown = average(|r| r.metrics.max_drawdown);
        let total_trades = successes.iter().map(|r| r.metrics.total_trades).sum();

        let score = (count > 0).then(|| self.objective_score(avg_total_return, avg_sharpe_ratio));
        let within_drawdown_limit = match self.max_drawdown {
            Some(limit) => avg_max_drawdown.is_finite() && avg_max_drawdown <= limit,
            None => true,
        };

        VariantSummary {
            index,
            parameters,
            config_error: None,
            symbols_ok: count,
            symbols_failed,
            avg_total_return,
            avg_sharpe_ratio,
            avg_max_drawdown,
            total_trades,
            score,
            within_drawdown_limit,
        }
    }
}

pub fn variant_task_key(symbol: &str, index: usize) -> String {
    format!("{}#{}", symbol, index)
}

fn compare_variants(a: &VariantSummary, b: &VariantSummary) -> Ordering {
    b.is_rankable()
        .cmp(&a.is_rankable())
        .then_with(|| {
            let a_score = a.score.unwrap_or(f64::NEG_INFINITY);
            let b_score = b.score.unwrap_or(f64::NEG_INFINITY);
            b_score.partial_cmp(&a_score).unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.index.cmp(&b.index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Bar;
    use chrono::{Duration, TimeZone, Utc};

    fn series(symbol: &str, count: usize) -> Arc<BarSeries> {
        let start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        let bars = (0..count)
            .map(|i| {
                let base = 80.0 + 0.3 * i as f64 + (i as f64 * 0.6).sin() * 2.5;
                Bar {
                    timestamp: start + Duration::hours(i as i64),
                    open: base,
                    high: base + 1.2,
                    low: base - 1.2,
                    close: base + 0.4,
                    volume: 250.0,
                    gap: false,
                }
            })
            .collect();
        Arc::new(BarSeries::new(symbol, "1h", bars))
    }

    fn base_config() -> BacktestConfig {
        let mut config = BacktestConfig::default();
        config.indicators.ema_fast = 4;
        config.indicators.ema_slow = 10;
        config.indicators.adx_period = 4;
        config.indicators.donchian_period = 6;
        config.signals.threshold = 0.9;
        config.signals.exit_threshold = 0.9;
        config
    }

    #[test]
    fn grid_parses_assignments_into_cartesian_variants() {
        let grid = ParameterGrid::from_assignments(&["emaFast=3,5", "rewardRiskRatio=1.5,2,3"])
            .unwrap();
        assert_eq!(grid.variants().len(), 6);
        assert!(ParameterGrid::from_assignments(&["broken"]).is_err());
        assert_eq!(ParameterGrid::new().variants().len(), 1);
    }

    #[test]
    fn sweep_ranks_valid_variants_and_reports_invalid_ones() {
        let orchestrator = RunOrchestrator::new().with_workers(2);
        let sweep = ParameterSweep::new(&orchestrator, base_config(), Objective::TotalReturn);
        let grid = ParameterGrid::new()
            .with_axis("rewardRiskRatio", vec![1.0, 3.0])
            .with_axis("maxRiskFraction", vec![0.01, 0.5]);

        let report = sweep.run(&[series("AAA", 120), series("BBB", 120)], &grid, None);
        assert_eq!(report.variants.len(), 4);
        // Two tasks for each of the two valid variants
        assert_eq!(report.run.len(), 4);

        let invalid: Vec<_> = report
            .variants
            .iter()
            .filter(|variant| variant.config_error.is_some())
            .collect();
        assert_eq!(invalid.len(), 2);
        assert!(report.variants[2].config_error.is_some());
        assert!(report.variants[3].config_error.is_some());

        let best = report.best().unwrap();
        assert_eq!(best.symbols_ok, 2);
        assert!(best.score.unwrap() >= report.variants[1].score.unwrap());
        assert_eq!(best.parameters.get("maxRiskFraction"), Some(&0.01));
    }

    #[test]
    fn drawdown_limit_demotes_variants() {
        let orchestrator = RunOrchestrator::new().with_workers(1);
        let sweep = ParameterSweep::new(&orchestrator, base_config(), Objective::Sharpe)
            .with_max_drawdown(-1.0);
        let report = sweep.run(&[series("AAA", 60)], &ParameterGrid::new(), None);
        assert_eq!(report.variants.len(), 1);
        assert!(!report.variants[0].within_drawdown_limit);
        assert!(report.best().is_none());
    }

    #[test]
    fn task_keys_combine_symbol_and_variant() {
        assert_eq!(variant_task_key("ETH-USD", 7), "ETH-USD#7");
    }
}
