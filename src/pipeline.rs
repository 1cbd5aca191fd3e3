use crate::cache::{CacheKey, IndicatorCache};
use crate::config::{BacktestConfig, IndicatorConfig};
use crate::engine::{validate_bars, SimulationInputs, TradeSimulator};
use crate::error::TaskError;
use crate::indicators::{compute_indicators, IndicatorSet};
use crate::models::{BacktestResult, BarSeries, TaskStatus};
use crate::performance::{MetricsInputs, PerformanceCalculator};
use crate::scorer::{score_series, Scorer};
use crate::signals::combine_signals;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct BacktestInputs<'a> {
    pub series: &'a BarSeries,
    pub config: &'a BacktestConfig,
    pub scorer: Option<&'a dyn Scorer>,
    pub cache: Option<&'a dyn IndicatorCache>,
}

/// Run the full single-symbol pipeline: validate, compute or fetch
/// indicators, combine signals, simulate, and summarize.
pub fn run_backtest(inputs: BacktestInputs) -> Result<BacktestResult, TaskError> {
    let BacktestInputs {
        series,
        config,
        scorer,
        cache,
    } = inputs;

    config.validate()?;
    validate_bars(&series.bars)?;

    let bars = &series.bars;
    let indicators = load_indicators(series, &config.indicators, cache);
    let ml_scores = scorer.map(|scorer| score_series(scorer, bars));
    let signals = combine_signals(bars, &indicators, ml_scores.as_deref(), &config.signals)?;
    let volatility: Vec<Option<f64>> = indicators.iter().map(|set| set.atr).collect();

    let outcome = TradeSimulator::new(config).run(SimulationInputs {
        symbol: &series.symbol,
        bars,
        signals: &signals,
        volatility: &volatility,
    })?;

    let metrics = PerformanceCalculator::calculate(MetricsInputs {
        trades: &outcome.trades,
        equity_curve: &outcome.equity_curve,
        initial_equity: config.initial_equity,
        final_equity: outcome.final_equity,
        total_commission: outcome.total_commission,
        bars_in_market: outcome.bars_in_market,
        config: &config.metrics,
    });

    let mut notes = Vec::new();
    let gaps = series.gap_count();
    if gaps > 0 {
        notes.push(format!("{} bar(s) flagged as data gaps", gaps));
    }
    if !outcome.skipped.is_empty() {
        let mut reasons: BTreeMap<&str, usize> = BTreeMap::new();
        for skipped in &outcome.skipped {
            *reasons.entry(skipped.reason.as_str()).or_default() += 1;
        }
        for (reason, count) in reasons {
            notes.push(format!("{} entry signal(s) skipped: {}", count, reason));
        }
    }
    let status = if notes.is_empty() {
        TaskStatus::Success
    } else {
        TaskStatus::Partial { notes }
    };

    debug!(
        "{} {}: {} trades, final equity {:.2} ({})",
        series.symbol,
        series.timeframe,
        metrics.total_trades,
        metrics.final_equity,
        status.label()
    );

    Ok(BacktestResult {
        symbol: series.symbol.clone(),
        timeframe: series.timeframe.clone(),
        start: series.start(),
        end: series.end(),
        initial_equity: config.initial_equity,
        trades: outcome.trades,
        equity_curve: outcome.equity_curve,
        skipped: outcome.skipped,
        metrics,
        status,
    })
}

/// Fetch the indicator table from `cache`, computing and storing it on a miss.
/// Cache failures degrade to recomputation.
pub fn load_indicators(
    series: &BarSeries,
    config: &IndicatorConfig,
    cache: Option<&dyn IndicatorCache>,
) -> Arc<Vec<IndicatorSet>> {
    let Some(cache) = cache else {
        return Arc::new(compute_indicators(&series.bars, config));
    };

    let key = CacheKey::new(
        &series.symbol,
        &series.timeframe,
        series.start(),
        series.end(),
        config,
    );

    match cache.get(&key) {
        Ok(Some(table)) if table.len() == series.bars.len() => {
            debug!("Indicator cache hit for {} ({})", series.symbol, key);
            return table;
        }
        Ok(Some(table)) => {
            warn!(
                "Cached indicators for {} cover {} bars, series has {}; recomputing",
                series.symbol,
                table.len(),
                series.bars.len()
            );
        }
        Ok(None) => {}
        Err(err) => {
            warn!("Indicator cache read failed for {}: {}", series.symbol, err);
        }
    }

    let table = Arc::new(compute_indicators(&series.bars, config));
    if let Err(err) = cache.put(key, Arc::clone(&table)) {
        warn!("Indicator cache write failed for {}: {}", series.symbol, err);
    }
    table
}
