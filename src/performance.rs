use crate::config::MetricsConfig;
use crate::models::*;
use statrs::statistics::Statistics;

pub struct MetricsInputs<'a> {
    pub trades: &'a [Trade],
    pub equity_curve: &'a [EquityPoint],
    pub initial_equity: f64,
    pub final_equity: f64,
    pub total_commission: f64,
    pub bars_in_market: usize,
    pub config: &'a MetricsConfig,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    pub fn calculate(inputs: MetricsInputs) -> PerformanceMetrics {
        let MetricsInputs {
            trades,
            equity_curve,
            initial_equity,
            final_equity,
            total_commission,
            bars_in_market,
            config,
        } = inputs;

        let total_trades = trades.len();
        let mut trade_percents = Vec::with_capacity(total_trades);
        let mut winning_percents = Vec::new();
        let mut losing_percents = Vec::new();
        let mut gross_profit = 0.0;
        let mut gross_loss = 0.0;

        for trade in trades {
            let net = trade.net_pnl();
            trade_percents.push(trade.pnl_percent);
            if net > 0.0 {
                winning_percents.push(trade.pnl_percent);
                gross_profit += net;
            } else if net < 0.0 {
                losing_percents.push(trade.pnl_percent);
                gross_loss += -net;
            }
        }

        let winning_trades = winning_percents.len();
        let losing_trades = losing_percents.len();
        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64
        } else {
            0.0
        };

        let profit_factor = if losing_trades > 0 && gross_loss > 0.0 {
            Some(gross_profit / gross_loss)
        } else {
            None
        };

        let total_return = if initial_equity > 0.0 && final_equity.is_finite() {
            (final_equity - initial_equity) / initial_equity
        } else {
            0.0
        };

        let exposure_percent = if equity_curve.is_empty() {
            0.0
        } else {
            bars_in_market as f64 / equity_curve.len() as f64 * 100.0
        };

        PerformanceMetrics {
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            avg_win_percent: Self::average(&winning_percents),
            avg_loss_percent: Self::average(&losing_percents),
            avg_trade_percent: Self::average(&trade_percents),
            best_trade_percent: Self::extreme(&trade_percents, f64::max),
            worst_trade_percent: Self::extreme(&trade_percents, f64::min),
            total_return,
            max_drawdown: Self::calculate_max_drawdown(initial_equity, equity_curve),
            sharpe_ratio: Self::calculate_sharpe_ratio(initial_equity, equity_curve, config),
            profit_factor,
            exposure_percent,
            total_commission,
            final_equity,
            insufficient_data: total_trades == 0 || equity_curve.len() < 2,
        }
    }

    fn average(values: &[f64]) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;

        for value in values.iter().copied() {
            if value.is_finite() {
                sum += value;
                count += 1;
            }
        }

        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    fn extreme(values: &[f64], pick: fn(f64, f64) -> f64) -> f64 {
        values
            .iter()
            .copied()
            .filter(|value| value.is_finite())
            .reduce(pick)
            .unwrap_or(0.0)
    }

    /// Per-bar Sharpe ratio, annualized by `periods_per_year`. Zero when the
    /// returns have no variance.
    pub fn calculate_sharpe_ratio(
        initial_equity: f64,
        equity_curve: &[EquityPoint],
        config: &MetricsConfig,
    ) -> f64 {
        let values: Vec<f64> = std::iter::once(initial_equity)
            .chain(equity_curve.iter().map(|point| point.equity))
            .collect();

        let returns: Vec<f64> = values
            .windows(2)
            .map(|window| {
                let prev_value = window[0];
                let curr_value = window[1];
                if prev_value > 0.0 {
                    (curr_value - prev_value) / prev_value
                } else {
                    0.0
                }
            })
            .collect();

        if returns.len() < 2 {
            return 0.0;
        }

        let mean_return = returns.clone().mean();
        let std_dev = returns.std_dev();

        if !std_dev.is_finite() || std_dev <= 0.0 {
            return 0.0;
        }

        let periods = config.periods_per_year.max(1.0);
        let risk_free_per_period = config.risk_free_rate / periods;
        let sharpe = (mean_return - risk_free_per_period) / std_dev * periods.sqrt();
        if sharpe.is_finite() {
            sharpe
        } else {
            0.0
        }
    }

    /// Largest peak-to-trough decline as a fraction of the peak.
    pub fn calculate_max_drawdown(initial_equity: f64, equity_curve: &[EquityPoint]) -> f64 {
        let mut peak_value = initial_equity;
        let mut max_drawdown = 0.0;

        for point in equity_curve {
            if point.equity > peak_value {
                peak_value = point.equity;
            } else if peak_value > 0.0 {
                let drawdown = (peak_value - point.equity) / peak_value;
                if drawdown > max_drawdown {
                    max_drawdown = drawdown;
                }
            }
        }

        max_drawdown
    }
}
