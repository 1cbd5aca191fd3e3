use crate::config::BacktestConfig;
use crate::error::DataError;
use crate::models::*;
use crate::trading_rules::{
    commission, compute_trailing_stop, intrabar_exit, size_position, PositionSizingParams,
    TrailingStopParams,
};
use log::debug;

/// Per-symbol simulator state.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionState {
    Flat,
    Open(Position),
}

impl PositionState {
    pub fn label(&self) -> &'static str {
        match self {
            PositionState::Flat => "FLAT",
            PositionState::Open(position) if position.side.is_short() => "OPEN_SHORT",
            PositionState::Open(_) => "OPEN_LONG",
        }
    }

    pub fn position(&self) -> Option<&Position> {
        match self {
            PositionState::Flat => None,
            PositionState::Open(position) => Some(position),
        }
    }
}

#[derive(Debug, PartialEq)]
enum EntryOutcome {
    Opened(Position),
    Skipped { reason: String },
}

pub struct SimulationInputs<'a> {
    pub symbol: &'a str,
    pub bars: &'a [Bar],
    pub signals: &'a [Signal],
    /// Volatility used for stop placement, aligned with `bars`. `None` during warm-up.
    pub volatility: &'a [Option<f64>],
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOutcome {
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub skipped: Vec<SkippedTrade>,
    pub final_equity: f64,
    pub total_commission: f64,
    /// Bars that closed with a position open.
    pub bars_in_market: usize,
}

/// Check that bars are well-formed and strictly increasing in time.
pub fn validate_bars(bars: &[Bar]) -> Result<(), DataError> {
    if bars.is_empty() {
        return Err(DataError::Empty);
    }

    for (index, bar) in bars.iter().enumerate() {
        let prices = [bar.open, bar.high, bar.low, bar.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(DataError::MalformedBar {
                index,
                reason: "prices must be finite and positive".to_string(),
            });
        }
        if !bar.volume.is_finite() || bar.volume < 0.0 {
            return Err(DataError::MalformedBar {
                index,
                reason: format!("invalid volume {}", bar.volume),
            });
        }
        if bar.high < bar.low {
            return Err(DataError::MalformedBar {
                index,
                reason: format!("high {} below low {}", bar.high, bar.low),
            });
        }
        if bar.high < bar.open.max(bar.close) || bar.low > bar.open.min(bar.close) {
            return Err(DataError::MalformedBar {
                index,
                reason: "open/close outside the high-low range".to_string(),
            });
        }
        if index > 0 {
            let previous = bars[index - 1].timestamp;
            if bar.timestamp <= previous {
                return Err(DataError::NonMonotonicTimestamp {
                    index,
                    previous,
                    current: bar.timestamp,
                });
            }
        }
    }

    Ok(())
}

/// Sequential bar-by-bar trade simulator for a single symbol.
pub struct TradeSimulator<'a> {
    config: &'a BacktestConfig,
}

impl<'a> TradeSimulator<'a> {
    pub fn new(config: &'a BacktestConfig) -> Self {
        Self { config }
    }

    pub fn run(&self, inputs: SimulationInputs) -> Result<SimulationOutcome, DataError> {
        let SimulationInputs {
            symbol,
            bars,
            signals,
            volatility,
        } = inputs;

        validate_bars(bars)?;
        if signals.len() != bars.len() {
            return Err(DataError::MisalignedInput {
                what: "signal series",
                expected: bars.len(),
                actual: signals.len(),
            });
        }
        if volatility.len() != bars.len() {
            return Err(DataError::MisalignedInput {
                what: "volatility series",
                expected: bars.len(),
                actual: volatility.len(),
            });
        }

        let risk = &self.config.risk;
        let last_index = bars.len() - 1;
        let mut ledger = Ledger::new(self.config.initial_equity, risk.commission_rate);
        let mut state = PositionState::Flat;
        let mut equity_curve = Vec::with_capacity(bars.len());
        let mut skipped = Vec::new();
        let mut bars_in_market = 0usize;

        for (index, bar) in bars.iter().enumerate() {
            let signal = &signals[index];

            // Intrabar stop/target checks run before the close-driven signal
            if let PositionState::Open(position) = &state {
                if let Some((reason, price)) = intrabar_exit(bar, position) {
                    let position = position.clone();
                    ledger.close(position, price, bar.timestamp, reason);
                    state = PositionState::Flat;
                }
            }

            if risk.trailing_stop {
                if let PositionState::Open(position) = &mut state {
                    if let Some(stop) = compute_trailing_stop(TrailingStopParams {
                        close: bar.close,
                        atr: volatility[index],
                        atr_multiplier: risk.atr_stop_multiplier,
                        current_stop: position.stop_loss,
                        side: position.side,
                    }) {
                        position.stop_loss = stop;
                    }
                }
            }

            let mut exited_on_signal = false;
            if let PositionState::Open(position) = &state {
                if self.is_strong_opposing(position.side, signal) {
                    let position = position.clone();
                    ledger.close(position, bar.close, bar.timestamp, ExitReason::Signal);
                    state = PositionState::Flat;
                    exited_on_signal = true;
                }
            }

            if matches!(state, PositionState::Flat) && index < last_index {
                let desired_side = if exited_on_signal && !risk.reverse_on_exit {
                    None
                } else {
                    self.entry_side(signal)
                };

                if let Some(side) = desired_side {
                    match self.try_open(
                        symbol,
                        bar,
                        index,
                        side,
                        volatility[index],
                        &mut ledger,
                    ) {
                        EntryOutcome::Opened(position) => {
                            state = PositionState::Open(position);
                        }
                        EntryOutcome::Skipped { reason } => {
                            debug!(
                                "{} {}: skipped {} entry ({})",
                                symbol,
                                bar.timestamp,
                                side.as_str(),
                                reason
                            );
                            skipped.push(SkippedTrade {
                                timestamp: bar.timestamp,
                                side,
                                reason,
                            });
                        }
                    }
                }
            }

            if index == last_index {
                if let PositionState::Open(position) = &state {
                    let position = position.clone();
                    ledger.close(position, bar.close, bar.timestamp, ExitReason::EndOfData);
                    state = PositionState::Flat;
                }
            }

            let unrealized = state
                .position()
                .map(|position| position.unrealized_pnl(bar.close))
                .unwrap_or(0.0);
            if state.position().is_some() {
                bars_in_market += 1;
            }
            equity_curve.push(EquityPoint {
                timestamp: bar.timestamp,
                equity: ledger.equity + unrealized,
            });
        }

        Ok(SimulationOutcome {
            final_equity: ledger.equity,
            total_commission: ledger.total_commission,
            trades: ledger.trades,
            equity_curve,
            skipped,
            bars_in_market,
        })
    }

    fn entry_side(&self, signal: &Signal) -> Option<Side> {
        match signal.action {
            SignalAction::Buy => Some(Side::Long),
            SignalAction::Sell if self.config.risk.allow_short => Some(Side::Short),
            _ => None,
        }
    }

    fn is_strong_opposing(&self, side: Side, signal: &Signal) -> bool {
        let opposing = matches!(
            (side, signal.action),
            (Side::Long, SignalAction::Sell) | (Side::Short, SignalAction::Buy)
        );
        opposing && signal.strength > self.config.signals.exit_threshold
    }

    fn try_open(
        &self,
        symbol: &str,
        bar: &Bar,
        index: usize,
        side: Side,
        volatility: Option<f64>,
        ledger: &mut Ledger,
    ) -> EntryOutcome {
        let Some(volatility) = volatility else {
            return EntryOutcome::Skipped {
                reason: "volatility undefined during warm-up".to_string(),
            };
        };

        let risk = &self.config.risk;
        let plan = match size_position(PositionSizingParams {
            equity: ledger.equity,
            entry_price: bar.close,
            volatility,
            volatility_multiplier: risk.atr_stop_multiplier,
            side,
            max_risk_fraction: risk.max_risk_fraction,
            reward_risk_ratio: risk.reward_risk_ratio,
            max_position_fraction: Some(risk.max_position_fraction),
        }) {
            Ok(plan) => plan,
            Err(err) => {
                return EntryOutcome::Skipped {
                    reason: err.to_string(),
                }
            }
        };

        let equity_at_entry = ledger.equity;
        let entry_commission = ledger.charge(bar.close * plan.quantity);

        EntryOutcome::Opened(Position {
            symbol: symbol.to_string(),
            side,
            entry_price: bar.close,
            quantity: plan.quantity,
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit,
            opened_at: bar.timestamp,
            entry_index: index,
            entry_commission,
            equity_at_entry,
            risked_amount: plan.risked_amount,
        })
    }
}

/// Realized equity and the closed-trade ledger.
struct Ledger {
    equity: f64,
    commission_rate: f64,
    total_commission: f64,
    trades: Vec<Trade>,
}

impl Ledger {
    fn new(initial_equity: f64, commission_rate: f64) -> Self {
        Self {
            equity: initial_equity,
            commission_rate,
            total_commission: 0.0,
            trades: Vec::new(),
        }
    }

    fn charge(&mut self, notional: f64) -> f64 {
        let fee = commission(notional, self.commission_rate);
        self.equity -= fee;
        self.total_commission += fee;
        fee
    }

    fn close(
        &mut self,
        position: Position,
        exit_price: f64,
        exit_time: chrono::DateTime<chrono::Utc>,
        exit_reason: ExitReason,
    ) {
        let pnl = position.unrealized_pnl(exit_price);
        let exit_commission = self.charge(exit_price * position.quantity);
        self.equity += pnl;

        let commission = position.entry_commission + exit_commission;
        let exposure = position.notional();
        let pnl_percent = if exposure > 0.0 {
            (pnl - commission) / exposure * 100.0
        } else {
            0.0
        };

        self.trades.push(Trade {
            symbol: position.symbol,
            side: position.side,
            entry_time: position.opened_at,
            exit_time,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            pnl,
            commission,
            pnl_percent,
            exit_reason,
            equity_at_entry: position.equity_at_entry,
            risked_amount: position.risked_amount,
        });
    }
}
