use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Set by the data provider when one or more intervals before this bar are missing.
    #[serde(default)]
    pub gap: bool,
}

/// An ordered bar sequence for one (symbol, timeframe).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarSeries {
    pub symbol: String,
    pub timeframe: String,
    pub bars: Vec<Bar>,
}

impl BarSeries {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>, bars: Vec<Bar>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            bars,
        }
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.bars.first().map(|bar| bar.timestamp)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|bar| bar.timestamp)
    }

    pub fn gap_count(&self) -> usize {
        self.bars.iter().filter(|bar| bar.gap).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Hold => "hold",
        }
    }

    /// +1 for buy, -1 for sell, 0 for hold.
    pub fn direction(&self) -> f64 {
        match self {
            SignalAction::Buy => 1.0,
            SignalAction::Sell => -1.0,
            SignalAction::Hold => 0.0,
        }
    }
}

impl FromStr for SignalAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" | "1" => Ok(SignalAction::Buy),
            "sell" | "-1" => Ok(SignalAction::Sell),
            "hold" | "0" => Ok(SignalAction::Hold),
            other => Err(anyhow!("Unknown signal action '{}'", other)),
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    Trend,
    Breakout,
    Pullback,
    Model,
}

impl FactorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactorKind::Trend => "trend",
            FactorKind::Breakout => "breakout",
            FactorKind::Pullback => "pullback",
            FactorKind::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalFactor {
    pub kind: FactorKind,
    /// Raw factor reading before weighting.
    pub value: f64,
    pub weight: f64,
}

impl SignalFactor {
    pub fn contribution(&self) -> f64 {
        self.value * self.weight
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    pub score: f64,
    pub strength: f64,
    pub factors: Vec<SignalFactor>,
}

impl Signal {
    pub fn hold() -> Self {
        Self {
            action: SignalAction::Hold,
            score: 0.0,
            strength: 0.0,
            factors: Vec::new(),
        }
    }

    pub fn reason(&self) -> String {
        let parts: Vec<String> = self
            .factors
            .iter()
            .filter(|factor| factor.contribution() != 0.0)
            .map(|factor| {
                let bullish = factor.contribution() > 0.0;
                match (factor.kind, bullish) {
                    (FactorKind::Trend, true) => "Bullish trend".to_string(),
                    (FactorKind::Trend, false) => "Bearish trend".to_string(),
                    (FactorKind::Breakout, true) => "Upward breakout".to_string(),
                    (FactorKind::Breakout, false) => "Downward breakout".to_string(),
                    (FactorKind::Pullback, true) => "Oversold pullback".to_string(),
                    (FactorKind::Pullback, false) => "Overbought pullback".to_string(),
                    (FactorKind::Model, true) => "ML: Bullish".to_string(),
                    (FactorKind::Model, false) => "ML: Bearish".to_string(),
                }
            })
            .collect();
        if parts.is_empty() {
            "No active factors".to_string()
        } else {
            parts.join(" | ")
        }
    }
}

/// Output of an external ML scorer for a single bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MlScore {
    pub action: SignalAction,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    pub fn is_short(&self) -> bool {
        matches!(self, Side::Short)
    }

    /// +1 for long exposure, -1 for short exposure.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub opened_at: DateTime<Utc>,
    pub entry_index: usize,
    pub entry_commission: f64,
    pub equity_at_entry: f64,
    pub risked_amount: f64,
}

impl Position {
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity * self.side.sign()
    }

    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Signal,
    EndOfData,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::Signal => "signal",
            ExitReason::EndOfData => "end_of_data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Gross realized pnl, before commission.
    pub pnl: f64,
    /// Entry plus exit commission.
    pub commission: f64,
    pub pnl_percent: f64,
    pub exit_reason: ExitReason,
    pub equity_at_entry: f64,
    pub risked_amount: f64,
}

impl Trade {
    pub fn net_pnl(&self) -> f64 {
        self.pnl - self.commission
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
}

/// A trade opportunity the simulator declined to take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedTrade {
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PerformanceMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_win_percent: f64,
    pub avg_loss_percent: f64,
    pub avg_trade_percent: f64,
    pub best_trade_percent: f64,
    pub worst_trade_percent: f64,
    pub total_return: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub profit_factor: Option<f64>,
    pub exposure_percent: f64,
    pub total_commission: f64,
    pub final_equity: f64,
    pub insufficient_data: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Partial { notes: Vec<String> },
    Failed { reason: String },
}

impl TaskStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Partial { .. } => "partial",
            TaskStatus::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbol: String,
    pub timeframe: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub initial_equity: f64,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub skipped: Vec<SkippedTrade>,
    pub metrics: PerformanceMetrics,
    pub status: TaskStatus,
}

impl BacktestResult {
    pub fn final_equity(&self) -> f64 {
        self.metrics.final_equity
    }

    pub fn summary_lines(&self) -> Vec<String> {
        let m = &self.metrics;
        let profit_factor = m
            .profit_factor
            .map(|value| format!("{:.2}", value))
            .unwrap_or_else(|| "n/a".to_string());
        vec![
            format!("Symbol: {} ({})", self.symbol, self.timeframe),
            format!("Status: {}", self.status.label()),
            format!("Total Return: {:.2}%", m.total_return * 100.0),
            format!("Sharpe Ratio: {:.2}", m.sharpe_ratio),
            format!("Max Drawdown: {:.2}%", m.max_drawdown * 100.0),
            format!("Win Rate: {:.2}%", m.win_rate * 100.0),
            format!("Total Trades: {}", m.total_trades),
            format!("Profit Factor: {}", profit_factor),
            format!("Avg Trade: {:.2}%", m.avg_trade_percent),
            format!("Best Trade: {:.2}%", m.best_trade_percent),
            format!("Worst Trade: {:.2}%", m.worst_trade_percent),
            format!("Exposure Time: {:.2}%", m.exposure_percent),
            format!("Final Equity: {:.2}", m.final_equity),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factor(kind: FactorKind, value: f64) -> SignalFactor {
        SignalFactor {
            kind,
            value,
            weight: 1.0,
        }
    }

    #[test]
    fn signal_action_parses_labels_and_numeric_classes() {
        assert_eq!("BUY".parse::<SignalAction>().unwrap(), SignalAction::Buy);
        assert_eq!("-1".parse::<SignalAction>().unwrap(), SignalAction::Sell);
        assert_eq!(" hold ".parse::<SignalAction>().unwrap(), SignalAction::Hold);
        assert!("maybe".parse::<SignalAction>().is_err());
    }

    #[test]
    fn signal_reason_lists_active_factors_in_order() {
        let signal = Signal {
            action: SignalAction::Buy,
            score: 2.3,
            strength: 2.3,
            factors: vec![
                factor(FactorKind::Trend, 1.0),
                factor(FactorKind::Breakout, 1.0),
                factor(FactorKind::Model, 0.3),
            ],
        };
        assert_eq!(
            signal.reason(),
            "Bullish trend | Upward breakout | ML: Bullish"
        );
        assert_eq!(Signal::hold().reason(), "No active factors");
    }

    #[test]
    fn short_position_profits_when_price_falls() {
        let position = Position {
            symbol: "BTCUSDT".to_string(),
            side: Side::Short,
            entry_price: 100.0,
            quantity: 2.0,
            stop_loss: 105.0,
            take_profit: 90.0,
            opened_at: Utc::now(),
            entry_index: 0,
            entry_commission: 0.2,
            equity_at_entry: 1_000.0,
            risked_amount: 10.0,
        };
        assert!((position.unrealized_pnl(95.0) - 10.0).abs() < 1e-9);
        assert!((position.unrealized_pnl(101.0) + 2.0).abs() < 1e-9);
    }
}
