use crate::error::ConfigError;
use crate::param_utils::{finite_param, get_flag_param, get_param_f64, get_usize_param_min};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Indicator periods. Part of the indicator cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub adx_period: usize,
    pub donchian_period: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            ema_fast: 50,
            ema_slow: 200,
            rsi_period: 14,
            atr_period: 14,
            adx_period: 14,
            donchian_period: 20,
        }
    }
}

/// Weights and thresholds for combining factor scores into a signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub trend_weight: f64,
    pub breakout_weight: f64,
    pub pullback_weight: f64,
    pub ml_weight: f64,
    pub threshold: f64,
    /// Minimum |score| of an opposing signal that closes an open position.
    pub exit_threshold: f64,
    pub adx_threshold: f64,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            trend_weight: 1.0,
            breakout_weight: 1.0,
            pullback_weight: 1.0,
            ml_weight: 0.3,
            threshold: 1.5,
            exit_threshold: 1.5,
            adx_threshold: 25.0,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
        }
    }
}

/// Configuration for sizing, stops and execution costs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_risk_fraction: f64,
    pub reward_risk_ratio: f64,
    pub atr_stop_multiplier: f64,
    pub max_position_fraction: f64,
    pub commission_rate: f64,
    pub allow_short: bool,
    pub reverse_on_exit: bool,
    pub trailing_stop: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_risk_fraction: 0.015,
            reward_risk_ratio: 2.0,
            atr_stop_multiplier: 2.0,
            max_position_fraction: 0.20,
            commission_rate: 0.001,
            allow_short: true,
            reverse_on_exit: false,
            trailing_stop: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub periods_per_year: f64,
    pub risk_free_rate: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        // Hourly bars, trading around the clock
        Self {
            periods_per_year: 24.0 * 365.0,
            risk_free_rate: 0.0,
        }
    }
}

/// Main backtest configuration struct that groups all parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub initial_equity: f64,
    pub indicators: IndicatorConfig,
    pub signals: SignalConfig,
    pub risk: RiskConfig,
    pub metrics: MetricsConfig,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_equity: 10_000.0,
            indicators: IndicatorConfig::default(),
            signals: SignalConfig::default(),
            risk: RiskConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl BacktestConfig {
    /// Create a new BacktestConfig from a parameter map
    pub fn from_parameters(parameters: &HashMap<String, f64>) -> Self {
        Self::default().with_overrides(parameters)
    }

    /// Copy of this config with every key present in `parameters` applied
    pub fn with_overrides(&self, parameters: &HashMap<String, f64>) -> Self {
        let p = parameters;
        let ind = &self.indicators;
        let sig = &self.signals;
        let risk = &self.risk;
        let metrics = &self.metrics;

        Self {
            initial_equity: get_param_f64(p, "initialEquity", self.initial_equity),
            indicators: IndicatorConfig {
                ema_fast: get_usize_param_min(p, "emaFast", ind.ema_fast, 1),
                ema_slow: get_usize_param_min(p, "emaSlow", ind.ema_slow, 1),
                rsi_period: get_usize_param_min(p, "rsiPeriod", ind.rsi_period, 1),
                atr_period: get_usize_param_min(p, "atrPeriod", ind.atr_period, 1),
                adx_period: get_usize_param_min(p, "adxPeriod", ind.adx_period, 1),
                donchian_period: get_usize_param_min(p, "donchianPeriod", ind.donchian_period, 1),
            },
            signals: SignalConfig {
                trend_weight: get_param_f64(p, "trendWeight", sig.trend_weight),
                breakout_weight: get_param_f64(p, "breakoutWeight", sig.breakout_weight),
                pullback_weight: get_param_f64(p, "pullbackWeight", sig.pullback_weight),
                ml_weight: get_param_f64(p, "mlWeight", sig.ml_weight),
                threshold: get_param_f64(p, "signalThreshold", sig.threshold),
                exit_threshold: get_param_f64(p, "exitThreshold", sig.exit_threshold),
                adx_threshold: get_param_f64(p, "adxThreshold", sig.adx_threshold),
                rsi_oversold: get_param_f64(p, "rsiOversold", sig.rsi_oversold),
                rsi_overbought: get_param_f64(p, "rsiOverbought", sig.rsi_overbought),
            },
            risk: RiskConfig {
                max_risk_fraction: get_param_f64(p, "maxRiskFraction", risk.max_risk_fraction),
                reward_risk_ratio: get_param_f64(p, "rewardRiskRatio", risk.reward_risk_ratio),
                atr_stop_multiplier: get_param_f64(
                    p,
                    "atrStopMultiplier",
                    risk.atr_stop_multiplier,
                ),
                max_position_fraction: get_param_f64(
                    p,
                    "maxPositionFraction",
                    risk.max_position_fraction,
                ),
                commission_rate: get_param_f64(p, "commissionRate", risk.commission_rate),
                allow_short: get_flag_param(p, "allowShort", risk.allow_short),
                reverse_on_exit: get_flag_param(p, "reverseOnExit", risk.reverse_on_exit),
                trailing_stop: get_flag_param(p, "trailingStop", risk.trailing_stop),
            },
            metrics: MetricsConfig {
                periods_per_year: finite_param(p, "periodsPerYear")
                    .unwrap_or(metrics.periods_per_year),
                risk_free_rate: finite_param(p, "riskFreeRate").unwrap_or(metrics.risk_free_rate),
            },
        }
    }

    /// Load a (possibly partial) JSON config; missing fields keep their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|err| anyhow!("Config file {} is invalid: {}", path.display(), err))
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        require_range("initialEquity", self.initial_equity, Bound::Open(0.0), None, "(0, inf)")?;

        let ind = &self.indicators;
        for (key, period) in [
            ("emaFast", ind.ema_fast),
            ("emaSlow", ind.ema_slow),
            ("rsiPeriod", ind.rsi_period),
            ("atrPeriod", ind.atr_period),
            ("adxPeriod", ind.adx_period),
            ("donchianPeriod", ind.donchian_period),
        ] {
            if period == 0 {
                return Err(ConfigError::OutOfRange {
                    key,
                    value: 0.0,
                    expected: "[1, inf)",
                });
            }
        }
        if ind.ema_fast >= ind.ema_slow {
            return Err(ConfigError::PeriodOrder {
                fast: ind.ema_fast,
                slow: ind.ema_slow,
            });
        }

        let sig = &self.signals;
        for (key, weight) in [
            ("trendWeight", sig.trend_weight),
            ("breakoutWeight", sig.breakout_weight),
            ("pullbackWeight", sig.pullback_weight),
            ("mlWeight", sig.ml_weight),
        ] {
            require_range(key, weight, Bound::Closed(0.0), None, "[0, inf)")?;
        }
        require_range("signalThreshold", sig.threshold, Bound::Closed(0.0), None, "[0, inf)")?;
        require_range(
            "exitThreshold",
            sig.exit_threshold,
            Bound::Closed(0.0),
            None,
            "[0, inf)",
        )?;
        require_range("adxThreshold", sig.adx_threshold, Bound::Closed(0.0), Some(100.0), "[0, 100]")?;
        require_range("rsiOversold", sig.rsi_oversold, Bound::Closed(0.0), Some(100.0), "[0, 100]")?;
        require_range(
            "rsiOverbought",
            sig.rsi_overbought,
            Bound::Closed(0.0),
            Some(100.0),
            "[0, 100]",
        )?;
        if sig.rsi_oversold >= sig.rsi_overbought {
            return Err(ConfigError::Invalid(format!(
                "rsiOversold ({}) must be below rsiOverbought ({})",
                sig.rsi_oversold, sig.rsi_overbought
            )));
        }

        let risk = &self.risk;
        require_range(
            "maxRiskFraction",
            risk.max_risk_fraction,
            Bound::Open(0.0),
            Some(0.05),
            "(0, 0.05]",
        )?;
        require_range(
            "rewardRiskRatio",
            risk.reward_risk_ratio,
            Bound::Open(0.0),
            None,
            "(0, inf)",
        )?;
        require_range(
            "atrStopMultiplier",
            risk.atr_stop_multiplier,
            Bound::Open(0.0),
            None,
            "(0, inf)",
        )?;
        require_range(
            "maxPositionFraction",
            risk.max_position_fraction,
            Bound::Open(0.0),
            Some(1.0),
            "(0, 1]",
        )?;
        require_range(
            "commissionRate",
            risk.commission_rate,
            Bound::Closed(0.0),
            None,
            "[0, 0.1)",
        )?;
        if risk.commission_rate >= 0.1 {
            return Err(ConfigError::OutOfRange {
                key: "commissionRate",
                value: risk.commission_rate,
                expected: "[0, 0.1)",
            });
        }

        require_range(
            "periodsPerYear",
            self.metrics.periods_per_year,
            Bound::Open(0.0),
            None,
            "(0, inf)",
        )?;
        require_range(
            "riskFreeRate",
            self.metrics.risk_free_rate,
            Bound::Closed(-1.0),
            Some(1.0),
            "[-1, 1]",
        )?;

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    TotalReturn,
    Sharpe,
}

impl Objective {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "return" | "total_return" => Ok(Self::TotalReturn),
            "sharpe" | "sharpe_ratio" => Ok(Self::Sharpe),
            other => Err(anyhow!(
                "Objective must be RETURN or SHARPE (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::TotalReturn => "total return",
            Self::Sharpe => "Sharpe ratio",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Bound {
    Open(f64),
    Closed(f64),
}

fn require_range(
    key: &'static str,
    value: f64,
    min: Bound,
    max: Option<f64>,
    expected: &'static str,
) -> std::result::Result<f64, ConfigError> {
    let out_of_range = ConfigError::OutOfRange {
        key,
        value,
        expected,
    };
    if !value.is_finite() {
        return Err(out_of_range);
    }
    let below = match min {
        Bound::Open(min_value) => value <= min_value,
        Bound::Closed(min_value) => value < min_value,
    };
    if below {
        return Err(out_of_range);
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(out_of_range);
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BacktestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.indicators.ema_fast, 50);
        assert_eq!(config.indicators.ema_slow, 200);
        assert!((config.risk.max_risk_fraction - 0.015).abs() < 1e-12);
        assert!((config.risk.commission_rate - 0.001).abs() < 1e-12);
    }

    #[test]
    fn from_parameters_maps_camel_case_keys() {
        let mut params = HashMap::new();
        params.insert("maxRiskFraction".to_string(), 0.01);
        params.insert("emaFast".to_string(), 20.0);
        params.insert("allowShort".to_string(), 0.0);
        params.insert("signalThreshold".to_string(), 2.0);
        params.insert("unknownKey".to_string(), 99.0);

        let config = BacktestConfig::from_parameters(&params);
        assert!((config.risk.max_risk_fraction - 0.01).abs() < 1e-12);
        assert_eq!(config.indicators.ema_fast, 20);
        assert!(!config.risk.allow_short);
        assert!((config.signals.threshold - 2.0).abs() < 1e-12);
        assert_eq!(config.indicators.ema_slow, 200);
    }

    #[test]
    fn overrides_keep_unspecified_fields_of_base() {
        let mut base = BacktestConfig::default();
        base.initial_equity = 50_000.0;
        let mut params = HashMap::new();
        params.insert("rewardRiskRatio".to_string(), 3.0);

        let config = base.with_overrides(&params);
        assert!((config.initial_equity - 50_000.0).abs() < 1e-9);
        assert!((config.risk.reward_risk_ratio - 3.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_non_positive_risk_fraction() {
        let mut config = BacktestConfig::default();
        config.risk.max_risk_fraction = 0.0;
        match config.validate() {
            Err(ConfigError::OutOfRange { key, .. }) => assert_eq!(key, "maxRiskFraction"),
            other => panic!("unexpected validation result: {:?}", other),
        }

        config.risk.max_risk_fraction = 0.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_ema_periods() {
        let mut config = BacktestConfig::default();
        config.indicators.ema_fast = 200;
        config.indicators.ema_slow = 50;
        assert_eq!(
            config.validate(),
            Err(ConfigError::PeriodOrder {
                fast: 200,
                slow: 50
            })
        );
    }

    #[test]
    fn rejects_non_finite_and_excessive_commission() {
        let mut config = BacktestConfig::default();
        config.risk.commission_rate = f64::NAN;
        assert!(config.validate().is_err());
        config.risk.commission_rate = 0.1;
        assert!(config.validate().is_err());
        config.risk.commission_rate = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: BacktestConfig =
            serde_json::from_str(r#"{"risk": {"max_risk_fraction": 0.02}}"#).unwrap();
        assert!((config.risk.max_risk_fraction - 0.02).abs() < 1e-12);
        assert!((config.risk.reward_risk_ratio - 2.0).abs() < 1e-12);
        assert_eq!(config.indicators, IndicatorConfig::default());
    }

    #[test]
    fn objective_parses_known_labels() {
        assert_eq!(Objective::parse("SHARPE").unwrap(), Objective::Sharpe);
        assert_eq!(Objective::parse("return").unwrap(), Objective::TotalReturn);
        assert!(Objective::parse("cagr").is_err());
    }
}
