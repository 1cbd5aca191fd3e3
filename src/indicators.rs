use crate::config::IndicatorConfig;
use crate::models::Bar;
use serde::{Deserialize, Serialize};

/// Indicator values for one bar. `None` marks a value still inside its warm-up window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub rsi: Option<f64>,
    pub atr: Option<f64>,
    pub adx: Option<f64>,
    pub di_plus: Option<f64>,
    pub di_minus: Option<f64>,
    pub donchian_upper: Option<f64>,
    pub donchian_lower: Option<f64>,
    pub donchian_mid: Option<f64>,
}

impl IndicatorSet {
    pub const NAMES: [&'static str; 10] = [
        "ema_fast",
        "ema_slow",
        "rsi",
        "atr",
        "adx",
        "di_plus",
        "di_minus",
        "donchian_upper",
        "donchian_lower",
        "donchian_mid",
    ];

    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "ema_fast" => self.ema_fast,
            "ema_slow" => self.ema_slow,
            "rsi" => self.rsi,
            "atr" => self.atr,
            "adx" => self.adx,
            "di_plus" => self.di_plus,
            "di_minus" => self.di_minus,
            "donchian_upper" => self.donchian_upper,
            "donchian_lower" => self.donchian_lower,
            "donchian_mid" => self.donchian_mid,
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        Self::NAMES.iter().all(|name| self.get(name).is_some())
    }
}

/// Bars a series needs before every indicator in `config` is defined.
pub fn warmup_length(config: &IndicatorConfig) -> usize {
    [
        config.ema_fast.saturating_sub(1),
        config.ema_slow.saturating_sub(1),
        config.rsi_period,
        config.atr_period,
        (2 * config.adx_period).saturating_sub(1),
        config.donchian_period.saturating_sub(1),
    ]
    .into_iter()
    .max()
    .unwrap_or(0)
}

/// Compute the full indicator table for a bar sequence.
///
/// Pure function of its inputs: the same bars and config always produce the
/// same table, which is what makes the result safe to cache.
pub fn compute_indicators(bars: &[Bar], config: &IndicatorConfig) -> Vec<IndicatorSet> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();

    let ema_fast = calculate_ema(&closes, config.ema_fast);
    let ema_slow = calculate_ema(&closes, config.ema_slow);
    let rsi = calculate_rsi(&closes, config.rsi_period);
    let atr = calculate_atr(&highs, &lows, &closes, config.atr_period);
    let adx = calculate_adx(&highs, &lows, &closes, config.adx_period);
    let (upper, lower, mid) = calculate_donchian(&highs, &lows, config.donchian_period);

    (0..bars.len())
        .map(|i| IndicatorSet {
            ema_fast: ema_fast[i],
            ema_slow: ema_slow[i],
            rsi: rsi[i],
            atr: atr[i],
            adx: adx[i].and_then(|out| out.adx),
            di_plus: adx[i].map(|out| out.pdi),
            di_minus: adx[i].map(|out| out.mdi),
            donchian_upper: upper[i],
            donchian_lower: lower[i],
            donchian_mid: mid[i],
        })
        .collect()
}

pub fn calculate_sma(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut sma_values = vec![None; prices.len()];
    if period == 0 || prices.len() < period {
        return sma_values;
    }

    let mut window_sum: f64 = prices[..period].iter().sum();
    sma_values[period - 1] = Some(window_sum / period as f64);
    for i in period..prices.len() {
        window_sum += prices[i] - prices[i - period];
        sma_values[i] = Some(window_sum / period as f64);
    }

    sma_values
}

/// EMA seeded with the SMA of the first `period` values.
pub fn calculate_ema(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut ema_values = vec![None; prices.len()];
    if period == 0 || prices.len() < period {
        return ema_values;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = prices[..period].iter().sum::<f64>() / period as f64;
    ema_values[period - 1] = Some(ema);
    for i in period..prices.len() {
        ema = (prices[i] * multiplier) + (ema * (1.0 - multiplier));
        ema_values[i] = Some(ema);
    }

    ema_values
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Wilder RSI, defined from index `period`.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut rsi_values = vec![None; prices.len()];
    if period == 0 || prices.len() < period + 1 {
        return rsi_values;
    }

    let mut sum_gain = 0.0f64;
    let mut sum_loss = 0.0f64;
    for i in 1..=period {
        let delta = prices[i] - prices[i - 1];
        if delta >= 0.0 {
            sum_gain += delta;
        } else {
            sum_loss += -delta;
        }
    }

    let mut avg_gain = sum_gain / period as f64;
    let mut avg_loss = sum_loss / period as f64;
    rsi_values[period] = Some(rsi_from_avgs(avg_gain, avg_loss));

    for i in (period + 1)..prices.len() {
        let delta = prices[i] - prices[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        rsi_values[i] = Some(rsi_from_avgs(avg_gain, avg_loss));
    }

    rsi_values
}

fn true_range(high: f64, low: f64, prev_close: f64) -> f64 {
    let high_low = high - low;
    let high_prev = (high - prev_close).abs();
    let low_prev = (low - prev_close).abs();
    high_low.max(high_prev).max(low_prev)
}

/// Wilder ATR aligned to bar indices, defined from index `period`.
pub fn calculate_atr(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    period: usize,
) -> Vec<Option<f64>> {
    let n = closes.len();
    let mut atr = vec![None; n];
    if period == 0 || n < period + 1 {
        return atr;
    }

    let mut tr_sum = 0.0f64;
    let mut prev_atr = 0.0f64;
    for i in 1..n {
        let tr = true_range(highs[i], lows[i], closes[i - 1]);
        if i <= period {
            tr_sum += tr;
            if i == period {
                prev_atr = tr_sum / period as f64;
                atr[i] = Some(prev_atr);
            }
        } else {
            prev_atr = ((prev_atr * (period as f64 - 1.0)) + tr) / period as f64;
            atr[i] = Some(prev_atr);
        }
    }

    atr
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ADXOutput {
    /// Undefined until enough DX readings have been smoothed.
    pub adx: Option<f64>,
    pub pdi: f64,
    pub mdi: f64,
}

/// Wilder ADX with +DI/-DI.
///
/// DI lines are defined from index `period`; ADX, a Wilder mean of DX, from
/// index `2 * period - 1`.
pub fn calculate_adx(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    period: usize,
) -> Vec<Option<ADXOutput>> {
    let n = closes.len();
    let mut outputs = vec![None; n];
    if period == 0 || n < period + 1 {
        return outputs;
    }

    let p = period as f64;
    let mut smoothed_tr = 0.0f64;
    let mut smoothed_plus = 0.0f64;
    let mut smoothed_minus = 0.0f64;
    let mut dx_sum = 0.0f64;
    let mut adx: Option<f64> = None;

    for i in 1..n {
        let tr = true_range(highs[i], lows[i], closes[i - 1]);
        let up_move = highs[i] - highs[i - 1];
        let down_move = lows[i - 1] - lows[i];
        let dm_plus = if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        };
        let dm_minus = if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        };

        if i <= period {
            smoothed_tr += tr;
            smoothed_plus += dm_plus;
            smoothed_minus += dm_minus;
            if i < period {
                continue;
            }
        } else {
            smoothed_tr = smoothed_tr - smoothed_tr / p + tr;
            smoothed_plus = smoothed_plus - smoothed_plus / p + dm_plus;
            smoothed_minus = smoothed_minus - smoothed_minus / p + dm_minus;
        }

        let (pdi, mdi) = if smoothed_tr > 0.0 {
            (
                100.0 * smoothed_plus / smoothed_tr,
                100.0 * smoothed_minus / smoothed_tr,
            )
        } else {
            (0.0, 0.0)
        };
        let di_sum = pdi + mdi;
        let dx = if di_sum > 0.0 {
            100.0 * (pdi - mdi).abs() / di_sum
        } else {
            0.0
        };

        // i runs from period; the first ADX needs `period` DX readings
        let dx_count = i + 1 - period;
        adx = match adx {
            Some(prev) => Some((prev * (p - 1.0) + dx) / p),
            None => {
                dx_sum += dx;
                if dx_count == period {
                    Some(dx_sum / p)
                } else {
                    None
                }
            }
        };

        outputs[i] = Some(ADXOutput { adx, pdi, mdi });
    }

    outputs
}

/// Donchian channel (upper, lower, mid) over `period` bars including the current one.
pub fn calculate_donchian(
    highs: &[f64],
    lows: &[f64],
    period: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let n = highs.len();
    let mut upper = vec![None; n];
    let mut lower = vec![None; n];
    let mut mid = vec![None; n];
    if period == 0 || n < period {
        return (upper, lower, mid);
    }

    for i in (period - 1)..n {
        let window_start = i + 1 - period;
        let hi = highs[window_start..=i]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let lo = lows[window_start..=i]
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        upper[i] = Some(hi);
        lower[i] = Some(lo);
        mid[i] = Some((hi + lo) / 2.0);
    }

    (upper, lower, mid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                timestamp: start + Duration::hours(i as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1_000.0,
                gap: false,
            })
            .collect()
    }

    fn small_config() -> IndicatorConfig {
        IndicatorConfig {
            ema_fast: 3,
            ema_slow: 5,
            rsi_period: 3,
            atr_period: 3,
            adx_period: 3,
            donchian_period: 4,
        }
    }

    #[test]
    fn sma_and_ema_mark_warmup_as_undefined() {
        let prices = [1.0, 2.0, 3.0, 4.0, 5.0];
        let sma = calculate_sma(&prices, 3);
        assert_eq!(sma[..2], [None, None]);
        assert_eq!(sma[2], Some(2.0));
        assert_eq!(sma[4], Some(4.0));

        let ema = calculate_ema(&prices, 3);
        assert_eq!(ema[1], None);
        assert_eq!(ema[2], Some(2.0));
        // multiplier 0.5: 4 * 0.5 + 2 * 0.5
        assert_eq!(ema[3], Some(3.0));
        assert_eq!(ema[4], Some(4.0));
    }

    #[test]
    fn short_series_yields_only_undefined_values() {
        let prices = [1.0, 2.0];
        assert!(calculate_ema(&prices, 5).iter().all(Option::is_none));
        assert!(calculate_rsi(&prices, 5).iter().all(Option::is_none));
        assert!(calculate_atr(&prices, &prices, &prices, 5)
            .iter()
            .all(Option::is_none));
    }

    #[test]
    fn rsi_saturates_on_monotonic_moves() {
        let rising: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        let rsi = calculate_rsi(&rising, 3);
        assert_eq!(rsi[2], None);
        assert_eq!(rsi[3], Some(100.0));
        assert_eq!(rsi[9], Some(100.0));

        let flat = vec![100.0; 10];
        assert_eq!(calculate_rsi(&flat, 3)[5], Some(50.0));
    }

    #[test]
    fn atr_of_constant_range_equals_range() {
        let closes = vec![100.0; 8];
        let highs = vec![101.0; 8];
        let lows = vec![99.0; 8];
        let atr = calculate_atr(&highs, &lows, &closes, 3);
        assert_eq!(atr[2], None);
        assert_eq!(atr[3], Some(2.0));
        assert_eq!(atr[7], Some(2.0));
    }

    #[test]
    fn adx_is_strong_and_positive_in_steady_uptrend() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + 2.0 * i as f64).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + 1.0).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 1.0).collect();
        let adx = calculate_adx(&highs, &lows, &closes, 3);

        assert!(adx[2].is_none());
        let first = adx[3].expect("DI defined at period");
        assert!(first.adx.is_none());
        assert!(adx[4].expect("DI defined").adx.is_none());
        let defined = adx[5].expect("ADX defined at 2p-1");
        assert!((defined.adx.unwrap() - 100.0).abs() < 1e-9);
        assert!(defined.pdi > defined.mdi);
        assert_eq!(defined.mdi, 0.0);
    }

    #[test]
    fn donchian_tracks_rolling_extremes() {
        let highs = [5.0, 7.0, 6.0, 4.0, 3.0];
        let lows = [1.0, 2.0, 0.5, 2.0, 2.5];
        let (upper, lower, mid) = calculate_donchian(&highs, &lows, 3);
        assert_eq!(upper[1], None);
        assert_eq!(upper[2], Some(7.0));
        assert_eq!(lower[2], Some(0.5));
        assert_eq!(upper[4], Some(6.0));
        assert_eq!(lower[4], Some(0.5));
        assert_eq!(mid[4], Some(3.25));
    }

    #[test]
    fn compute_indicators_is_deterministic_and_respects_warmup() {
        let closes: Vec<f64> = (0..30)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0)
            .collect();
        let bars = bars_from_closes(&closes);
        let config = small_config();

        let first = compute_indicators(&bars, &config);
        let second = compute_indicators(&bars, &config);
        assert_eq!(first, second);
        assert_eq!(first.len(), bars.len());

        let warmup = warmup_length(&config);
        assert_eq!(warmup, 5);
        assert!(!first[warmup - 1].is_complete());
        assert!(first[warmup..].iter().all(IndicatorSet::is_complete));
        assert!(first[0].get("ema_fast").is_none());
        assert_eq!(first[10].get("atr"), first[10].atr);
        assert_eq!(first[10].get("unknown"), None);
    }
}
