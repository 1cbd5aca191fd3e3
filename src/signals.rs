use crate::config::SignalConfig;
use crate::error::DataError;
use crate::indicators::IndicatorSet;
use crate::models::{Bar, FactorKind, MlScore, Signal, SignalAction, SignalFactor};

/// Inputs for combining one bar into a signal
pub struct SignalInputs<'a> {
    pub bar: &'a Bar,
    pub current: &'a IndicatorSet,
    /// Indicators of the preceding bar; breakouts compare against its channel.
    pub previous: Option<&'a IndicatorSet>,
    pub ml_score: Option<MlScore>,
}

pub fn trend_factor(indicators: &IndicatorSet, config: &SignalConfig) -> f64 {
    match (indicators.ema_fast, indicators.ema_slow, indicators.adx) {
        (Some(fast), Some(slow), Some(adx)) if adx > config.adx_threshold => {
            if fast > slow {
                1.0
            } else if fast < slow {
                -1.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

pub fn breakout_factor(close: f64, previous: Option<&IndicatorSet>) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };
    if matches!(previous.donchian_upper, Some(upper) if close > upper) {
        1.0
    } else if matches!(previous.donchian_lower, Some(lower) if close < lower) {
        -1.0
    } else {
        0.0
    }
}

pub fn pullback_factor(indicators: &IndicatorSet, config: &SignalConfig) -> f64 {
    match indicators.rsi {
        Some(rsi) if rsi < config.rsi_oversold => 1.0,
        Some(rsi) if rsi > config.rsi_overbought => -1.0,
        _ => 0.0,
    }
}

pub fn model_factor(ml_score: Option<MlScore>) -> f64 {
    match ml_score {
        Some(score) if score.confidence.is_finite() => {
            score.action.direction() * score.confidence.clamp(0.0, 1.0)
        }
        _ => 0.0,
    }
}

/// Map a combined score to an action. A score exactly on the threshold holds.
pub fn classify_score(score: f64, threshold: f64) -> SignalAction {
    if score > threshold {
        SignalAction::Buy
    } else if score < -threshold {
        SignalAction::Sell
    } else {
        SignalAction::Hold
    }
}

pub fn combine_bar(inputs: SignalInputs, config: &SignalConfig) -> Signal {
    let SignalInputs {
        bar,
        current,
        previous,
        ml_score,
    } = inputs;

    let candidates = [
        (FactorKind::Trend, trend_factor(current, config), config.trend_weight),
        (
            FactorKind::Breakout,
            breakout_factor(bar.close, previous),
            config.breakout_weight,
        ),
        (
            FactorKind::Pullback,
            pullback_factor(current, config),
            config.pullback_weight,
        ),
        (FactorKind::Model, model_factor(ml_score), config.ml_weight),
    ];

    let factors: Vec<SignalFactor> = candidates
        .into_iter()
        .filter(|(_, value, _)| *value != 0.0)
        .map(|(kind, value, weight)| SignalFactor {
            kind,
            value,
            weight,
        })
        .collect();

    let score: f64 = factors.iter().map(SignalFactor::contribution).sum();
    let action = classify_score(score, config.threshold);

    Signal {
        action,
        score,
        strength: score.abs(),
        factors,
    }
}

/// Combine a whole series. `ml_scores`, when given, must align with `bars`.
pub fn combine_signals(
    bars: &[Bar],
    indicators: &[IndicatorSet],
    ml_scores: Option<&[Option<MlScore>]>,
    config: &SignalConfig,
) -> Result<Vec<Signal>, DataError> {
    if indicators.len() != bars.len() {
        return Err(DataError::MisalignedInput {
            what: "indicator table",
            expected: bars.len(),
            actual: indicators.len(),
        });
    }
    if let Some(scores) = ml_scores {
        if scores.len() != bars.len() {
            return Err(DataError::MisalignedInput {
                what: "ml score series",
                expected: bars.len(),
                actual: scores.len(),
            });
        }
    }

    Ok(bars
        .iter()
        .enumerate()
        .map(|(i, bar)| {
            combine_bar(
                SignalInputs {
                    bar,
                    current: &indicators[i],
                    previous: i.checked_sub(1).map(|prev| &indicators[prev]),
                    ml_score: ml_scores.and_then(|scores| scores[i]),
                },
                config,
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(close: f64) -> Bar {
        Bar {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            gap: false,
        }
    }

    fn bullish_trend() -> IndicatorSet {
        IndicatorSet {
            ema_fast: Some(105.0),
            ema_slow: Some(100.0),
            adx: Some(30.0),
            rsi: Some(50.0),
            ..IndicatorSet::default()
        }
    }

    #[test]
    fn trend_requires_adx_above_threshold() {
        let config = SignalConfig::default();
        let mut indicators = bullish_trend();
        assert_eq!(trend_factor(&indicators, &config), 1.0);

        indicators.adx = Some(25.0);
        assert_eq!(trend_factor(&indicators, &config), 0.0);

        indicators.adx = None;
        assert_eq!(trend_factor(&indicators, &config), 0.0);
    }

    #[test]
    fn breakout_compares_against_previous_channel() {
        let previous = IndicatorSet {
            donchian_upper: Some(110.0),
            donchian_lower: Some(90.0),
            ..IndicatorSet::default()
        };
        assert_eq!(breakout_factor(111.0, Some(&previous)), 1.0);
        assert_eq!(breakout_factor(110.0, Some(&previous)), 0.0);
        assert_eq!(breakout_factor(89.0, Some(&previous)), -1.0);
        assert_eq!(breakout_factor(200.0, None), 0.0);
    }

    #[test]
    fn model_factor_clamps_confidence_and_treats_absence_as_neutral() {
        let score = MlScore {
            action: SignalAction::Sell,
            confidence: 1.7,
        };
        assert_eq!(model_factor(Some(score)), -1.0);
        assert_eq!(model_factor(None), 0.0);
    }

    #[test]
    fn score_equal_to_threshold_resolves_to_hold() {
        assert_eq!(classify_score(1.5, 1.5), SignalAction::Hold);
        assert_eq!(classify_score(-1.5, 1.5), SignalAction::Hold);
        assert_eq!(classify_score(1.5000001, 1.5), SignalAction::Buy);
        assert_eq!(classify_score(-1.5000001, 1.5), SignalAction::Sell);
    }

    #[test]
    fn combiner_holds_when_weighted_sum_lands_exactly_on_threshold() {
        let config = SignalConfig {
            threshold: 1.0,
            ..SignalConfig::default()
        };
        let signal = combine_bar(
            SignalInputs {
                bar: &bar(100.0),
                current: &bullish_trend(),
                previous: None,
                ml_score: None,
            },
            &config,
        );
        assert_eq!(signal.score, 1.0);
        assert_eq!(signal.action, SignalAction::Hold);
    }

    #[test]
    fn combiner_adds_weighted_ml_confidence() {
        let config = SignalConfig::default();
        let previous = IndicatorSet {
            donchian_upper: Some(99.0),
            donchian_lower: Some(90.0),
            ..IndicatorSet::default()
        };
        let signal = combine_bar(
            SignalInputs {
                bar: &bar(100.0),
                current: &bullish_trend(),
                previous: Some(&previous),
                ml_score: Some(MlScore {
                    action: SignalAction::Buy,
                    confidence: 0.5,
                }),
            },
            &config,
        );
        assert!((signal.score - 2.15).abs() < 1e-12);
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.factors.len(), 3);
        assert_eq!(
            signal.reason(),
            "Bullish trend | Upward breakout | ML: Bullish"
        );
    }

    #[test]
    fn combine_signals_rejects_misaligned_inputs() {
        let bars = vec![bar(1.0), bar(2.0)];
        let indicators = vec![IndicatorSet::default()];
        assert!(matches!(
            combine_signals(&bars, &indicators, None, &SignalConfig::default()),
            Err(DataError::MisalignedInput { .. })
        ));
    }

    #[test]
    fn warmup_bars_hold() {
        let bars = vec![bar(1.0), bar(2.0), bar(3.0)];
        let indicators = vec![IndicatorSet::default(); 3];
        let signals =
            combine_signals(&bars, &indicators, None, &SignalConfig::default()).unwrap();
        assert!(signals.iter().all(|s| s.action == SignalAction::Hold));
        assert!(signals.iter().all(|s| s.factors.is_empty()));
    }
}
