use crate::error::SizingError;
use crate::models::{Bar, ExitReason, Position, Side};

pub const PRICE_EPSILON: f64 = 1e-6;

pub struct PositionSizingParams {
    pub equity: f64,
    pub entry_price: f64,
    /// Volatility measure in price units (ATR).
    pub volatility: f64,
    pub volatility_multiplier: f64,
    pub side: Side,
    pub max_risk_fraction: f64,
    pub reward_risk_ratio: f64,
    /// Upper bound on notional as a fraction of equity.
    pub max_position_fraction: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionPlan {
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub stop_distance: f64,
    pub risked_amount: f64,
    /// True when the notional cap reduced the risk-based quantity.
    pub capped: bool,
}

/// Fixed-fractional sizing: risk `equity * max_risk_fraction` over a stop
/// placed `volatility * multiplier` away from the entry.
pub fn size_position(params: PositionSizingParams) -> Result<PositionPlan, SizingError> {
    let PositionSizingParams {
        equity,
        entry_price,
        volatility,
        volatility_multiplier,
        side,
        max_risk_fraction,
        reward_risk_ratio,
        max_position_fraction,
    } = params;

    if !equity.is_finite() || equity <= 0.0 {
        return Err(SizingError::InvalidInput {
            reason: format!("equity must be positive (value: {})", equity),
        });
    }
    if !entry_price.is_finite() || entry_price <= 0.0 {
        return Err(SizingError::InvalidInput {
            reason: format!("entry price must be positive (value: {})", entry_price),
        });
    }
    if !max_risk_fraction.is_finite() || max_risk_fraction <= 0.0 {
        return Err(SizingError::InvalidInput {
            reason: format!("risk fraction must be positive (value: {})", max_risk_fraction),
        });
    }
    if !reward_risk_ratio.is_finite() || reward_risk_ratio <= 0.0 {
        return Err(SizingError::InvalidInput {
            reason: format!("reward:risk must be positive (value: {})", reward_risk_ratio),
        });
    }

    let stop_distance = volatility * volatility_multiplier;
    if !stop_distance.is_finite() || stop_distance <= 0.0 {
        return Err(SizingError::InvalidRiskParameters { stop_distance });
    }

    let (stop_loss, take_profit) = match side {
        Side::Long => (
            entry_price - stop_distance,
            entry_price + stop_distance * reward_risk_ratio,
        ),
        Side::Short => (
            entry_price + stop_distance,
            entry_price - stop_distance * reward_risk_ratio,
        ),
    };
    if stop_loss <= 0.0 {
        return Err(SizingError::InvalidInput {
            reason: format!(
                "stop distance {} reaches below zero from entry {}",
                stop_distance, entry_price
            ),
        });
    }

    let risk_budget = equity * max_risk_fraction;
    let mut quantity = risk_budget / stop_distance;
    let mut capped = false;

    if let Some(fraction) = max_position_fraction.filter(|f| f.is_finite() && *f > 0.0) {
        let max_quantity = equity * fraction / entry_price;
        if quantity > max_quantity {
            quantity = max_quantity;
            capped = true;
        }
    }

    if !quantity.is_finite() || quantity <= 0.0 {
        return Err(SizingError::InvalidInput {
            reason: format!("computed quantity {} is not tradable", quantity),
        });
    }

    Ok(PositionPlan {
        quantity,
        stop_loss,
        take_profit: take_profit.max(0.0),
        stop_distance,
        risked_amount: quantity * stop_distance,
        capped,
    })
}

pub fn commission(notional: f64, rate: f64) -> f64 {
    notional.abs() * rate
}

/// Fill price for a stop touched during `bar`. A bar that opens beyond the
/// stop fills at the open.
pub fn stop_loss_exit_price(bar: &Bar, stop_loss: f64, side: Side) -> Option<f64> {
    match side {
        Side::Long if bar.low <= stop_loss => Some(bar.open.min(stop_loss)),
        Side::Short if bar.high >= stop_loss => Some(bar.open.max(stop_loss)),
        _ => None,
    }
}

pub fn take_profit_exit_price(bar: &Bar, take_profit: f64, side: Side) -> Option<f64> {
    match side {
        Side::Long if bar.high >= take_profit => Some(take_profit),
        Side::Short if bar.low <= take_profit => Some(take_profit),
        _ => None,
    }
}

/// Intrabar exit for an open position. When a bar touches both levels the
/// stop is assumed to have been hit first.
pub fn intrabar_exit(bar: &Bar, position: &Position) -> Option<(ExitReason, f64)> {
    if let Some(price) = stop_loss_exit_price(bar, position.stop_loss, position.side) {
        return Some((ExitReason::StopLoss, price));
    }
    take_profit_exit_price(bar, position.take_profit, position.side)
        .map(|price| (ExitReason::TakeProfit, price))
}

pub struct TrailingStopParams {
    pub close: f64,
    pub atr: Option<f64>,
    pub atr_multiplier: f64,
    pub current_stop: f64,
    pub side: Side,
}

/// Ratchet a stop toward price. Returns the new stop only when it tightens.
pub fn compute_trailing_stop(params: TrailingStopParams) -> Option<f64> {
    let TrailingStopParams {
        close,
        atr,
        atr_multiplier,
        current_stop,
        side,
    } = params;

    let atr = atr.filter(|value| value.is_finite() && *value > 0.0)?;
    if atr_multiplier <= 0.0 {
        return None;
    }
    let potential = match side {
        Side::Long => close - atr_multiplier * atr,
        Side::Short => close + atr_multiplier * atr,
    };
    let tightens = match side {
        Side::Long => potential > current_stop + PRICE_EPSILON,
        Side::Short => potential < current_stop - PRICE_EPSILON,
    };
    if tightens && potential > 0.0 {
        Some(potential)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn params(equity: f64, entry_price: f64, volatility: f64, side: Side) -> PositionSizingParams {
        PositionSizingParams {
            equity,
            entry_price,
            volatility,
            volatility_multiplier: 1.0,
            side,
            max_risk_fraction: 0.01,
            reward_risk_ratio: 2.0,
            max_position_fraction: None,
        }
    }

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: 1.0,
            gap: false,
        }
    }

    fn long_position(stop_loss: f64, take_profit: f64) -> Position {
        Position {
            symbol: "T".to_string(),
            side: Side::Long,
            entry_price: 100.0,
            quantity: 1.0,
            stop_loss,
            take_profit,
            opened_at: Utc.with_ymd_and_hms(2024, 4, 30, 0, 0, 0).unwrap(),
            entry_index: 0,
            entry_commission: 0.0,
            equity_at_entry: 1_000.0,
            risked_amount: 2.0,
        }
    }

    #[test]
    fn sizes_quantity_from_fixed_fractional_risk() {
        let plan = size_position(params(10_000.0, 1_000.0, 50.0, Side::Long)).unwrap();
        assert!((plan.quantity - 2.0).abs() < 1e-12);
        assert!((plan.stop_loss - 950.0).abs() < 1e-12);
        assert!((plan.take_profit - 1_100.0).abs() < 1e-12);
        assert!((plan.risked_amount - 100.0).abs() < 1e-9);
        assert!(!plan.capped);
    }

    #[test]
    fn short_levels_mirror_long_levels() {
        let plan = size_position(params(10_000.0, 100.0, 2.0, Side::Short)).unwrap();
        assert!((plan.stop_loss - 102.0).abs() < 1e-12);
        assert!((plan.take_profit - 96.0).abs() < 1e-12);
    }

    #[test]
    fn degenerate_volatility_is_invalid_risk() {
        for volatility in [0.0, -1.0, f64::NAN] {
            match size_position(params(10_000.0, 100.0, volatility, Side::Long)) {
                Err(SizingError::InvalidRiskParameters { .. }) => {}
                other => panic!("unexpected sizing result: {:?}", other),
            }
        }
    }

    #[test]
    fn rejects_stop_below_zero_and_bad_equity() {
        assert!(matches!(
            size_position(params(10_000.0, 10.0, 20.0, Side::Long)),
            Err(SizingError::InvalidInput { .. })
        ));
        assert!(matches!(
            size_position(params(0.0, 10.0, 1.0, Side::Long)),
            Err(SizingError::InvalidInput { .. })
        ));
    }

    #[test]
    fn notional_cap_reduces_quantity_and_risk() {
        let mut p = params(10_000.0, 100.0, 1.0, Side::Long);
        p.max_position_fraction = Some(0.2);
        let plan = size_position(p).unwrap();
        // risk-based quantity would be 100 (notional 10_000)
        assert!((plan.quantity - 20.0).abs() < 1e-9);
        assert!((plan.risked_amount - 20.0).abs() < 1e-9);
        assert!(plan.capped);
    }

    #[test]
    fn stop_fills_at_open_when_bar_gaps_through() {
        assert_eq!(
            stop_loss_exit_price(&bar(97.0, 99.0, 96.0, 98.0), 98.0, Side::Long),
            Some(97.0)
        );
        assert_eq!(
            stop_loss_exit_price(&bar(100.0, 101.0, 97.0, 99.0), 98.0, Side::Long),
            Some(98.0)
        );
        assert_eq!(
            stop_loss_exit_price(&bar(104.0, 105.0, 103.0, 104.0), 102.0, Side::Short),
            Some(104.0)
        );
        assert_eq!(
            stop_loss_exit_price(&bar(100.0, 101.0, 99.0, 100.0), 98.0, Side::Long),
            None
        );
    }

    #[test]
    fn stop_wins_when_both_levels_touched() {
        let position = long_position(98.0, 104.0);
        let wide_bar = bar(100.0, 105.0, 97.0, 103.0);
        assert_eq!(
            intrabar_exit(&wide_bar, &position),
            Some((ExitReason::StopLoss, 98.0))
        );

        let up_bar = bar(101.0, 104.5, 100.5, 104.0);
        assert_eq!(
            intrabar_exit(&up_bar, &position),
            Some((ExitReason::TakeProfit, 104.0))
        );
    }

    #[test]
    fn trailing_stop_only_tightens() {
        let raised = compute_trailing_stop(TrailingStopParams {
            close: 110.0,
            atr: Some(2.0),
            atr_multiplier: 2.0,
            current_stop: 98.0,
            side: Side::Long,
        });
        assert_eq!(raised, Some(106.0));

        let loosened = compute_trailing_stop(TrailingStopParams {
            close: 99.0,
            atr: Some(2.0),
            atr_multiplier: 2.0,
            current_stop: 98.0,
            side: Side::Long,
        });
        assert_eq!(loosened, None);

        let short = compute_trailing_stop(TrailingStopParams {
            close: 90.0,
            atr: Some(1.0),
            atr_multiplier: 2.0,
            current_stop: 102.0,
            side: Side::Short,
        });
        assert_eq!(short, Some(92.0));

        let warmup = compute_trailing_stop(TrailingStopParams {
            close: 110.0,
            atr: None,
            atr_multiplier: 2.0,
            current_stop: 98.0,
            side: Side::Long,
        });
        assert_eq!(warmup, None);
    }
}
