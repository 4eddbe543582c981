//! Fixed-risk position sizing for leveraged entries.
//!
//! notional = balance * max_drawdown_per_trade / (default_sl_pct * leverage)
//! margin   = notional / leverage
//!
//! Small accounts are lifted to the exchange's minimum notional when the
//! resulting margin still fits within `max_margin_fraction` of the balance.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::error::RejectReason;
use crate::models::PositionSide;
use super::RiskConfig;

/// Output of the sizer: what to post and how large the position is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizingPlan {
    pub side: PositionSide,
    pub leverage: u32,
    /// Collateral posted, in quote currency
    pub margin: Decimal,
    /// Position value, margin * leverage
    pub notional: Decimal,
    /// Raised to the exchange minimum notional
    pub floored: bool,
}

/// Deterministic, side-effect-free sizer.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: RiskConfig,
}

impl PositionSizer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Size an entry for the given balance and signal confidence (0-100).
    pub fn size(&self, balance: Decimal, confidence: Decimal, side: PositionSide) -> Result<SizingPlan, RejectReason> {
        if confidence < self.config.min_confidence {
            return Err(RejectReason::LowConfidence {
                confidence,
                minimum: self.config.min_confidence,
            });
        }
        if confidence > dec!(100) {
            return Err(RejectReason::InvalidInput(format!("confidence {} above 100", confidence)));
        }
        if balance <= Decimal::ZERO {
            return Err(RejectReason::InvalidInput(format!("balance {} must be positive", balance)));
        }

        let leverage = Decimal::from(self.config.base_leverage);
        let max_margin = balance * self.config.max_margin_fraction;

        let risk_amount = balance * self.config.max_drawdown_per_trade;
        let mut notional = risk_amount / (self.config.default_sl_pct * leverage);
        let mut margin = notional / leverage;
        let mut floored = false;

        if notional < self.config.min_notional {
            let floor_margin = self.config.min_notional / leverage;
            if floor_margin > max_margin {
                return Err(RejectReason::InsufficientBalance {
                    balance,
                    required_margin: floor_margin,
                });
            }
            notional = self.config.min_notional;
            margin = floor_margin;
            floored = true;
        }

        if margin > max_margin {
            margin = max_margin;
            notional = margin * leverage;
        }

        Ok(SizingPlan {
            side,
            leverage: self.config.base_leverage,
            margin,
            notional,
            floored,
        })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer() -> PositionSizer {
        PositionSizer::new(RiskConfig::default())
    }

    #[test]
    fn test_low_confidence_never_sizes() {
        let sizer = sizer();
        for confidence in [dec!(-5), dec!(0), dec!(10), dec!(19.99)] {
            for balance in [dec!(-1), dec!(0), dec!(50), dec!(1_000_000)] {
                let result = sizer.size(balance, confidence, PositionSide::Long);
                assert!(
                    matches!(result, Err(RejectReason::LowConfidence { .. })),
                    "confidence {} balance {} gave {:?}",
                    confidence,
                    balance,
                    result
                );
            }
        }
    }

    #[test]
    fn test_fixed_risk_formula() {
        // Large balance so the minimum notional floor does not apply
        let plan = sizer().size(dec!(100_000), dec!(80), PositionSide::Short).unwrap();

        // 100000 * 0.02 / (0.005 * 150) = 2666.66..
        assert_eq!(plan.notional.round_dp(2), dec!(2666.67));
        assert_eq!(plan.margin, plan.notional / dec!(150));
        assert_eq!(plan.leverage, 150);
        assert_eq!(plan.side, PositionSide::Short);
        assert!(!plan.floored);
    }

    #[test]
    fn test_small_balance_floors_to_min_notional() {
        let plan = sizer().size(dec!(1000), dec!(50), PositionSide::Long).unwrap();

        assert!(plan.floored);
        assert_eq!(plan.notional, dec!(101));
        assert_eq!(plan.margin, dec!(101) / dec!(150));
    }

    #[test]
    fn test_insufficient_balance_for_floor() {
        // Floor margin is 101/150 ~= 0.673, more than 98% of 0.5
        let result = sizer().size(dec!(0.5), dec!(50), PositionSide::Long);
        assert!(matches!(result, Err(RejectReason::InsufficientBalance { .. })));
    }

    #[test]
    fn test_margin_never_exceeds_fraction_of_balance() {
        let config = RiskConfig {
            base_leverage: 1,
            default_sl_pct: dec!(0.001),
            max_drawdown_per_trade: dec!(0.5),
            ..RiskConfig::default()
        };
        let sizer = PositionSizer::new(config);

        for balance in [dec!(101), dec!(500), dec!(10_000), dec!(1_234_567)] {
            for confidence in [dec!(20), dec!(55), dec!(100)] {
                let plan = sizer.size(balance, confidence, PositionSide::Long).unwrap();
                let max_margin = balance * dec!(0.98);
                assert!(plan.margin <= max_margin);
                assert!(plan.notional <= max_margin * Decimal::from(plan.leverage));
            }
        }
    }

    #[test]
    fn test_invalid_inputs() {
        let sizer = sizer();
        assert!(matches!(
            sizer.size(dec!(0), dec!(50), PositionSide::Long),
            Err(RejectReason::InvalidInput(_))
        ));
        assert!(matches!(
            sizer.size(dec!(1000), dec!(101), PositionSide::Long),
            Err(RejectReason::InvalidInput(_))
        ));
    }
}
