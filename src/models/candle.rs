//! OHLC candle used by the backtest replay.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One bar of historical price data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    #[serde(alias = "time", alias = "timestamp")]
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: Decimal,
}

impl Candle {
    /// Highest favorable move inside this bar relative to `entry`.
    pub fn best_move(&self, side: super::PositionSide, entry: Decimal) -> Decimal {
        match side {
            super::PositionSide::Long => side.favorable_move(entry, self.high),
            super::PositionSide::Short => side.favorable_move(entry, self.low),
        }
    }

    /// A bar is usable when its prices are positive and consistent.
    pub fn is_well_formed(&self) -> bool {
        self.low > Decimal::ZERO
            && self.low <= self.high
            && self.open >= self.low
            && self.open <= self.high
            && self.close >= self.low
            && self.close <= self.high
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionSide;
    use rust_decimal_macros::dec;

    #[test]
    fn test_candle_from_json() {
        let json = r#"{"time":"2024-01-01T00:00:00Z","open":"100","high":"101","low":"99","close":"100.5"}"#;
        let candle: Candle = serde_json::from_str(json).unwrap();

        assert_eq!(candle.high, dec!(101));
        assert_eq!(candle.volume, Decimal::ZERO);
        assert!(candle.is_well_formed());
        assert_eq!(candle.best_move(PositionSide::Long, dec!(100)), dec!(0.01));
        assert_eq!(candle.best_move(PositionSide::Short, dec!(100)), dec!(0.01));
    }
}
