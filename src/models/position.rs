//! Position model: the exchange's view of an open leveraged position.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::TradeSide;

/// Direction of a position. Fixed for the lifetime of the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    /// Order side that opens this position.
    pub fn entry_side(&self) -> TradeSide {
        match self {
            PositionSide::Long => TradeSide::Buy,
            PositionSide::Short => TradeSide::Sell,
        }
    }

    /// Order side that closes this position.
    pub fn close_side(&self) -> TradeSide {
        match self {
            PositionSide::Long => TradeSide::Sell,
            PositionSide::Short => TradeSide::Buy,
        }
    }

    /// Price move from `entry` to `price` as a fraction of entry, positive when in our favor.
    pub fn favorable_move(&self, entry: Decimal, price: Decimal) -> Decimal {
        if entry.is_zero() {
            return Decimal::ZERO;
        }
        match self {
            PositionSide::Long => (price - entry) / entry,
            PositionSide::Short => (entry - price) / entry,
        }
    }

    /// Price at `offset` (fraction of entry) in the favorable direction.
    /// Negative offsets land on the losing side of entry.
    pub fn price_at_offset(&self, entry: Decimal, offset: Decimal) -> Decimal {
        match self {
            PositionSide::Long => entry * (Decimal::ONE + offset),
            PositionSide::Short => entry * (Decimal::ONE - offset),
        }
    }

    /// True when `candidate` protects more profit (or risks less) than `current`.
    pub fn is_tighter(&self, candidate: Decimal, current: Decimal) -> bool {
        match self {
            PositionSide::Long => candidate > current,
            PositionSide::Short => candidate < current,
        }
    }

    /// True when `candidate` is a more ambitious take-profit than `current`.
    pub fn is_further(&self, candidate: Decimal, current: Decimal) -> bool {
        match self {
            PositionSide::Long => candidate > current,
            PositionSide::Short => candidate < current,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Ok(PositionSide::Long),
            "SHORT" | "SELL" => Ok(PositionSide::Short),
            other => Err(format!("unknown position side: {}", other)),
        }
    }
}

/// Open position as reported by the exchange. Refreshed every poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Exchange symbol, e.g. BTCUSDT
    pub symbol: String,

    pub side: PositionSide,

    /// Average entry price
    pub entry_price: Decimal,

    /// Absolute contract quantity, always > 0 while open
    pub quantity: Decimal,

    pub leverage: u32,

    /// Last time the exchange touched this position
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Unrealized P&L at the given price.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - price) * self.quantity,
        }
    }

    /// Identity of this particular position instance. Changes when the
    /// position is closed and reopened at a different price or direction.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.symbol, self.side.as_str(), self.entry_price.normalize())
    }
}
