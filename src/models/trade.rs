//! Trade records: the locally persisted intent behind each entry.
//!
//! The exchange only remembers orders it has accepted. The desired SL/TP of a
//! position lives here so it can be restored after a restart.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::PositionSide;

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            other => Err(format!("unknown order side: {}", other)),
        }
    }
}

/// Lifecycle of a trade record.
///
/// PENDING -> OPEN (market entry filled) or stays PENDING (limit resting)
/// PENDING/OPEN -> FILLED (reconciler attached protection)
/// PENDING -> CANCELLED (stale or rejected entry)
/// OPEN/FILLED -> CLOSED (position gone)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Pending,
    Open,
    Filled,
    Cancelled,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "PENDING",
            TradeStatus::Open => "OPEN",
            TradeStatus::Filled => "FILLED",
            TradeStatus::Cancelled => "CANCELLED",
            TradeStatus::Closed => "CLOSED",
        }
    }

    /// Terminal records are never picked up for protection recovery.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Cancelled | TradeStatus::Closed)
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TradeStatus::Pending),
            "OPEN" => Ok(TradeStatus::Open),
            "FILLED" => Ok(TradeStatus::Filled),
            "CANCELLED" => Ok(TradeStatus::Cancelled),
            "CLOSED" => Ok(TradeStatus::Closed),
            other => Err(format!("unknown trade status: {}", other)),
        }
    }
}

/// Persisted record of an entry and its intended protection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,

    pub symbol: String,

    pub side: PositionSide,

    /// Intended (or filled, for market entries) entry price
    pub entry_price: Decimal,

    /// Notional size in quote currency
    pub size: Decimal,

    /// Contract quantity sent to the exchange
    pub quantity: Decimal,

    pub leverage: u32,

    pub sl_price: Decimal,

    pub tp_price: Decimal,

    pub status: TradeStatus,

    /// Exchange id of the entry order, once accepted
    pub order_id: Option<String>,

    /// MARKET or LIMIT
    pub order_type: String,

    /// Last failure attached to this record, if any
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl TradeRecord {
    /// Whether this record carries usable protection targets.
    pub fn has_protection_targets(&self) -> bool {
        self.sl_price > Decimal::ZERO && self.tp_price > Decimal::ZERO
    }
}
