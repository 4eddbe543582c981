//! Order models shared by the exchange adapter and the control loops.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::TradeSide;

/// Exchange order type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    StopMarket,
    TakeProfitMarket,
    Other(String),
}

impl OrderKind {
    pub fn as_str(&self) -> &str {
        match self {
            OrderKind::Market => "MARKET",
            OrderKind::Limit => "LIMIT",
            OrderKind::StopMarket => "STOP_MARKET",
            OrderKind::TakeProfitMarket => "TAKE_PROFIT_MARKET",
            OrderKind::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "MARKET" => OrderKind::Market,
            "LIMIT" => OrderKind::Limit,
            "STOP_MARKET" => OrderKind::StopMarket,
            "TAKE_PROFIT_MARKET" => OrderKind::TakeProfitMarket,
            other => OrderKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which protective leg an order represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtectionKind {
    Stop,
    TakeProfit,
}

impl ProtectionKind {
    pub fn order_kind(&self) -> OrderKind {
        match self {
            ProtectionKind::Stop => OrderKind::StopMarket,
            ProtectionKind::TakeProfit => OrderKind::TakeProfitMarket,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProtectionKind::Stop => "SL",
            ProtectionKind::TakeProfit => "TP",
        }
    }
}

/// An order resting on the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub kind: OrderKind,
    /// Limit price, zero for market-style orders
    pub price: Decimal,
    /// Trigger price, zero for plain orders
    pub trigger_price: Decimal,
    pub quantity: Decimal,
    pub close_position: bool,
    pub reduce_only: bool,
    pub created_at: DateTime<Utc>,
}

impl OpenOrder {
    pub fn protection_kind(&self) -> Option<ProtectionKind> {
        match self.kind {
            OrderKind::StopMarket => Some(ProtectionKind::Stop),
            OrderKind::TakeProfitMarket => Some(ProtectionKind::TakeProfit),
            _ => None,
        }
    }

    /// Resting LIMIT order that would open (not reduce) a position.
    pub fn is_entry_limit(&self) -> bool {
        self.kind == OrderKind::Limit && !self.reduce_only && !self.close_position
    }

    pub fn as_protective(&self) -> Option<ProtectiveOrder> {
        self.protection_kind().map(|kind| ProtectiveOrder {
            symbol: self.symbol.clone(),
            kind,
            trigger_price: self.trigger_price,
            closes_position: self.close_position,
            exchange_order_id: self.order_id.clone(),
        })
    }
}

/// A live stop or take-profit guarding a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveOrder {
    pub symbol: String,
    pub kind: ProtectionKind,
    pub trigger_price: Decimal,
    pub closes_position: bool,
    pub exchange_order_id: String,
}

/// Order to be submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: TradeSide,
    pub kind: OrderKind,
    /// Contract quantity; `None` together with `close_position`
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    /// Close whatever position exists when triggered, regardless of size
    pub close_position: bool,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: TradeSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Market,
            quantity: Some(quantity),
            price: None,
            trigger_price: None,
            close_position: false,
        }
    }

    pub fn limit(symbol: &str, side: TradeSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Limit,
            quantity: Some(quantity),
            price: Some(price),
            trigger_price: None,
            close_position: false,
        }
    }

    /// Close-entire-position stop or take-profit.
    pub fn protective(symbol: &str, close_side: TradeSide, kind: ProtectionKind, trigger: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: close_side,
            kind: kind.order_kind(),
            quantity: None,
            price: None,
            trigger_price: Some(trigger),
            close_position: true,
        }
    }
}

/// Exchange acknowledgement of a placed order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub status: String,
    /// Average fill price when the order filled immediately
    pub avg_price: Option<Decimal>,
}
