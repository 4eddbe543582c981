//! Wire types for the Binance USDⓈ-M futures REST API.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::models::{OpenOrder, OrderKind, Position, PositionSide, TradeSide};

/// Error body returned with non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

/// GET /fapi/v1/time
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTimeResponse {
    pub server_time: i64,
}

/// Entry of GET /fapi/v2/positionRisk
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRiskEntry {
    pub symbol: String,
    /// Signed: negative for shorts
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    /// Sent as a string, e.g. "20"
    #[serde(default)]
    pub leverage: String,
    #[serde(default)]
    pub update_time: i64,
}

impl PositionRiskEntry {
    /// `None` for the zero-size rows Binance returns for every symbol.
    pub fn into_position(self) -> Option<Position> {
        if self.position_amt.is_zero() {
            return None;
        }
        let side = if self.position_amt > Decimal::ZERO {
            PositionSide::Long
        } else {
            PositionSide::Short
        };

        Some(Position {
            symbol: self.symbol,
            side,
            entry_price: self.entry_price,
            quantity: self.position_amt.abs(),
            leverage: self.leverage.parse().unwrap_or(1),
            opened_at: millis_to_utc(self.update_time),
        })
    }
}

/// Entry of GET /fapi/v1/openOrders
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrderEntry {
    pub order_id: i64,
    pub symbol: String,
    pub side: String,
    #[serde(rename = "type")]
    pub order_type: String,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub stop_price: Decimal,
    #[serde(default)]
    pub orig_qty: Decimal,
    #[serde(default)]
    pub close_position: bool,
    #[serde(default)]
    pub reduce_only: bool,
    pub time: i64,
}

impl OpenOrderEntry {
    pub fn into_open_order(self) -> OpenOrder {
        OpenOrder {
            order_id: self.order_id.to_string(),
            symbol: self.symbol,
            side: self.side.parse().unwrap_or(TradeSide::Buy),
            kind: OrderKind::parse(&self.order_type),
            price: self.price,
            trigger_price: self.stop_price,
            quantity: self.orig_qty,
            close_position: self.close_position,
            reduce_only: self.reduce_only,
            created_at: millis_to_utc(self.time),
        }
    }
}

/// POST /fapi/v1/order with newOrderRespType=RESULT
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    #[serde(default)]
    pub status: String,
    /// "0.00000" until something fills
    #[serde(default)]
    pub avg_price: Decimal,
}

/// GET /fapi/v1/premiumIndex?symbol=...
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumIndexResponse {
    pub mark_price: Decimal,
}

/// GET /fapi/v1/exchangeInfo
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfoResponse {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

/// Only the filters the order normalizer needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    Price { tick_size: Decimal },

    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize { step_size: Decimal, min_qty: Decimal },

    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional { notional: Decimal },

    #[serde(other)]
    Other,
}

/// Entry of GET /fapi/v2/balance
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceEntry {
    pub asset: String,
    #[serde(default)]
    pub available_balance: Decimal,
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}
