//! Exchange adapter interface consumed by the control loops.
//!
//! Every call is signed by the concrete adapter; callers only see typed
//! results and [`ExchangeError`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::error::ExchangeError;
use crate::models::{OpenOrder, OrderAck, OrderRequest, Position};

/// Precision and size limits for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolRules {
    pub symbol: String,
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

impl SymbolRules {
    /// Round a price to the nearest tick.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        if self.tick_size <= Decimal::ZERO {
            return price;
        }
        ((price / self.tick_size).round() * self.tick_size).normalize()
    }

    /// Floor a quantity onto the step grid.
    pub fn floor_qty(&self, qty: Decimal) -> Decimal {
        if self.step_size <= Decimal::ZERO {
            return qty;
        }
        ((qty / self.step_size).floor() * self.step_size).normalize()
    }

    fn ceil_qty(&self, qty: Decimal) -> Decimal {
        if self.step_size <= Decimal::ZERO {
            return qty;
        }
        ((qty / self.step_size).ceil() * self.step_size).normalize()
    }

    /// Quantity for a notional at `price`, floored to the step. When that
    /// falls under the exchange's minimum notional (or `floor`, whichever is
    /// larger) it is lifted to the minimum plus a 5% buffer.
    pub fn quantity_for(&self, notional: Decimal, price: Decimal, floor: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let min_notional = self.min_notional.max(floor);

        let mut qty = self.floor_qty(notional / price);
        if qty * price < min_notional {
            qty = self.ceil_qty(min_notional / price * Decimal::new(105, 2));
        }
        qty.max(self.min_qty)
    }
}

/// Canonical exchange symbol: `BTC-USD`, `btc/usdt` and `BTCUSDT` all map to `BTCUSDT`.
pub fn normalize_symbol(raw: &str) -> String {
    let mut symbol: String = raw
        .chars()
        .filter(|c| *c != '-' && *c != '/' && *c != '_')
        .collect::<String>()
        .to_ascii_uppercase();

    if symbol.ends_with("USD") && !symbol.contains("USDT") {
        symbol.push('T');
    }
    symbol
}

/// Format a decimal for a request parameter without exponent or trailing zeros.
pub fn format_decimal(value: Decimal) -> String {
    value
        .round_dp_with_strategy(8, RoundingStrategy::ToZero)
        .normalize()
        .to_string()
}

/// Operations the guardian needs from a derivatives exchange.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_open_positions(&self) -> Result<Vec<Position>, ExchangeError>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError>;

    /// Exchange clock in epoch milliseconds.
    async fn get_server_time(&self) -> Result<i64, ExchangeError>;

    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError>;

    /// Balance available to post as margin, in quote currency.
    async fn get_available_balance(&self) -> Result<Decimal, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;
}

/// Bounds every call of the wrapped adapter by a hard deadline.
///
/// An expired call is reported as [`ExchangeError::Transient`] so the next
/// poll picks it up again.
pub struct TimedExchange {
    inner: Arc<dyn Exchange>,
    timeout: Duration,
}

impl TimedExchange {
    pub fn new(inner: Arc<dyn Exchange>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T, ExchangeError>
    where
        F: std::future::Future<Output = Result<T, ExchangeError>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Transient(format!(
                "{} timed out after {:?}",
                operation, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl Exchange for TimedExchange {
    async fn get_open_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        self.run("get_open_positions", self.inner.get_open_positions()).await
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        self.run("get_open_orders", self.inner.get_open_orders(symbol)).await
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        self.run("place_order", self.inner.place_order(request)).await
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError> {
        self.run("cancel_order", self.inner.cancel_order(order_id, symbol)).await
    }

    async fn get_server_time(&self) -> Result<i64, ExchangeError> {
        self.run("get_server_time", self.inner.get_server_time()).await
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.run("get_mark_price", self.inner.get_mark_price(symbol)).await
    }

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        self.run("get_symbol_rules", self.inner.get_symbol_rules(symbol)).await
    }

    async fn get_available_balance(&self) -> Result<Decimal, ExchangeError> {
        self.run("get_available_balance", self.inner.get_available_balance()).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.run("set_leverage", self.inner.set_leverage(symbol, leverage)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockExchange;
    use rust_decimal_macros::dec;

    fn btc_rules() -> SymbolRules {
        SymbolRules {
            symbol: "BTCUSDT".to_string(),
            tick_size: dec!(0.1),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(100),
        }
    }

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("BTC-USD"), "BTCUSDT");
        assert_eq!(normalize_symbol("eth/usdt"), "ETHUSDT");
        assert_eq!(normalize_symbol("SOLUSDT"), "SOLUSDT");
    }

    #[test]
    fn test_price_and_quantity_rounding() {
        let rules = btc_rules();
        assert_eq!(rules.round_price(dec!(43210.07)), dec!(43210.1));
        assert_eq!(rules.floor_qty(dec!(0.0129)), dec!(0.012));
    }

    #[test]
    fn test_quantity_bumped_to_min_notional() {
        let rules = btc_rules();

        // 101 / 50000 = 0.00202 -> floored 0.002, notional 100 < 101
        let qty = rules.quantity_for(dec!(101), dec!(50000), dec!(101));
        // (101 / 50000) * 1.05 = 0.002121 -> ceil on 0.001 grid
        assert_eq!(qty, dec!(0.003));

        let qty = rules.quantity_for(dec!(1000), dec!(50000), dec!(101));
        assert_eq!(qty, dec!(0.02));
    }

    #[test]
    fn test_format_decimal() {
        assert_eq!(format_decimal(dec!(0.02000)), "0.02");
        assert_eq!(format_decimal(dec!(43210.100000001)), "43210.1");
    }

    #[tokio::test]
    async fn test_timed_exchange_maps_timeout_to_transient() {
        let mock = Arc::new(MockExchange::new());
        mock.set_latency(Duration::from_millis(200));
        let timed = TimedExchange::new(mock, Duration::from_millis(20));

        let err = timed.get_server_time().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Transient(_)));
    }
}
