//! In-memory exchange used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::{Exchange, SymbolRules};
use crate::error::ExchangeError;
use crate::models::{OpenOrder, OrderAck, OrderKind, OrderRequest, Position, PositionSide, TradeSide};

#[derive(Default)]
struct MockState {
    positions: Vec<Position>,
    orders: Vec<OpenOrder>,
    mark_prices: HashMap<String, Decimal>,
    balance: Decimal,
    server_time: Option<i64>,
    next_id: u64,
    placed: Vec<OrderRequest>,
    cancelled: Vec<String>,
    leverage: HashMap<String, u32>,
    fail_orders_for: HashSet<String>,
    fail_place_kinds: Vec<OrderKind>,
    latency: Option<Duration>,
}

/// Exchange double with scripted state and injectable failures.
pub struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                balance: dec!(1000),
                server_time: Some(1_700_000_000_000),
                next_id: 1,
                ..MockState::default()
            }),
        }
    }

    pub fn add_position(&self, symbol: &str, side: PositionSide, entry: Decimal, quantity: Decimal) {
        let mut state = self.state.lock().unwrap();
        state.positions.push(Position {
            symbol: symbol.to_string(),
            side,
            entry_price: entry,
            quantity,
            leverage: 150,
            opened_at: Utc::now(),
        });
        state.mark_prices.entry(symbol.to_string()).or_insert(entry);
    }

    pub fn add_order(&self, order: OpenOrder) {
        self.state.lock().unwrap().orders.push(order);
    }

    pub fn set_mark_price(&self, symbol: &str, price: Decimal) {
        self.state.lock().unwrap().mark_prices.insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.state.lock().unwrap().balance = balance;
    }

    /// `None` makes `get_server_time` fail.
    pub fn set_server_time(&self, time: Option<i64>) {
        self.state.lock().unwrap().server_time = time;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = Some(latency);
    }

    pub fn fail_orders_for(&self, symbol: &str) {
        self.state.lock().unwrap().fail_orders_for.insert(symbol.to_string());
    }

    pub fn fail_place(&self, kind: OrderKind) {
        self.state.lock().unwrap().fail_place_kinds.push(kind);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_orders_for.clear();
        state.fail_place_kinds.clear();
    }

    pub fn open_orders(&self, symbol: &str) -> Vec<OpenOrder> {
        self.state
            .lock()
            .unwrap()
            .orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        self.state.lock().unwrap().placed.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn leverage_for(&self, symbol: &str) -> Option<u32> {
        self.state.lock().unwrap().leverage.get(symbol).copied()
    }

    async fn delay(&self) {
        let latency = self.state.lock().unwrap().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn get_open_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        self.delay().await;
        Ok(self.state.lock().unwrap().positions.clone())
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        self.delay().await;
        let state = self.state.lock().unwrap();
        if state.fail_orders_for.contains(symbol) {
            return Err(ExchangeError::Transient(format!("openOrders {} unavailable", symbol)));
        }
        Ok(state.orders.iter().filter(|o| o.symbol == symbol).cloned().collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        self.delay().await;
        let mut state = self.state.lock().unwrap();
        if state.fail_place_kinds.contains(&request.kind) {
            return Err(ExchangeError::Rejected {
                code: -2021,
                message: "Order would immediately trigger.".to_string(),
            });
        }

        let order_id = state.next_id.to_string();
        state.next_id += 1;
        state.placed.push(request.clone());

        let mark = state.mark_prices.get(&request.symbol).copied().unwrap_or(Decimal::ZERO);

        if request.kind == OrderKind::Market {
            let side = match request.side {
                TradeSide::Buy => PositionSide::Long,
                TradeSide::Sell => PositionSide::Short,
            };
            let leverage = state.leverage.get(&request.symbol).copied().unwrap_or(1);
            state.positions.push(Position {
                symbol: request.symbol.clone(),
                side,
                entry_price: mark,
                quantity: request.quantity.unwrap_or(Decimal::ZERO),
                leverage,
                opened_at: Utc::now(),
            });
            return Ok(OrderAck {
                order_id,
                status: "FILLED".to_string(),
                avg_price: Some(mark),
            });
        }

        state.orders.push(OpenOrder {
            order_id: order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            kind: request.kind.clone(),
            price: request.price.unwrap_or(Decimal::ZERO),
            trigger_price: request.trigger_price.unwrap_or(Decimal::ZERO),
            quantity: request.quantity.unwrap_or(Decimal::ZERO),
            close_position: request.close_position,
            reduce_only: false,
            created_at: Utc::now(),
        });

        Ok(OrderAck {
            order_id,
            status: "NEW".to_string(),
            avg_price: None,
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError> {
        self.delay().await;
        let mut state = self.state.lock().unwrap();
        let before = state.orders.len();
        state.orders.retain(|o| !(o.order_id == order_id && o.symbol == symbol));
        if state.orders.len() == before {
            return Err(ExchangeError::Rejected {
                code: -2011,
                message: "Unknown order sent.".to_string(),
            });
        }
        state.cancelled.push(order_id.to_string());
        Ok(())
    }

    async fn get_server_time(&self) -> Result<i64, ExchangeError> {
        self.delay().await;
        self.state
            .lock()
            .unwrap()
            .server_time
            .ok_or_else(|| ExchangeError::Transient("time endpoint unreachable".to_string()))
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.delay().await;
        self.state
            .lock()
            .unwrap()
            .mark_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Rejected {
                code: -1121,
                message: "Invalid symbol.".to_string(),
            })
    }

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        Ok(SymbolRules {
            symbol: symbol.to_string(),
            tick_size: dec!(0.01),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(100),
        })
    }

    async fn get_available_balance(&self) -> Result<Decimal, ExchangeError> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.state.lock().unwrap().leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }
}
