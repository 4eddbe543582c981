//! Binance USDⓈ-M futures REST client.
//!
//! Handles:
//! - HMAC-SHA256 request signing with the synchronized exchange timestamp
//! - Error classification from HTTP status and Binance error codes
//! - Conversion of wire payloads into the crate's models

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tracing::{debug, warn};

use super::exchange::{format_decimal, Exchange, SymbolRules};
use super::types::*;
use crate::error::ExchangeError;
use crate::models::{OpenOrder, OrderAck, OrderKind, OrderRequest, Position};
use crate::trading::ClockSync;

type HmacSha256 = Hmac<Sha256>;

/// Production futures endpoint
pub const FUTURES_URL: &str = "https://fapi.binance.com";

const DEFAULT_RECV_WINDOW_MS: u64 = 60_000;

/// Binance code for "Timestamp for this request is outside of the recvWindow".
const CODE_TIMESTAMP_OUTSIDE_WINDOW: i64 = -1021;

/// Signed REST client for one futures account.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    clock: Arc<ClockSync>,
}

impl BinanceClient {
    pub fn new(
        api_key: &str,
        api_secret: &str,
        base_url: &str,
        recv_window_ms: u64,
        clock: Arc<ClockSync>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            recv_window_ms,
            clock,
        })
    }

    /// Create from `BINANCE_API_KEY`, `BINANCE_API_SECRET` and the optional
    /// `BINANCE_FUTURES_URL` / `BINANCE_RECV_WINDOW`.
    pub fn from_env(clock: Arc<ClockSync>, timeout: Duration) -> Result<Self> {
        let api_key = std::env::var("BINANCE_API_KEY")
            .context("BINANCE_API_KEY not set")?;
        let api_secret = std::env::var("BINANCE_API_SECRET")
            .context("BINANCE_API_SECRET not set")?;
        let base_url = std::env::var("BINANCE_FUTURES_URL")
            .unwrap_or_else(|_| FUTURES_URL.to_string());
        let recv_window_ms: u64 = match std::env::var("BINANCE_RECV_WINDOW") {
            Ok(v) => v.parse().context("Invalid BINANCE_RECV_WINDOW")?,
            Err(_) => DEFAULT_RECV_WINDOW_MS,
        };

        Self::new(&api_key, &api_secret, &base_url, recv_window_ms, clock, timeout)
    }

    fn sign(&self, payload: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Rejected { code: 0, message: format!("invalid API secret: {}", e) })?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Query string with recvWindow, exchange-clock timestamp and signature appended.
    fn signed_query(&self, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        query.push(format!("recvWindow={}", self.recv_window_ms));
        query.push(format!("timestamp={}", self.clock.now_ms()));

        let payload = query.join("&");
        let signature = self.sign(&payload)?;
        Ok(format!("{}&signature={}", payload, signature))
    }

    async fn public_get<T: DeserializeOwned>(&self, path: &str, query: &str) -> Result<T, ExchangeError> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        debug!(url = %url, "GET");

        let resp = self.http.get(&url).send().await?;
        self.read_response(resp).await
    }

    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params)?);
        debug!(method = %method, path = %path, "Signed request");

        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        self.read_response(resp).await
    }

    async fn read_response<T: DeserializeOwned>(&self, resp: Response) -> Result<T, ExchangeError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = classify_error(status, &body);
            self.clock.observe_error(&err);
            return Err(err);
        }

        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| ExchangeError::Decode(format!("{}: {}", e, truncate(&body, 200))))
    }
}

/// Map an HTTP failure to the error taxonomy.
fn classify_error(status: StatusCode, body: &str) -> ExchangeError {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();

    if let Some(err) = &parsed {
        if err.code == CODE_TIMESTAMP_OUTSIDE_WINDOW {
            return ExchangeError::ClockSkew(err.msg.clone());
        }
    }

    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::IM_A_TEAPOT
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        return ExchangeError::Transient(format!("HTTP {}: {}", status, truncate(body, 200)));
    }

    match parsed {
        Some(err) => ExchangeError::Rejected { code: err.code, message: err.msg },
        None => ExchangeError::Rejected {
            code: i64::from(status.as_u16()),
            message: truncate(body, 200).to_string(),
        },
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn order_params(request: &OrderRequest) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("symbol", request.symbol.clone()),
        ("side", request.side.as_str().to_string()),
        ("type", request.kind.as_str().to_string()),
        ("newOrderRespType", "RESULT".to_string()),
    ];

    if let Some(qty) = request.quantity {
        params.push(("quantity", format_decimal(qty)));
    }
    if let Some(price) = request.price {
        params.push(("price", format_decimal(price)));
        params.push(("timeInForce", "GTC".to_string()));
    }
    if let Some(trigger) = request.trigger_price {
        params.push(("stopPrice", format_decimal(trigger)));
        params.push(("workingType", "MARK_PRICE".to_string()));
    }
    if request.close_position {
        params.push(("closePosition", "true".to_string()));
    }
    params
}

#[async_trait]
impl Exchange for BinanceClient {
    async fn get_open_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let entries: Vec<PositionRiskEntry> = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", &[])
            .await?;
        Ok(entries.into_iter().filter_map(PositionRiskEntry::into_position).collect())
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let entries: Vec<OpenOrderEntry> = self
            .signed_request(Method::GET, "/fapi/v1/openOrders", &[("symbol", symbol.to_string())])
            .await?;
        Ok(entries.into_iter().map(OpenOrderEntry::into_open_order).collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let resp: OrderResponse = self
            .signed_request(Method::POST, "/fapi/v1/order", &order_params(request))
            .await?;

        let avg_price = (resp.avg_price > Decimal::ZERO).then_some(resp.avg_price);
        if request.kind == OrderKind::Market && avg_price.is_none() {
            warn!(symbol = %request.symbol, order_id = resp.order_id, "Market order acknowledged without fill price");
        }

        Ok(OrderAck {
            order_id: resp.order_id.to_string(),
            status: resp.status,
            avg_price,
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .signed_request(
                Method::DELETE,
                "/fapi/v1/order",
                &[("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn get_server_time(&self) -> Result<i64, ExchangeError> {
        let resp: ServerTimeResponse = self.public_get("/fapi/v1/time", "").await?;
        Ok(resp.server_time)
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let resp: PremiumIndexResponse = self
            .public_get("/fapi/v1/premiumIndex", &format!("symbol={}", symbol))
            .await?;
        Ok(resp.mark_price)
    }

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        let info: ExchangeInfoResponse = self.public_get("/fapi/v1/exchangeInfo", "").await?;
        let symbol_info = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| ExchangeError::Rejected {
                code: -1121,
                message: format!("unknown symbol {}", symbol),
            })?;

        let mut rules = SymbolRules {
            symbol: symbol_info.symbol,
            tick_size: Decimal::ZERO,
            step_size: Decimal::ZERO,
            min_qty: Decimal::ZERO,
            min_notional: Decimal::ZERO,
        };
        for filter in symbol_info.filters {
            match filter {
                SymbolFilter::Price { tick_size } => rules.tick_size = tick_size,
                SymbolFilter::LotSize { step_size, min_qty } => {
                    rules.step_size = step_size;
                    rules.min_qty = min_qty;
                }
                SymbolFilter::MinNotional { notional } => rules.min_notional = notional,
                SymbolFilter::Other => {}
            }
        }
        Ok(rules)
    }

    async fn get_available_balance(&self) -> Result<Decimal, ExchangeError> {
        let balances: Vec<BalanceEntry> = self
            .signed_request(Method::GET, "/fapi/v2/balance", &[])
            .await?;
        Ok(balances
            .into_iter()
            .find(|b| b.asset == "USDT")
            .map(|b| b.available_balance)
            .unwrap_or(Decimal::ZERO))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .signed_request(
                Method::POST,
                "/fapi/v1/leverage",
                &[("symbol", symbol.to_string()), ("leverage", leverage.to_string())],
            )
            .await?;
        Ok(())
    }
}
