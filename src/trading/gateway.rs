//! Entry order submission.
//!
//! Sizes the entry, normalizes it to the symbol's precision rules, persists a
//! PENDING record before anything reaches the exchange, then submits. MARKET
//! entries get their protection immediately; LIMIT entries leave it to the
//! reconciler once the position exists.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::{normalize_symbol, Exchange};
use crate::db::TradeStore;
use crate::error::{EngineError, RejectReason};
use crate::models::{OrderRequest, PositionSide, ProtectionKind, TradeRecord, TradeStatus};
use super::{PositionSizer, Signal, SizingPlan, TrailingStopEngine};

/// A signal to act on.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub symbol: String,
    pub signal: Signal,
    /// Rest a LIMIT entry at this price instead of crossing the book
    pub limit_price: Option<Decimal>,
}

/// What was submitted and persisted.
#[derive(Debug, Clone, Serialize)]
pub struct EntryOutcome {
    pub record_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub plan: SizingPlan,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub sl_price: Decimal,
    pub tp_price: Decimal,
    pub order_id: Option<String>,
    pub status: TradeStatus,
    /// Protective legs that could not be placed; the reconciler repairs them
    pub protection_errors: Vec<String>,
}

pub struct ExecutionGateway {
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn TradeStore>,
    sizer: PositionSizer,
    engine: TrailingStopEngine,
    dry_run: bool,
}

impl ExecutionGateway {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn TradeStore>,
        sizer: PositionSizer,
        engine: TrailingStopEngine,
        dry_run: bool,
    ) -> Self {
        Self {
            exchange,
            store,
            sizer,
            engine,
            dry_run,
        }
    }

    pub async fn execute(&self, request: &EntryRequest) -> Result<EntryOutcome, EngineError> {
        let side = request.signal.action.side().ok_or(RejectReason::Hold)?;
        let symbol = normalize_symbol(&request.symbol);

        let balance = self.exchange.get_available_balance().await?;
        let plan = self.sizer.size(balance, request.signal.confidence, side)?;

        let rules = self.exchange.get_symbol_rules(&symbol).await?;
        let reference_price = match request.limit_price {
            Some(price) => rules.round_price(price),
            None => self.exchange.get_mark_price(&symbol).await?,
        };
        if reference_price <= Decimal::ZERO {
            return Err(RejectReason::InvalidInput(format!("entry price {} must be positive", reference_price)).into());
        }

        let quantity = rules.quantity_for(plan.notional, reference_price, self.sizer.config().min_notional);

        // Step rounding and the min-notional lift can push past the sizer's margin cap
        let required_margin = quantity * reference_price / Decimal::from(plan.leverage);
        let max_margin = balance * self.sizer.config().max_margin_fraction;
        if required_margin > max_margin {
            warn!(
                symbol = %symbol,
                quantity = %quantity,
                required_margin = %required_margin.round_dp(4),
                max_margin = %max_margin.round_dp(4),
                "Normalized entry exceeds margin cap"
            );
            return Err(RejectReason::InsufficientBalance { balance, required_margin }.into());
        }
        let (sl, tp) = self.engine.initial_targets(reference_price, side);
        let (sl_price, tp_price) = (rules.round_price(sl), rules.round_price(tp));

        info!(
            symbol = %symbol,
            side = %side,
            confidence = %request.signal.confidence,
            balance = %balance,
            margin = %plan.margin.round_dp(4),
            notional = %plan.notional.round_dp(4),
            quantity = %quantity,
            price = %reference_price,
            sl = %sl_price,
            tp = %tp_price,
            "Entry planned"
        );

        let mut record = TradeRecord {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.clone(),
            side,
            entry_price: reference_price,
            size: plan.notional,
            quantity,
            leverage: plan.leverage,
            sl_price,
            tp_price,
            status: TradeStatus::Pending,
            order_id: None,
            order_type: if request.limit_price.is_some() { "LIMIT" } else { "MARKET" }.to_string(),
            error_message: None,
            created_at: Utc::now(),
        };

        if self.dry_run {
            info!(symbol = %symbol, "[DRY RUN] Entry not submitted");
            return Ok(outcome(&record, plan, Vec::new()));
        }

        self.exchange.set_leverage(&symbol, plan.leverage).await?;
        self.store.insert_trade(&record).await?;

        let order = match request.limit_price {
            Some(_) => OrderRequest::limit(&symbol, side.entry_side(), quantity, reference_price),
            None => OrderRequest::market(&symbol, side.entry_side(), quantity),
        };

        let ack = match self.exchange.place_order(&order).await {
            Ok(ack) => ack,
            Err(e) => {
                error!(symbol = %symbol, operation = "place_order", record_id = %record.id, error = %e, "Entry rejected");
                let message = e.to_string();
                if let Err(db_err) = self
                    .store
                    .update_status(&record.id, TradeStatus::Cancelled, Some(&message))
                    .await
                {
                    error!(record_id = %record.id, error = %db_err, "Failed to record rejected entry");
                }
                return Err(e.into());
            }
        };
        record.order_id = Some(ack.order_id.clone());

        if request.limit_price.is_some() {
            self.store
                .record_submission(&record.id, &ack.order_id, TradeStatus::Pending, reference_price, sl_price, tp_price)
                .await?;
            info!(symbol = %symbol, order_id = %ack.order_id, price = %reference_price, "Limit entry resting");
            return Ok(outcome(&record, plan, Vec::new()));
        }

        // Protection follows the actual fill, not the pre-trade mark
        let fill = ack.avg_price.filter(|p| *p > Decimal::ZERO).unwrap_or(reference_price);
        let (sl, tp) = self.engine.initial_targets(fill, side);
        record.entry_price = fill;
        record.sl_price = rules.round_price(sl);
        record.tp_price = rules.round_price(tp);
        record.status = TradeStatus::Open;

        self.store
            .record_submission(&record.id, &ack.order_id, TradeStatus::Open, fill, record.sl_price, record.tp_price)
            .await?;
        info!(symbol = %symbol, order_id = %ack.order_id, fill = %fill, "Market entry filled");

        let mut protection_errors = Vec::new();
        for (kind, trigger) in [(ProtectionKind::Stop, record.sl_price), (ProtectionKind::TakeProfit, record.tp_price)] {
            let request = OrderRequest::protective(&symbol, side.close_side(), kind, trigger);
            match self.exchange.place_order(&request).await {
                Ok(ack) => info!(symbol = %symbol, kind = kind.label(), order_id = %ack.order_id, trigger = %trigger, "Protective order placed"),
                Err(e) => {
                    warn!(symbol = %symbol, operation = "place_order", kind = kind.label(), error = %e, "Protection failed, reconciler will retry");
                    protection_errors.push(format!("{} {}: {}", kind.label(), trigger, e));
                }
            }
        }

        if !protection_errors.is_empty() {
            let message = protection_errors.join("; ");
            self.store
                .update_status(&record.id, TradeStatus::Open, Some(&message))
                .await?;
        }

        Ok(outcome(&record, plan, protection_errors))
    }
}

fn outcome(record: &TradeRecord, plan: SizingPlan, protection_errors: Vec<String>) -> EntryOutcome {
    EntryOutcome {
        record_id: record.id.clone(),
        symbol: record.symbol.clone(),
        side: record.side,
        plan,
        quantity: record.quantity,
        entry_price: record.entry_price,
        sl_price: record.sl_price,
        tp_price: record.tp_price,
        order_id: record.order_id.clone(),
        status: record.status,
        protection_errors,
    }
}
