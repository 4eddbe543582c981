//! Protective-order reconciliation loop.
//!
//! Every poll, for each open position:
//! - triggers on the wrong side for the position are cancelled
//! - no STOP and no TAKE_PROFIT: ATTACH both, from the persisted trade record
//!   when one matches, else from the risk defaults
//! - duplicates of one kind: keep the best trigger, cancel the rest
//! - one leg missing: place it at the current trailing target
//! - otherwise EVALUATE_TRAIL: replace a leg when the trailing engine's
//!   target beats the live trigger by more than the minimum delta
//!
//! A failure on one symbol is logged and never stops the cycle for the others.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::api::{Exchange, SymbolRules};
use crate::db::TradeStore;
use crate::error::{EngineError, ExchangeError};
use crate::models::{OpenOrder, OrderRequest, Position, PositionSide, ProtectionKind, ProtectiveOrder, TradeStatus};
use super::trailing::{TrailTarget, TrailingStopEngine};
use super::{ReplacePolicy, ServiceConfig};

/// What one reconciliation step did for a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Both legs placed. `from_record` tells which recovery branch was used.
    Attached { from_record: bool },
    /// Missing legs placed and/or legs moved
    Adjusted { repaired: usize, replaced: usize },
    Unchanged,
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub positions: usize,
    pub attached: usize,
    pub repaired: usize,
    pub replaced: usize,
    pub closed_records: u64,
    pub errors: usize,
}

/// Operator view of one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolStatus {
    pub symbol: String,
    pub position: Option<Position>,
    pub stop: Option<ProtectiveOrder>,
    pub take_profit: Option<ProtectiveOrder>,
    pub mark_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub excursion: Decimal,
    pub level: String,
    pub error: Option<String>,
}

/// Exchange failure annotated with the operation that produced it.
#[derive(Debug)]
struct StepError {
    operation: &'static str,
    order_id: Option<String>,
    source: EngineError,
}

fn step<'a>(operation: &'static str, order_id: Option<&'a str>) -> impl FnOnce(ExchangeError) -> StepError + 'a {
    move |e| StepError {
        operation,
        order_id: order_id.map(str::to_string),
        source: EngineError::Exchange(e),
    }
}

/// Whether an exchange would accept a trigger at `trigger` with the market at `mark`.
/// Stops sit on the losing side of the mark, take-profits on the winning side.
fn is_placeable(side: PositionSide, kind: ProtectionKind, trigger: Decimal, mark: Decimal) -> bool {
    match (side, kind) {
        (PositionSide::Long, ProtectionKind::Stop) | (PositionSide::Short, ProtectionKind::TakeProfit) => trigger < mark,
        (PositionSide::Long, ProtectionKind::TakeProfit) | (PositionSide::Short, ProtectionKind::Stop) => trigger > mark,
    }
}

pub struct ProtectiveOrderReconciler {
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn TradeStore>,
    engine: TrailingStopEngine,
    config: ServiceConfig,
    /// Best favorable excursion per position instance (see `Position::key`)
    excursions: RwLock<HashMap<String, Decimal>>,
    rules: RwLock<HashMap<String, SymbolRules>>,
}

impl ProtectiveOrderReconciler {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn TradeStore>,
        engine: TrailingStopEngine,
        config: ServiceConfig,
    ) -> Self {
        Self {
            exchange,
            store,
            engine,
            config,
            excursions: RwLock::new(HashMap::new()),
            rules: RwLock::new(HashMap::new()),
        }
    }

    /// One poll over every open position.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let positions = match self.exchange.get_open_positions().await {
            Ok(p) => p,
            Err(e) => {
                error!(operation = "get_open_positions", error = %e, "Failed to fetch positions, skipping cycle");
                report.errors += 1;
                return report;
            }
        };
        report.positions = positions.len();

        for position in &positions {
            match self.reconcile_position(position).await {
                Ok(ReconcileAction::Attached { .. }) => report.attached += 1,
                Ok(ReconcileAction::Adjusted { repaired, replaced }) => {
                    report.repaired += repaired;
                    report.replaced += replaced;
                }
                Ok(ReconcileAction::Unchanged) => {}
                Err(e) => {
                    report.errors += 1;
                    let order_id = e.order_id.as_deref().unwrap_or("-");
                    if matches!(&e.source, EngineError::Exchange(x) if x.is_transient()) {
                        warn!(symbol = %position.symbol, operation = e.operation, order_id, error = %e.source, "Transient failure, retrying next poll");
                    } else {
                        error!(symbol = %position.symbol, operation = e.operation, order_id, error = %e.source, "Reconciliation failed for symbol");
                    }
                }
            }
        }

        let open: HashSet<&str> = positions.iter().map(|p| p.symbol.as_str()).collect();
        for symbol in &self.config.symbols {
            if open.contains(symbol.as_str()) {
                continue;
            }
            match self.store.close_active(symbol).await {
                Ok(0) => {}
                Ok(n) => {
                    info!(symbol = %symbol, records = n, "Position gone, trade records closed");
                    report.closed_records += n;
                }
                Err(e) => {
                    report.errors += 1;
                    error!(symbol = %symbol, operation = "close_active", error = %e, "Failed to close trade records");
                }
            }
        }

        let live_keys: HashSet<String> = positions.iter().map(Position::key).collect();
        self.excursions.write().await.retain(|key, _| live_keys.contains(key));

        report
    }

    async fn reconcile_position(&self, position: &Position) -> Result<ReconcileAction, StepError> {
        let symbol = position.symbol.as_str();
        let orders = self
            .exchange
            .get_open_orders(symbol)
            .await
            .map_err(step("get_open_orders", None))?;

        // Triggers left over from a position on the other side close nothing
        let close_side = position.side.close_side();
        let (matching, stale): (Vec<&OpenOrder>, Vec<&OpenOrder>) = orders
            .iter()
            .filter(|o| o.protection_kind().is_some())
            .partition(|o| o.side == close_side);
        if !stale.is_empty() {
            warn!(symbol = %symbol, count = stale.len(), position_side = %position.side, "Protective orders on the wrong side");
            self.cancel_all(position, stale.into_iter().filter_map(OpenOrder::as_protective), "wrong-side protective order")
                .await;
        }

        let (stops, take_profits): (Vec<ProtectiveOrder>, Vec<ProtectiveOrder>) = matching
            .into_iter()
            .filter_map(OpenOrder::as_protective)
            .partition(|o| o.kind == ProtectionKind::Stop);

        if stops.is_empty() && take_profits.is_empty() {
            return self.attach(position).await;
        }

        let stop = self.collapse_duplicates(position, stops, ProtectionKind::Stop).await;
        let take_profit = self.collapse_duplicates(position, take_profits, ProtectionKind::TakeProfit).await;

        self.evaluate_trail(position, stop, take_profit).await
    }

    /// ATTACH: place STOP and TAKE_PROFIT for an unprotected position.
    async fn attach(&self, position: &Position) -> Result<ReconcileAction, StepError> {
        let symbol = position.symbol.as_str();

        let record = match self.store.find_latest_active(symbol).await {
            Ok(Some(record)) if record.side == position.side && record.has_protection_targets() => Some(record),
            Ok(Some(record)) => {
                warn!(
                    symbol = %symbol,
                    record_id = %record.id,
                    record_side = %record.side,
                    position_side = %position.side,
                    "Persisted record does not match position"
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(symbol = %symbol, operation = "find_latest_active", error = %e, "Trade store unavailable");
                None
            }
        };

        let (sl_price, tp_price, from_record) = match &record {
            Some(r) => {
                info!(symbol = %symbol, branch = "persisted_record", record_id = %r.id, sl = %r.sl_price, tp = %r.tp_price, "ATTACH using persisted SL/TP");
                (r.sl_price, r.tp_price, true)
            }
            None => {
                let (sl, tp) = self.engine.initial_targets(position.entry_price, position.side);
                info!(symbol = %symbol, branch = "risk_defaults", sl = %sl, tp = %tp, "ATTACH using default SL/TP");
                (sl, tp, false)
            }
        };

        let rules = self.rules_for(symbol).await?;
        let sl_price = rules.round_price(sl_price);
        let tp_price = rules.round_price(tp_price);

        if self.config.dry_run {
            info!(symbol = %symbol, sl = %sl_price, tp = %tp_price, "[DRY RUN] Would attach protection");
            return Ok(ReconcileAction::Attached { from_record });
        }

        let stop_result = self.place(position, ProtectionKind::Stop, sl_price).await;
        let tp_result = self.place(position, ProtectionKind::TakeProfit, tp_price).await;

        if let Some(r) = &record {
            let outcome = match (&stop_result, &tp_result) {
                (Ok(_), Ok(_)) => self.store.update_status(&r.id, TradeStatus::Filled, None).await,
                (Err(e), _) | (_, Err(e)) => {
                    let message = format!("{} failed: {}", e.operation, e.source);
                    self.store.update_status(&r.id, r.status, Some(&message)).await
                }
            };
            if let Err(e) = outcome {
                error!(symbol = %symbol, record_id = %r.id, operation = "update_status", error = %e, "Failed to update trade record");
            }
        }

        stop_result?;
        tp_result?;
        Ok(ReconcileAction::Attached { from_record })
    }

    /// Keep the best order of one kind, cancel the rest. Returns the survivor.
    async fn collapse_duplicates(
        &self,
        position: &Position,
        mut orders: Vec<ProtectiveOrder>,
        kind: ProtectionKind,
    ) -> Option<ProtectiveOrder> {
        if orders.len() <= 1 {
            return orders.pop();
        }

        let side = position.side;
        let mut best_idx = 0;
        for (i, order) in orders.iter().enumerate().skip(1) {
            let better = match kind {
                ProtectionKind::Stop => side.is_tighter(order.trigger_price, orders[best_idx].trigger_price),
                ProtectionKind::TakeProfit => side.is_further(order.trigger_price, orders[best_idx].trigger_price),
            };
            if better {
                best_idx = i;
            }
        }
        let best = orders.swap_remove(best_idx);

        warn!(
            symbol = %position.symbol,
            kind = kind.label(),
            count = orders.len() + 1,
            keep = %best.trigger_price,
            "Duplicate protective orders"
        );

        self.cancel_all(position, orders, "duplicate").await;

        Some(best)
    }

    /// Best-effort cancel; failures are logged and retried on the next poll.
    async fn cancel_all(&self, position: &Position, orders: impl IntoIterator<Item = ProtectiveOrder>, what: &str) {
        for extra in orders {
            if self.config.dry_run {
                info!(symbol = %position.symbol, order_id = %extra.exchange_order_id, what, "[DRY RUN] Would cancel");
                continue;
            }
            if let Err(e) = self.cancel(&extra).await {
                warn!(
                    symbol = %position.symbol,
                    operation = "cancel_order",
                    order_id = %extra.exchange_order_id,
                    what,
                    error = %e.source,
                    "Failed to cancel"
                );
            }
        }
    }

    /// EVALUATE_TRAIL plus missing-leg repair.
    async fn evaluate_trail(
        &self,
        position: &Position,
        stop: Option<ProtectiveOrder>,
        take_profit: Option<ProtectiveOrder>,
    ) -> Result<ReconcileAction, StepError> {
        let symbol = position.symbol.as_str();
        let mark = self
            .exchange
            .get_mark_price(symbol)
            .await
            .map_err(step("get_mark_price", None))?;

        let excursion = self.observe_excursion(position, mark).await;
        let target = self.engine.evaluate(position.entry_price, position.side, excursion);
        let rules = self.rules_for(symbol).await?;
        let target_sl = rules.round_price(target.sl_price);
        let target_tp = rules.round_price(target.tp_price);

        debug!(
            symbol = %symbol,
            mark = %mark,
            excursion = %excursion,
            level = %target.level,
            target_sl = %target_sl,
            target_tp = %target_tp,
            "Trail evaluated"
        );

        let mut repaired = 0;
        let mut replaced = 0;

        match &stop {
            None => {
                if self.repair(position, ProtectionKind::Stop, target_sl, mark).await? {
                    repaired += 1;
                }
            }
            Some(live) => {
                if self.should_replace(position, live, target_sl, mark) {
                    self.replace(position, live, target_sl, &target).await?;
                    replaced += 1;
                }
            }
        }

        match &take_profit {
            None => {
                if self.repair(position, ProtectionKind::TakeProfit, target_tp, mark).await? {
                    repaired += 1;
                }
            }
            // Take-profits only move once a trailing level is active
            Some(live) if target.level_index.is_some() => {
                if self.should_replace(position, live, target_tp, mark) {
                    self.replace(position, live, target_tp, &target).await?;
                    replaced += 1;
                }
            }
            Some(_) => {}
        }

        if repaired + replaced == 0 {
            Ok(ReconcileAction::Unchanged)
        } else {
            Ok(ReconcileAction::Adjusted { repaired, replaced })
        }
    }

    fn should_replace(&self, position: &Position, live: &ProtectiveOrder, target: Decimal, mark: Decimal) -> bool {
        let side = position.side;
        let improves = match live.kind {
            ProtectionKind::Stop => side.is_tighter(target, live.trigger_price),
            ProtectionKind::TakeProfit => side.is_further(target, live.trigger_price),
        };
        if !improves {
            return false;
        }

        let delta = (live.trigger_price - target).abs();
        if delta <= target.abs() * self.engine.config().min_trail_delta {
            debug!(symbol = %position.symbol, kind = live.kind.label(), delta = %delta, "Improvement below minimum delta");
            return false;
        }

        if !is_placeable(side, live.kind, target, mark) {
            warn!(
                symbol = %position.symbol,
                kind = live.kind.label(),
                target = %target,
                mark = %mark,
                "Target already crossed by mark price, keeping live order"
            );
            return false;
        }

        true
    }

    /// Place a missing leg. Returns false when the target cannot be placed yet.
    async fn repair(&self, position: &Position, kind: ProtectionKind, target: Decimal, mark: Decimal) -> Result<bool, StepError> {
        if !is_placeable(position.side, kind, target, mark) {
            warn!(
                symbol = %position.symbol,
                kind = kind.label(),
                target = %target,
                mark = %mark,
                "Missing leg target already crossed by mark price"
            );
            return Ok(false);
        }

        if self.config.dry_run {
            info!(symbol = %position.symbol, kind = kind.label(), trigger = %target, "[DRY RUN] Would place missing leg");
            return Ok(true);
        }

        info!(symbol = %position.symbol, kind = kind.label(), trigger = %target, "Placing missing protective leg");
        self.place(position, kind, target).await?;
        Ok(true)
    }

    /// REPLACE a live leg according to the configured policy.
    async fn replace(
        &self,
        position: &Position,
        live: &ProtectiveOrder,
        new_trigger: Decimal,
        target: &TrailTarget,
    ) -> Result<(), StepError> {
        info!(
            symbol = %position.symbol,
            kind = live.kind.label(),
            order_id = %live.exchange_order_id,
            from = %live.trigger_price,
            to = %new_trigger,
            level = %target.level,
            "Trailing protective order"
        );

        if self.config.dry_run {
            info!(symbol = %position.symbol, "[DRY RUN] Would replace protective order");
            return Ok(());
        }

        match self.config.replace_policy {
            ReplacePolicy::CancelThenPlace => {
                if let Err(e) = self.cancel(live).await {
                    if !is_unknown_order(&e) {
                        return Err(e);
                    }
                    warn!(symbol = %position.symbol, order_id = %live.exchange_order_id, "Live order already gone, placing replacement");
                }
                if let Err(e) = self.place(position, live.kind, new_trigger).await {
                    error!(
                        symbol = %position.symbol,
                        kind = live.kind.label(),
                        "Replacement failed after cancel, leg missing until next poll"
                    );
                    return Err(e);
                }
            }
            ReplacePolicy::PlaceThenCancel => {
                self.place(position, live.kind, new_trigger).await?;
                if let Err(e) = self.cancel(live).await {
                    if !is_unknown_order(&e) {
                        warn!(
                            symbol = %position.symbol,
                            operation = e.operation,
                            order_id = %live.exchange_order_id,
                            error = %e.source,
                            "Old order not cancelled, duplicate collapsed next poll"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn place(&self, position: &Position, kind: ProtectionKind, trigger: Decimal) -> Result<String, StepError> {
        let request = OrderRequest::protective(&position.symbol, position.side.close_side(), kind, trigger);
        let ack = self
            .exchange
            .place_order(&request)
            .await
            .map_err(step("place_order", None))?;

        info!(
            symbol = %position.symbol,
            kind = kind.label(),
            order_id = %ack.order_id,
            trigger = %trigger,
            "Protective order placed"
        );
        Ok(ack.order_id)
    }

    async fn cancel(&self, order: &ProtectiveOrder) -> Result<(), StepError> {
        self.exchange
            .cancel_order(&order.exchange_order_id, &order.symbol)
            .await
            .map_err(step("cancel_order", Some(order.exchange_order_id.as_str())))
    }

    async fn observe_excursion(&self, position: &Position, mark: Decimal) -> Decimal {
        let current = position.side.favorable_move(position.entry_price, mark);
        let mut excursions = self.excursions.write().await;
        let best = excursions.entry(position.key()).or_insert(Decimal::ZERO);
        if current > *best {
            *best = current;
        }
        *best
    }

    async fn rules_for(&self, symbol: &str) -> Result<SymbolRules, StepError> {
        if let Some(rules) = self.rules.read().await.get(symbol) {
            return Ok(rules.clone());
        }
        let rules = self
            .exchange
            .get_symbol_rules(symbol)
            .await
            .map_err(step("get_symbol_rules", None))?;
        self.rules.write().await.insert(symbol.to_string(), rules.clone());
        Ok(rules)
    }

    /// Per-symbol operator status: position, live protection and trailing level.
    pub async fn status(&self) -> Vec<SymbolStatus> {
        let positions = match self.exchange.get_open_positions().await {
            Ok(p) => p,
            Err(e) => {
                error!(operation = "get_open_positions", error = %e, "Status query failed");
                return self
                    .config
                    .symbols
                    .iter()
                    .map(|s| SymbolStatus::failed(s, e.to_string()))
                    .collect();
            }
        };

        let mut symbols: Vec<String> = self.config.symbols.clone();
        for p in &positions {
            if !symbols.contains(&p.symbol) {
                symbols.push(p.symbol.clone());
            }
        }

        let mut statuses = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let position = positions.iter().find(|p| p.symbol == symbol).cloned();
            statuses.push(self.symbol_status(symbol, position).await);
        }
        statuses
    }

    async fn symbol_status(&self, symbol: String, position: Option<Position>) -> SymbolStatus {
        let mut status = SymbolStatus {
            symbol: symbol.clone(),
            position: position.clone(),
            stop: None,
            take_profit: None,
            mark_price: None,
            unrealized_pnl: None,
            excursion: Decimal::ZERO,
            level: "-".to_string(),
            error: None,
        };

        match self.exchange.get_open_orders(&symbol).await {
            Ok(orders) => {
                let close_side = position.as_ref().map(|p| p.side.close_side());
                let relevant = orders.iter().filter(|o| close_side.map_or(true, |side| o.side == side));
                for order in relevant.filter_map(OpenOrder::as_protective) {
                    match order.kind {
                        ProtectionKind::Stop => status.stop = Some(order),
                        ProtectionKind::TakeProfit => status.take_profit = Some(order),
                    }
                }
            }
            Err(e) => status.error = Some(format!("get_open_orders: {}", e)),
        }

        let Some(position) = position else {
            return status;
        };

        match self.exchange.get_mark_price(&symbol).await {
            Ok(mark) => {
                let current = position.side.favorable_move(position.entry_price, mark).max(Decimal::ZERO);
                let tracked = self.excursions.read().await.get(&position.key()).copied().unwrap_or(Decimal::ZERO);
                status.mark_price = Some(mark);
                status.unrealized_pnl = Some(position.pnl_at(mark));
                status.excursion = current.max(tracked);
            }
            Err(e) => status.error = Some(format!("get_mark_price: {}", e)),
        }
        status.level = self
            .engine
            .evaluate(position.entry_price, position.side, status.excursion)
            .level;

        status
    }
}

impl SymbolStatus {
    fn failed(symbol: &str, error: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            position: None,
            stop: None,
            take_profit: None,
            mark_price: None,
            unrealized_pnl: None,
            excursion: Decimal::ZERO,
            level: "-".to_string(),
            error: Some(error),
        }
    }
}

fn is_unknown_order(err: &StepError) -> bool {
    matches!(&err.source, EngineError::Exchange(e) if e.is_unknown_order())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockExchange;
    use crate::db::{Database, TradeStore};
    use crate::models::{OpenOrder, OrderKind, TradeRecord, TradeSide};
    use crate::trading::RiskConfig;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    async fn setup(config: ServiceConfig) -> (Arc<MockExchange>, Arc<Database>, ProtectiveOrderReconciler) {
        let exchange = Arc::new(MockExchange::new());
        let store = Arc::new(Database::in_memory().await.unwrap());
        let reconciler = ProtectiveOrderReconciler::new(
            exchange.clone(),
            store.clone(),
            TrailingStopEngine::new(RiskConfig::default()),
            config,
        );
        (exchange, store, reconciler)
    }

    fn protective(id: &str, symbol: &str, kind: OrderKind, trigger: Decimal) -> OpenOrder {
        OpenOrder {
            order_id: id.to_string(),
            symbol: symbol.to_string(),
            side: TradeSide::Sell,
            kind,
            price: Decimal::ZERO,
            trigger_price: trigger,
            quantity: Decimal::ZERO,
            close_position: true,
            reduce_only: true,
            created_at: Utc::now(),
        }
    }

    fn count(orders: &[OpenOrder], kind: OrderKind) -> usize {
        orders.iter().filter(|o| o.kind == kind).count()
    }

    #[tokio::test]
    async fn test_attach_places_exactly_one_stop_and_take_profit() {
        let (exchange, _store, reconciler) = setup(ServiceConfig::default()).await;
        exchange.add_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1));

        let report = reconciler.run_cycle().await;
        assert_eq!(report.attached, 1);
        assert_eq!(report.errors, 0);

        let orders = exchange.open_orders("BTCUSDT");
        assert_eq!(orders.len(), 2);
        assert_eq!(count(&orders, OrderKind::StopMarket), 1);
        assert_eq!(count(&orders, OrderKind::TakeProfitMarket), 1);
        assert!(orders.iter().all(|o| o.close_position && o.side == TradeSide::Sell));

        let stop = orders.iter().find(|o| o.kind == OrderKind::StopMarket).unwrap();
        assert_eq!(stop.trigger_price, dec!(99.5));

        // Second poll with unchanged price leaves the book alone
        let report = reconciler.run_cycle().await;
        assert_eq!(report.attached, 0);
        assert_eq!(report.replaced, 0);
        assert_eq!(exchange.open_orders("BTCUSDT").len(), 2);
    }

    #[tokio::test]
    async fn test_attach_prefers_persisted_record() {
        let (exchange, store, reconciler) = setup(ServiceConfig::default()).await;
        let record = crate::db::tests::sample_record("ETHUSDT", TradeStatus::Pending);
        store.insert_trade(&record).await.unwrap();
        exchange.add_position("ETHUSDT", PositionSide::Long, dec!(100), dec!(1.01));

        reconciler.run_cycle().await;

        let orders = exchange.open_orders("ETHUSDT");
        let stop = orders.iter().find(|o| o.kind == OrderKind::StopMarket).unwrap();
        let tp = orders.iter().find(|o| o.kind == OrderKind::TakeProfitMarket).unwrap();
        assert_eq!(stop.trigger_price, dec!(99.2));
        assert_eq!(tp.trigger_price, dec!(102.4));

        let stored = store.find_latest_active("ETHUSDT").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Filled);
    }

    #[tokio::test]
    async fn test_attach_ignores_record_for_other_side() {
        let (exchange, store, reconciler) = setup(ServiceConfig::default()).await;
        let record: TradeRecord = crate::db::tests::sample_record("ETHUSDT", TradeStatus::Open);
        store.insert_trade(&record).await.unwrap();
        exchange.add_position("ETHUSDT", PositionSide::Short, dec!(100), dec!(1));

        reconciler.run_cycle().await;

        let orders = exchange.open_orders("ETHUSDT");
        let stop = orders.iter().find(|o| o.kind == OrderKind::StopMarket).unwrap();
        assert_eq!(stop.trigger_price, dec!(100.5));
        assert_eq!(stop.side, TradeSide::Buy);
    }

    #[tokio::test]
    async fn test_trail_replaces_once_then_idempotent() {
        let (exchange, _store, reconciler) = setup(ServiceConfig::default()).await;
        exchange.add_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1));
        exchange.add_order(protective("s1", "BTCUSDT", OrderKind::StopMarket, dec!(99.5)));
        exchange.add_order(protective("t1", "BTCUSDT", OrderKind::TakeProfitMarket, dec!(101.5)));
        exchange.set_mark_price("BTCUSDT", dec!(100.6));

        let report = reconciler.run_cycle().await;
        assert_eq!(report.replaced, 2);

        let orders = exchange.open_orders("BTCUSDT");
        let stop = orders.iter().find(|o| o.kind == OrderKind::StopMarket).unwrap();
        let tp = orders.iter().find(|o| o.kind == OrderKind::TakeProfitMarket).unwrap();
        assert_eq!(stop.trigger_price, dec!(100.1));
        assert_eq!(tp.trigger_price, dec!(102));
        assert_eq!(exchange.cancelled(), vec!["s1".to_string(), "t1".to_string()]);

        let placed_before = exchange.placed().len();
        let report = reconciler.run_cycle().await;
        assert_eq!(report.replaced, 0);
        assert_eq!(exchange.placed().len(), placed_before);
        assert_eq!(exchange.cancelled().len(), 2);
    }

    #[tokio::test]
    async fn test_retrace_never_loosens_stop() {
        let (exchange, _store, reconciler) = setup(ServiceConfig::default()).await;
        exchange.add_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1));
        exchange.add_order(protective("s1", "BTCUSDT", OrderKind::StopMarket, dec!(99.5)));
        exchange.add_order(protective("t1", "BTCUSDT", OrderKind::TakeProfitMarket, dec!(101.5)));

        exchange.set_mark_price("BTCUSDT", dec!(100.3));
        reconciler.run_cycle().await;
        exchange.set_mark_price("BTCUSDT", dec!(99.9));
        reconciler.run_cycle().await;

        let orders = exchange.open_orders("BTCUSDT");
        let stop = orders.iter().find(|o| o.kind == OrderKind::StopMarket).unwrap();
        // L1 break-even reached at +0.3%, kept after the pullback
        assert_eq!(stop.trigger_price, dec!(100));
    }

    #[tokio::test]
    async fn test_missing_leg_repaired() {
        let (exchange, _store, reconciler) = setup(ServiceConfig::default()).await;
        exchange.add_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1));
        exchange.add_order(protective("s1", "BTCUSDT", OrderKind::StopMarket, dec!(99.5)));

        let report = reconciler.run_cycle().await;
        assert_eq!(report.repaired, 1);

        let orders = exchange.open_orders("BTCUSDT");
        assert_eq!(count(&orders, OrderKind::StopMarket), 1);
        assert_eq!(count(&orders, OrderKind::TakeProfitMarket), 1);
    }

    #[tokio::test]
    async fn test_duplicates_collapsed_to_best() {
        let (exchange, _store, reconciler) = setup(ServiceConfig::default()).await;
        exchange.add_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1));
        exchange.add_order(protective("s1", "BTCUSDT", OrderKind::StopMarket, dec!(99.5)));
        exchange.add_order(protective("s2", "BTCUSDT", OrderKind::StopMarket, dec!(99.7)));
        exchange.add_order(protective("t1", "BTCUSDT", OrderKind::TakeProfitMarket, dec!(101.5)));

        reconciler.run_cycle().await;

        let orders = exchange.open_orders("BTCUSDT");
        let stops: Vec<_> = orders.iter().filter(|o| o.kind == OrderKind::StopMarket).collect();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].order_id, "s2");
    }

    #[tokio::test]
    async fn test_wrong_side_leftovers_cancelled_and_replaced() {
        let (exchange, _store, reconciler) = setup(ServiceConfig::default()).await;
        exchange.add_position("ETHUSDT", PositionSide::Short, dec!(100), dec!(1));
        // SELL stop left behind by an earlier long
        exchange.add_order(protective("old", "ETHUSDT", OrderKind::StopMarket, dec!(99.5)));

        let report = reconciler.run_cycle().await;

        assert_eq!(report.attached, 1);
        assert_eq!(exchange.cancelled(), vec!["old".to_string()]);
        let orders = exchange.open_orders("ETHUSDT");
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().all(|o| o.side == TradeSide::Buy));
        assert_eq!(count(&orders, OrderKind::StopMarket), 1);
        assert_eq!(count(&orders, OrderKind::TakeProfitMarket), 1);
    }

    #[tokio::test]
    async fn test_failure_on_one_symbol_does_not_stop_others() {
        let (exchange, _store, reconciler) = setup(ServiceConfig::default()).await;
        exchange.add_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1));
        exchange.add_position("ETHUSDT", PositionSide::Short, dec!(50), dec!(2));
        exchange.fail_orders_for("BTCUSDT");

        let report = reconciler.run_cycle().await;

        assert_eq!(report.errors, 1);
        assert_eq!(report.attached, 1);
        assert_eq!(exchange.open_orders("ETHUSDT").len(), 2);
        assert!(exchange.open_orders("BTCUSDT").is_empty());
    }

    #[tokio::test]
    async fn test_flat_symbol_closes_records() {
        let (_exchange, store, reconciler) = setup(ServiceConfig::default()).await;
        store
            .insert_trade(&crate::db::tests::sample_record("SOLUSDT", TradeStatus::Filled))
            .await
            .unwrap();

        let report = reconciler.run_cycle().await;

        assert_eq!(report.closed_records, 1);
        assert!(store.find_latest_active("SOLUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dry_run_places_nothing() {
        let config = ServiceConfig {
            dry_run: true,
            ..ServiceConfig::default()
        };
        let (exchange, _store, reconciler) = setup(config).await;
        exchange.add_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1));

        let report = reconciler.run_cycle().await;

        assert_eq!(report.attached, 1);
        assert!(exchange.placed().is_empty());
    }

    #[tokio::test]
    async fn test_place_then_cancel_policy() {
        let config = ServiceConfig {
            replace_policy: ReplacePolicy::PlaceThenCancel,
            ..ServiceConfig::default()
        };
        let (exchange, _store, reconciler) = setup(config).await;
        exchange.add_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1));
        exchange.add_order(protective("s1", "BTCUSDT", OrderKind::StopMarket, dec!(99.5)));
        exchange.add_order(protective("t1", "BTCUSDT", OrderKind::TakeProfitMarket, dec!(101.5)));
        exchange.set_mark_price("BTCUSDT", dec!(100.25));

        reconciler.run_cycle().await;

        let orders = exchange.open_orders("BTCUSDT");
        assert_eq!(count(&orders, OrderKind::StopMarket), 1);
        assert_eq!(orders.iter().find(|o| o.kind == OrderKind::StopMarket).unwrap().trigger_price, dec!(100));
    }

    #[tokio::test]
    async fn test_failed_replacement_is_repaired_next_poll() {
        let (exchange, _store, reconciler) = setup(ServiceConfig::default()).await;
        exchange.add_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1));
        exchange.add_order(protective("s1", "BTCUSDT", OrderKind::StopMarket, dec!(99.5)));
        exchange.add_order(protective("t1", "BTCUSDT", OrderKind::TakeProfitMarket, dec!(101.5)));
        exchange.set_mark_price("BTCUSDT", dec!(100.3));
        exchange.fail_place(OrderKind::StopMarket);

        let report = reconciler.run_cycle().await;
        assert_eq!(report.errors, 1);
        assert_eq!(count(&exchange.open_orders("BTCUSDT"), OrderKind::StopMarket), 0);

        exchange.clear_failures();
        let report = reconciler.run_cycle().await;
        assert_eq!(report.repaired, 1);

        let orders = exchange.open_orders("BTCUSDT");
        let stop = orders.iter().find(|o| o.kind == OrderKind::StopMarket).unwrap();
        assert_eq!(stop.trigger_price, dec!(100));
        assert_eq!(count(&orders, OrderKind::TakeProfitMarket), 1);
    }

    #[tokio::test]
    async fn test_status_reports_level() {
        let (exchange, _store, reconciler) = setup(ServiceConfig::default()).await;
        exchange.add_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1));
        exchange.add_order(protective("s1", "BTCUSDT", OrderKind::StopMarket, dec!(100)));
        exchange.set_mark_price("BTCUSDT", dec!(100.6));

        let statuses = reconciler.status().await;
        let btc = statuses.iter().find(|s| s.symbol == "BTCUSDT").unwrap();

        assert_eq!(btc.level, "L2_LOCK_PROFIT");
        assert_eq!(btc.stop.as_ref().unwrap().trigger_price, dec!(100));
        assert!(btc.take_profit.is_none());
        assert!(statuses.iter().any(|s| s.symbol == "ETHUSDT" && s.position.is_none()));
    }

    #[test]
    fn test_crossed_targets_are_not_placeable() {
        assert!(is_placeable(PositionSide::Long, ProtectionKind::Stop, dec!(100.5), dec!(101)));
        assert!(!is_placeable(PositionSide::Long, ProtectionKind::Stop, dec!(100.5), dec!(100.3)));
        assert!(is_placeable(PositionSide::Short, ProtectionKind::Stop, dec!(99.5), dec!(99)));
        assert!(!is_placeable(PositionSide::Short, ProtectionKind::TakeProfit, dec!(97), dec!(96)));
    }
}
