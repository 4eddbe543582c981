//! Cancels entry LIMIT orders that never filled.
//!
//! Age is measured against the exchange clock, since `created_at` is the
//! exchange's own timestamp. Protective orders are never touched.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::api::Exchange;
use crate::db::TradeStore;
use crate::models::{OpenOrder, TradeStatus};
use super::ClockSync;

/// Counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inspected: usize,
    pub cancelled: usize,
    pub errors: usize,
}

pub struct StaleEntryJanitor {
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn TradeStore>,
    clock: Arc<ClockSync>,
    ttl: Duration,
    symbols: Vec<String>,
    dry_run: bool,
}

impl StaleEntryJanitor {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn TradeStore>,
        clock: Arc<ClockSync>,
        ttl: Duration,
        symbols: Vec<String>,
        dry_run: bool,
    ) -> Self {
        Self {
            exchange,
            store,
            clock,
            ttl,
            symbols,
            dry_run,
        }
    }

    fn is_stale(&self, order: &OpenOrder, now_ms: i64) -> bool {
        let age_ms = now_ms - order.created_at.timestamp_millis();
        age_ms > self.ttl.as_millis() as i64
    }

    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now_ms = self.clock.now_ms();

        for symbol in &self.symbols {
            let orders = match self.exchange.get_open_orders(symbol).await {
                Ok(orders) => orders,
                Err(e) => {
                    report.errors += 1;
                    error!(symbol = %symbol, operation = "get_open_orders", error = %e, "Janitor could not list orders");
                    continue;
                }
            };

            for order in orders.iter().filter(|o| o.is_entry_limit()) {
                report.inspected += 1;
                if !self.is_stale(order, now_ms) {
                    continue;
                }

                let age_mins = (now_ms - order.created_at.timestamp_millis()) / 60_000;
                if self.dry_run {
                    info!(symbol = %symbol, order_id = %order.order_id, age_mins, "[DRY RUN] Would cancel stale entry");
                    continue;
                }

                match self.exchange.cancel_order(&order.order_id, symbol).await {
                    Ok(()) => {
                        report.cancelled += 1;
                        info!(symbol = %symbol, order_id = %order.order_id, age_mins, "Stale entry cancelled");
                        if let Err(e) = self
                            .store
                            .update_status_by_order_id(&order.order_id, TradeStatus::Cancelled)
                            .await
                        {
                            report.errors += 1;
                            error!(
                                symbol = %symbol,
                                operation = "update_status_by_order_id",
                                order_id = %order.order_id,
                                error = %e,
                                "Failed to mark record cancelled"
                            );
                        }
                    }
                    // Filled or cancelled between listing and cancelling
                    Err(e) if e.is_unknown_order() => {
                        warn!(symbol = %symbol, order_id = %order.order_id, "Stale entry already gone");
                    }
                    Err(e) => {
                        report.errors += 1;
                        error!(symbol = %symbol, operation = "cancel_order", order_id = %order.order_id, error = %e, "Failed to cancel stale entry");
                    }
                }
            }
        }

        report
    }
}
