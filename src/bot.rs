//! Service runner: clock sync, protective-order reconciler and stale-entry
//! janitor as independent background loops.
//!
//! Handles:
//! - Startup clock calibration with bounded retry
//! - Periodic and on-demand clock resync
//! - Graceful shutdown: every loop finishes its in-flight cycle before exiting

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{Exchange, TimedExchange};
use crate::db::TradeStore;
use crate::error::EngineError;
use crate::trading::{
    ClockSync, ProtectiveOrderReconciler, RiskConfig, ServiceConfig, StaleEntryJanitor, SymbolStatus,
    TrailingStopEngine,
};

/// How long startup keeps retrying the first clock sync.
const STARTUP_SYNC_BUDGET: Duration = Duration::from_secs(30);

/// Background service.
pub struct Service {
    config: ServiceConfig,
    exchange: Arc<dyn Exchange>,
    clock: Arc<ClockSync>,
    reconciler: Arc<ProtectiveOrderReconciler>,
    janitor: Arc<StaleEntryJanitor>,
    shutdown_tx: watch::Sender<bool>,
}

impl Service {
    /// Build the service. Invalid risk parameters are the only fatal error.
    pub fn new(
        config: ServiceConfig,
        risk: RiskConfig,
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn TradeStore>,
        clock: Arc<ClockSync>,
    ) -> Result<Self, EngineError> {
        risk.validate()?;
        if config.poll_interval.is_zero() || config.janitor_interval.is_zero() {
            return Err(EngineError::Configuration("poll intervals must be non-zero".to_string()));
        }

        let exchange: Arc<dyn Exchange> = Arc::new(TimedExchange::new(exchange, config.call_timeout));

        let reconciler = ProtectiveOrderReconciler::new(
            exchange.clone(),
            store.clone(),
            TrailingStopEngine::new(risk.clone()),
            config.clone(),
        );
        let janitor = StaleEntryJanitor::new(
            exchange.clone(),
            store,
            clock.clone(),
            risk.stale_entry_ttl(),
            config.symbols.clone(),
            config.dry_run,
        );

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            exchange,
            clock,
            reconciler: Arc::new(reconciler),
            janitor: Arc::new(janitor),
            shutdown_tx,
        })
    }

    /// Send `true` to stop every loop after its current cycle.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub async fn status(&self) -> Vec<SymbolStatus> {
        self.reconciler.status().await
    }

    /// First clock calibration. A failure degrades to the local clock.
    pub async fn startup(&self) {
        match self.clock.sync_with_retry(self.exchange.as_ref(), STARTUP_SYNC_BUDGET).await {
            Ok(offset) => info!(offset_ms = offset, "Startup clock sync complete"),
            Err(e) => warn!(error = %e, "Startup clock sync failed, using local clock until next resync"),
        }
    }

    /// Run until Ctrl-C, then wait for the loops to wind down.
    pub async fn run(self) -> Result<()> {
        info!(
            dry_run = self.config.dry_run,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            symbols = ?self.config.symbols,
            policy = ?self.config.replace_policy,
            "Starting service"
        );

        self.startup().await;
        let handles = self.spawn_loops();

        let shutdown = self.shutdown_handle();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
            _ = wait_for_shutdown(shutdown.subscribe()) => {}
        }
        shutdown.send_replace(true);

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Background task failed");
            }
        }
        info!("Service stopped");
        Ok(())
    }

    /// Spawn the clock, reconciler and janitor loops.
    pub fn spawn_loops(&self) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(clock_loop(
                self.clock.clone(),
                self.exchange.clone(),
                self.config.poll_interval,
                self.shutdown_tx.subscribe(),
            )),
            tokio::spawn(reconcile_loop(
                self.reconciler.clone(),
                self.clock.clone(),
                self.config.poll_interval,
                self.config.clock_resync_cycles,
                self.shutdown_tx.subscribe(),
            )),
            tokio::spawn(janitor_loop(
                self.janitor.clone(),
                self.config.janitor_interval,
                self.shutdown_tx.subscribe(),
            )),
        ]
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Resync when requested: every N reconciler cycles or after a timestamp rejection.
async fn clock_loop(
    clock: Arc<ClockSync>,
    exchange: Arc<dyn Exchange>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if clock.take_resync_request() {
                    // Failure keeps the previous offset
                    let _ = clock.sync(exchange.as_ref()).await;
                }
            }
            _ = wait_for_shutdown(shutdown.clone()) => break,
        }
        if *shutdown.borrow_and_update() {
            break;
        }
    }
    debug!("Clock loop stopped");
}

async fn reconcile_loop(
    reconciler: Arc<ProtectiveOrderReconciler>,
    clock: Arc<ClockSync>,
    period: Duration,
    resync_cycles: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = reconciler.run_cycle().await;
                cycles += 1;
                if report.errors > 0 {
                    warn!(cycle = cycles, errors = report.errors, "Reconcile cycle finished with errors");
                }
                info!(
                    cycle = cycles,
                    positions = report.positions,
                    attached = report.attached,
                    repaired = report.repaired,
                    replaced = report.replaced,
                    closed_records = report.closed_records,
                    "Reconcile cycle complete"
                );
                if resync_cycles > 0 && cycles % u64::from(resync_cycles) == 0 {
                    clock.request_resync();
                }
            }
            _ = wait_for_shutdown(shutdown.clone()) => break,
        }
        if *shutdown.borrow_and_update() {
            break;
        }
    }
    info!(cycles, "Reconciler stopped");
}

async fn janitor_loop(janitor: Arc<StaleEntryJanitor>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = janitor.sweep().await;
                if report.cancelled > 0 || report.errors > 0 {
                    info!(
                        inspected = report.inspected,
                        cancelled = report.cancelled,
                        errors = report.errors,
                        "Janitor sweep complete"
                    );
                }
            }
            _ = wait_for_shutdown(shutdown.clone()) => break,
        }
        if *shutdown.borrow_and_update() {
            break;
        }
    }
    debug!("Janitor stopped");
}
