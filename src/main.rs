//! Perp Guard
//!
//! Keeps leveraged futures positions protected: sizes entries from a fixed
//! risk budget, attaches stop-loss/take-profit orders, and ratchets the stop
//! through a trailing-level table as the position moves in profit.

mod api;
mod backtest;
mod bot;
mod db;
mod error;
mod metrics;
mod models;
mod trading;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{normalize_symbol, BinanceClient, Exchange, TimedExchange};
use crate::backtest::{BacktestConfig, BacktestSimulator};
use crate::bot::Service;
use crate::db::{Database, TradeStore};
use crate::models::{Candle, PositionSide};
use crate::trading::{
    Action, ClockSync, EntryRequest, ExecutionGateway, PositionSizer, ReplacePolicy, RiskConfig, ScriptedSignals,
    ServiceConfig, Signal, TrailingStopEngine,
};

/// Protective-order guardian for perpetual futures.
#[derive(Parser)]
#[command(name = "perpguard")]
#[command(about = "Attach and trail stop-loss / take-profit orders on futures positions", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, default_value = "sqlite:perpguard.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Risk parameters as JSON; missing fields use the defaults
    #[arg(short, long, env = "PERPGUARD_RISK_CONFIG")]
    risk_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciler, janitor and clock-sync loops
    Run {
        /// Symbols watched by the janitor and record lifecycle
        #[arg(short, long, value_delimiter = ',', default_value = "BTCUSDT,ETHUSDT,SOLUSDT")]
        symbols: Vec<String>,

        /// Poll interval in seconds
        #[arg(short, long, default_value = "30")]
        interval: u64,

        /// Log decisions without placing or cancelling orders
        #[arg(long)]
        dry_run: bool,

        /// How a protective order is swapped for a better one
        #[arg(long, value_enum, default_value_t = ReplacePolicy::CancelThenPlace)]
        replace_policy: ReplacePolicy,
    },

    /// Show positions, protective orders and trailing level per symbol
    Status {
        #[arg(short, long, value_delimiter = ',', default_value = "BTCUSDT,ETHUSDT,SOLUSDT")]
        symbols: Vec<String>,
    },

    /// Submit an entry for a signal
    Trade {
        symbol: String,

        /// BUY, SELL or HOLD
        action: Action,

        /// Signal confidence, 0-100
        confidence: Decimal,

        /// Rest a LIMIT entry at this price instead of a MARKET order
        #[arg(long)]
        limit_price: Option<Decimal>,

        /// Plan the entry without submitting it
        #[arg(long)]
        dry_run: bool,
    },

    /// Preview sizing and initial SL/TP without touching the exchange
    Plan {
        #[arg(short, long)]
        balance: Decimal,

        #[arg(short, long)]
        confidence: Decimal,

        /// LONG or SHORT
        #[arg(short, long)]
        side: PositionSide,

        /// Entry price
        #[arg(short, long)]
        price: Decimal,
    },

    /// Show the trailing level and targets for a given excursion
    Trail {
        #[arg(short, long)]
        entry: Decimal,

        #[arg(short, long)]
        side: PositionSide,

        /// Best favorable move as a fraction of entry (0.006 = 0.6%)
        #[arg(short = 'x', long)]
        excursion: Decimal,
    },

    /// Replay candles and recorded signals through the sizing and trailing logic
    Backtest {
        /// JSON array of candles
        #[arg(long)]
        candles: PathBuf,

        /// JSON array of {timestamp, action, confidence}
        #[arg(long)]
        signals: PathBuf,

        #[arg(short, long, default_value = "1000")]
        balance: Decimal,

        /// Fee rate per side (0.001 = 0.1%)
        #[arg(short, long, default_value = "0.001")]
        fee: Decimal,

        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,
    },

    /// List recent trade records
    History {
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show the active risk configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Invalid risk parameters are fatal before anything touches the exchange
    let risk = match &cli.risk_config {
        Some(path) => RiskConfig::from_file(path)?,
        None => RiskConfig::default(),
    };
    risk.validate()?;

    match cli.command {
        Commands::Run {
            symbols,
            interval,
            dry_run,
            replace_policy,
        } => {
            let config = ServiceConfig {
                poll_interval: Duration::from_secs(interval),
                symbols: symbols.iter().map(|s| normalize_symbol(s)).collect(),
                dry_run,
                replace_policy,
                ..ServiceConfig::default()
            };

            let clock = Arc::new(ClockSync::new());
            let exchange: Arc<dyn Exchange> = Arc::new(BinanceClient::from_env(clock.clone(), config.call_timeout)?);
            let store: Arc<dyn TradeStore> = Arc::new(Database::new(&cli.database).await?);

            println!("\n=== Perp Guard ===");
            println!("Symbols:         {}", config.symbols.join(", "));
            println!("Poll interval:   {}s", interval);
            println!("Replace policy:  {:?}", config.replace_policy);
            println!("Mode:            {}", if dry_run { "DRY RUN (no orders)" } else { "LIVE" });
            println!("\nPress Ctrl+C to stop.\n");

            let service = Service::new(config, risk, exchange, store, clock)?;
            service.run().await?;
        }

        Commands::Status { symbols } => {
            let config = ServiceConfig {
                symbols: symbols.iter().map(|s| normalize_symbol(s)).collect(),
                dry_run: true,
                ..ServiceConfig::default()
            };
            let clock = Arc::new(ClockSync::new());
            let exchange: Arc<dyn Exchange> = Arc::new(BinanceClient::from_env(clock.clone(), config.call_timeout)?);
            let store: Arc<dyn TradeStore> = Arc::new(Database::new(&cli.database).await?);

            let service = Service::new(config, risk, exchange, store, clock)?;
            service.startup().await;

            println!("\n=== Protection Status ===");
            for status in service.status().await {
                println!("\n{}", status.symbol);
                match &status.position {
                    Some(p) => println!(
                        "  Position:   {} {} @ {} (mark {})",
                        p.side,
                        p.quantity,
                        p.entry_price,
                        status.mark_price.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string())
                    ),
                    None => println!("  Position:   flat"),
                }
                if let Some(pnl) = status.unrealized_pnl {
                    println!("  Unrealized: ${:.2}", pnl);
                }
                let trigger = |o: &Option<crate::models::ProtectiveOrder>| {
                    o.as_ref()
                        .map(|o| format!("{} (#{})", o.trigger_price, o.exchange_order_id))
                        .unwrap_or_else(|| "none".to_string())
                };
                println!("  Stop:       {}", trigger(&status.stop));
                println!("  Take:       {}", trigger(&status.take_profit));
                println!("  Level:      {} (excursion {:.3}%)", status.level, status.excursion * dec!(100));
                if let Some(err) = &status.error {
                    println!("  Error:      {}", err);
                }
            }
        }

        Commands::Trade {
            symbol,
            action,
            confidence,
            limit_price,
            dry_run,
        } => {
            let clock = Arc::new(ClockSync::new());
            let timeout = ServiceConfig::default().call_timeout;
            let client: Arc<dyn Exchange> = Arc::new(BinanceClient::from_env(clock.clone(), timeout)?);
            let exchange: Arc<dyn Exchange> = Arc::new(TimedExchange::new(client, timeout));
            let store: Arc<dyn TradeStore> = Arc::new(Database::new(&cli.database).await?);

            if let Err(e) = clock.sync(exchange.as_ref()).await {
                tracing::warn!(error = %e, "Clock sync failed, signing with local clock");
            }

            let gateway = ExecutionGateway::new(
                exchange,
                store,
                PositionSizer::new(risk.clone()),
                TrailingStopEngine::new(risk),
                dry_run,
            );
            let request = EntryRequest {
                symbol,
                signal: Signal { action, confidence },
                limit_price,
            };

            let outcome = gateway.execute(&request).await?;
            println!("\n=== Entry {} ===", if dry_run { "Plan" } else { "Submitted" });
            println!("Record:      {}", outcome.record_id);
            println!("Symbol:      {} {}", outcome.symbol, outcome.side);
            println!("Quantity:    {}", outcome.quantity);
            println!("Entry:       {}", outcome.entry_price);
            println!("Margin:      ${:.2} x{}", outcome.plan.margin, outcome.plan.leverage);
            println!("Notional:    ${:.2}{}", outcome.plan.notional, if outcome.plan.floored { " (min notional)" } else { "" });
            println!("SL / TP:     {} / {}", outcome.sl_price, outcome.tp_price);
            println!("Status:      {}", outcome.status);
            if let Some(id) = &outcome.order_id {
                println!("Order:       {}", id);
            }
            for err in &outcome.protection_errors {
                println!("Protection:  FAILED {}", err);
            }
        }

        Commands::Plan {
            balance,
            confidence,
            side,
            price,
        } => {
            let sizer = PositionSizer::new(risk.clone());
            let engine = TrailingStopEngine::new(risk);

            match sizer.size(balance, confidence, side) {
                Ok(plan) => {
                    let (sl, tp) = engine.initial_targets(price, side);
                    println!("\n=== Sizing Plan ===");
                    println!("Side:        {}", plan.side);
                    println!("Leverage:    {}x", plan.leverage);
                    println!("Margin:      ${:.4}", plan.margin);
                    println!("Notional:    ${:.4}{}", plan.notional, if plan.floored { " (raised to min notional)" } else { "" });
                    if price > Decimal::ZERO {
                        println!("Quantity:    {:.6}", plan.notional / price);
                    }
                    println!("Stop:        {:.4}", sl);
                    println!("Take profit: {:.4}", tp);
                }
                Err(reason) => println!("Rejected: {}", reason),
            }
        }

        Commands::Trail { entry, side, excursion } => {
            let engine = TrailingStopEngine::new(risk);
            let target = engine.evaluate(entry, side, excursion);

            println!("\n=== Trailing Target ===");
            println!("Level:       {}", target.level);
            println!("Stop:        {:.4}", target.sl_price);
            println!("Take profit: {:.4}", target.tp_price);
        }

        Commands::Backtest {
            candles,
            signals,
            balance,
            fee,
            symbol,
        } => {
            let raw = std::fs::read_to_string(&candles)
                .with_context(|| format!("Failed to read candles {}", candles.display()))?;
            let bars: Vec<Candle> = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid candles file {}", candles.display()))?;
            let signals = ScriptedSignals::from_file(&signals)?;

            info!(bars = bars.len(), signals = signals.len(), "Loaded backtest data");

            let simulator = BacktestSimulator::new(BacktestConfig {
                initial_balance: balance,
                fee_rate: fee,
                risk,
                symbol: normalize_symbol(&symbol),
            })?;
            let results = simulator.run(&bars, &signals)?;
            println!("{}", results);

            if !results.trades.is_empty() {
                println!("\n--- Trades ---");
                for trade in &results.trades {
                    println!(
                        "  {} {} {} -> {} | {} | {} | P&L: ${:.2}",
                        trade.entry_time.format("%Y-%m-%d %H:%M"),
                        trade.side,
                        trade.entry_price,
                        trade.exit_price,
                        trade.exit_reason.as_str(),
                        trade.level,
                        trade.pnl
                    );
                }
            }
        }

        Commands::History { limit } => {
            let db = Database::new(&cli.database).await?;
            let trades = db.recent_trades(limit).await?;

            if trades.is_empty() {
                println!("No trade records.");
                return Ok(());
            }

            println!("\n=== Recent Trades ===");
            for t in &trades {
                println!(
                    "  {} {:<10} {:<5} {:>12} SL {:>12} TP {:>12} {:<9} {}",
                    t.created_at.format("%Y-%m-%d %H:%M"),
                    t.symbol,
                    t.side,
                    t.entry_price,
                    t.sl_price,
                    t.tp_price,
                    t.status,
                    t.error_message.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Config => {
            println!("\n=== Risk Configuration ===\n");
            println!("Sizing:");
            println!("  Risk per Trade:       {}%", risk.max_drawdown_per_trade * dec!(100));
            println!("  Leverage:             {}x", risk.base_leverage);
            println!("  Min Confidence:       {}", risk.min_confidence);
            println!("  Min Notional:         ${}", risk.min_notional);
            println!("  Max Margin Fraction:  {}%", risk.max_margin_fraction * dec!(100));

            println!("\nProtection:");
            println!("  Initial Stop:         {}%", risk.default_sl_pct * dec!(100));
            println!("  Initial Take Profit:  {}%", risk.default_tp_pct * dec!(100));
            println!("  Min Trail Delta:      {}%", risk.min_trail_delta * dec!(100));
            println!("  Stale Entry TTL:      {}h", risk.stale_entry_ttl_secs as f64 / 3600.0);

            println!("\nTrailing Levels:");
            for level in &risk.trailing_levels {
                println!(
                    "  {:<18} at +{}%: SL {:+}%, TP {}",
                    level.name,
                    level.trigger * dec!(100),
                    level.sl_offset * dec!(100),
                    level
                        .tp_offset
                        .map(|tp| format!("+{}%", tp * dec!(100)))
                        .unwrap_or_else(|| "unchanged".to_string())
                );
            }
        }
    }

    Ok(())
}
