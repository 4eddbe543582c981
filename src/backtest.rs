//! Bar-by-bar replay of the sizing and trailing-stop logic over historical candles.
//!
//! Per bar, with a position open:
//! - SL/TP come from the excursion reached on earlier bars
//! - intrabar stop is checked before take-profit (worst case when both are inside the range)
//! - then the excursion is updated with this bar, then an opposite signal may exit at the close
//!
//! When flat the signal source is consulted and an entry fills at the close.
//! No re-entry on the bar that closed a position. No network calls.

use std::fmt;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};

use crate::error::RejectReason;
use crate::metrics::PerformanceAnalyzer;
use crate::models::{Candle, ClosedTrade, EquitySample, ExitReason, PerformanceReport, PositionSide};
use crate::trading::{PositionSizer, RiskConfig, SignalSource, TrailingStopEngine};

/// Backtesting configuration.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    /// Starting account balance
    pub initial_balance: Decimal,

    /// Fee rate charged on notional at entry and at exit
    pub fee_rate: Decimal,

    pub risk: RiskConfig,

    /// Passed to the signal source
    pub symbol: String,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(1000),
            fee_rate: dec!(0.001), // 0.1% taker
            risk: RiskConfig::default(),
            symbol: "BTCUSDT".to_string(),
        }
    }
}

/// A simulated position during backtesting.
#[derive(Debug, Clone)]
struct SimulatedPosition {
    side: PositionSide,
    entry_price: Decimal,
    entry_time: DateTime<Utc>,
    quantity: Decimal,
    margin: Decimal,
    leverage: u32,
    entry_fee: Decimal,
    /// Best favorable move seen on bars after the entry bar
    excursion: Decimal,
}

impl SimulatedPosition {
    fn pnl_at(&self, price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - price) * self.quantity,
        }
    }
}

/// Backtest results summary.
#[derive(Debug, Clone)]
pub struct BacktestResults {
    pub symbol: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub bars: usize,

    /// Append-only trade ledger
    pub trades: Vec<ClosedTrade>,

    /// One sample per bar
    pub equity_curve: Vec<EquitySample>,

    pub total_fees: Decimal,

    /// Signals the sizer rejected or the balance could not fund
    pub skipped_signals: usize,

    pub report: PerformanceReport,
}

impl BacktestResults {
    fn count_exits(&self, reason: ExitReason) -> usize {
        self.trades.iter().filter(|t| t.exit_reason == reason).count()
    }
}

impl fmt::Display for BacktestResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "Symbol: {} ({} bars)", self.symbol, self.bars)?;
        writeln!(
            f,
            "Period: {} to {}",
            self.start_time.format("%Y-%m-%d %H:%M"),
            self.end_time.format("%Y-%m-%d %H:%M")
        )?;
        writeln!(f)?;
        write!(f, "{}", self.report)?;
        writeln!(f)?;
        writeln!(f, "--- Execution ---")?;
        writeln!(f, "Fees Paid:     ${:.2}", self.total_fees)?;
        writeln!(f, "Skipped:       {} signals", self.skipped_signals)?;
        writeln!(
            f,
            "Exits:         {} SL / {} TP / {} signal / {} end of data",
            self.count_exits(ExitReason::StopLoss),
            self.count_exits(ExitReason::TakeProfit),
            self.count_exits(ExitReason::Signal),
            self.count_exits(ExitReason::EndOfData)
        )?;
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

/// Backtesting engine.
pub struct BacktestSimulator {
    config: BacktestConfig,
    sizer: PositionSizer,
    engine: TrailingStopEngine,
}

impl BacktestSimulator {
    pub fn new(config: BacktestConfig) -> Result<Self> {
        config.risk.validate()?;
        if config.initial_balance <= Decimal::ZERO {
            bail!("Initial balance must be positive, got {}", config.initial_balance);
        }
        if config.fee_rate < Decimal::ZERO || config.fee_rate >= Decimal::ONE {
            bail!("Fee rate must be in [0, 1), got {}", config.fee_rate);
        }

        Ok(Self {
            sizer: PositionSizer::new(config.risk.clone()),
            engine: TrailingStopEngine::new(config.risk.clone()),
            config,
        })
    }

    /// Replay `candles` (ascending open time) against `signals`.
    pub fn run(&self, candles: &[Candle], signals: &dyn SignalSource) -> Result<BacktestResults> {
        let (Some(first), Some(last)) = (candles.first(), candles.last()) else {
            bail!("No candles to replay");
        };
        for (i, bar) in candles.iter().enumerate() {
            if !bar.is_well_formed() {
                bail!("Malformed candle at index {} ({})", i, bar.open_time);
            }
            if i > 0 && bar.open_time <= candles[i - 1].open_time {
                bail!("Candles out of order at index {} ({})", i, bar.open_time);
            }
        }

        info!(
            symbol = %self.config.symbol,
            bars = candles.len(),
            balance = %self.config.initial_balance,
            "Starting backtest"
        );

        let mut cash = self.config.initial_balance;
        let mut position: Option<SimulatedPosition> = None;
        let mut trades: Vec<ClosedTrade> = Vec::new();
        let mut equity_curve: Vec<EquitySample> = Vec::with_capacity(candles.len());
        let mut total_fees = Decimal::ZERO;
        let mut skipped = 0;

        for (i, bar) in candles.iter().enumerate() {
            if let Some(mut pos) = position.take() {
                match self.step_open_position(&mut pos, bar, &candles[..=i], signals) {
                    Some((exit_price, reason)) => {
                        let trade = self.close(&pos, bar.open_time, exit_price, reason);
                        let exit_fee = trade.fees - pos.entry_fee;
                        cash += pos.margin + pos.pnl_at(exit_price) - exit_fee;
                        total_fees += exit_fee;
                        debug!(
                            time = %bar.open_time,
                            exit = %exit_price,
                            reason = reason.as_str(),
                            pnl = %trade.pnl,
                            "Closed position"
                        );
                        trades.push(trade);
                    }
                    None => position = Some(pos),
                }
            } else {
                let signal = signals.signal(&self.config.symbol, &candles[..=i]);
                if let Some(side) = signal.action.side() {
                    match self.open(cash, signal.confidence, side, bar) {
                        Ok(pos) => {
                            cash -= pos.margin + pos.entry_fee;
                            total_fees += pos.entry_fee;
                            debug!(
                                time = %bar.open_time,
                                side = %side,
                                price = %pos.entry_price,
                                margin = %pos.margin,
                                "Opened position"
                            );
                            position = Some(pos);
                        }
                        Err(reason) => {
                            skipped += 1;
                            debug!(time = %bar.open_time, reason = %reason, "Signal skipped");
                        }
                    }
                }
            }

            let unrealized = position
                .as_ref()
                .map(|p| p.margin + p.pnl_at(bar.close))
                .unwrap_or(Decimal::ZERO);
            equity_curve.push(EquitySample {
                timestamp: bar.open_time,
                equity: cash + unrealized,
            });
        }

        if let Some(pos) = position.take() {
            let trade = self.close(&pos, last.open_time, last.close, ExitReason::EndOfData);
            let exit_fee = trade.fees - pos.entry_fee;
            cash += pos.margin + pos.pnl_at(last.close) - exit_fee;
            total_fees += exit_fee;
            trades.push(trade);
            if let Some(sample) = equity_curve.last_mut() {
                sample.equity = cash;
            }
        }

        let report = PerformanceAnalyzer::analyze(&equity_curve, &trades, self.config.initial_balance);

        info!(
            trades = trades.len(),
            final_balance = %cash.round_dp(2),
            skipped,
            "Backtest complete"
        );

        Ok(BacktestResults {
            symbol: self.config.symbol.clone(),
            start_time: first.open_time,
            end_time: last.open_time,
            bars: candles.len(),
            trades,
            equity_curve,
            total_fees,
            skipped_signals: skipped,
            report,
        })
    }

    /// Returns the exit fill and reason when the position closes on this bar.
    fn step_open_position(
        &self,
        pos: &mut SimulatedPosition,
        bar: &Candle,
        history: &[Candle],
        signals: &dyn SignalSource,
    ) -> Option<(Decimal, ExitReason)> {
        let target = self.engine.evaluate(pos.entry_price, pos.side, pos.excursion);

        let (stop_hit, tp_hit) = match pos.side {
            PositionSide::Long => (bar.low <= target.sl_price, bar.high >= target.tp_price),
            PositionSide::Short => (bar.high >= target.sl_price, bar.low <= target.tp_price),
        };

        if stop_hit {
            // A gap through the stop fills at the open
            let fill = if pos.side.is_tighter(target.sl_price, bar.open) {
                bar.open
            } else {
                target.sl_price
            };
            return Some((fill, ExitReason::StopLoss));
        }
        if tp_hit {
            let fill = if pos.side.is_further(bar.open, target.tp_price) {
                bar.open
            } else {
                target.tp_price
            };
            return Some((fill, ExitReason::TakeProfit));
        }

        pos.excursion = pos.excursion.max(bar.best_move(pos.side, pos.entry_price));

        let signal = signals.signal(&self.config.symbol, history);
        let min_confidence = self.config.risk.min_confidence;
        match signal.action.side() {
            Some(side) if side != pos.side && signal.confidence >= min_confidence => {
                Some((bar.close, ExitReason::Signal))
            }
            _ => None,
        }
    }

    fn open(
        &self,
        cash: Decimal,
        confidence: Decimal,
        side: PositionSide,
        bar: &Candle,
    ) -> Result<SimulatedPosition, RejectReason> {
        let plan = self.sizer.size(cash, confidence, side)?;
        let entry_fee = plan.notional * self.config.fee_rate;
        if plan.margin + entry_fee > cash {
            return Err(RejectReason::InsufficientBalance {
                balance: cash,
                required_margin: plan.margin + entry_fee,
            });
        }

        Ok(SimulatedPosition {
            side,
            entry_price: bar.close,
            entry_time: bar.open_time,
            quantity: plan.notional / bar.close,
            margin: plan.margin,
            leverage: plan.leverage,
            entry_fee,
            excursion: Decimal::ZERO,
        })
    }

    fn close(&self, pos: &SimulatedPosition, time: DateTime<Utc>, exit_price: Decimal, reason: ExitReason) -> ClosedTrade {
        let exit_fee = pos.quantity * exit_price * self.config.fee_rate;
        let fees = pos.entry_fee + exit_fee;

        ClosedTrade {
            side: pos.side,
            entry_time: pos.entry_time,
            exit_time: time,
            entry_price: pos.entry_price,
            exit_price,
            quantity: pos.quantity,
            margin: pos.margin,
            leverage: pos.leverage,
            fees,
            pnl: pos.pnl_at(exit_price) - fees,
            exit_reason: reason,
            level: self.engine.evaluate(pos.entry_price, pos.side, pos.excursion).level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::{Action, ScriptedSignals, Signal};
    use chrono::{Duration, TimeZone};

    fn bars(rows: &[(Decimal, Decimal, Decimal, Decimal)]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        rows.iter()
            .enumerate()
            .map(|(i, (open, high, low, close))| Candle {
                open_time: start + Duration::hours(i as i64),
                open: *open,
                high: *high,
                low: *low,
                close: *close,
                volume: Decimal::ZERO,
            })
            .collect()
    }

    fn script(candles: &[Candle], entries: &[(usize, Action, Decimal)]) -> ScriptedSignals {
        ScriptedSignals::new(entries.iter().map(|(i, action, confidence)| {
            (
                candles[*i].open_time,
                Signal {
                    action: *action,
                    confidence: *confidence,
                },
            )
        }))
    }

    fn simulator() -> BacktestSimulator {
        BacktestSimulator::new(BacktestConfig::default()).unwrap()
    }

    #[test]
    fn test_stop_fills_at_stop_price() {
        let candles = bars(&[
            (dec!(100), dec!(100), dec!(100), dec!(100)),
            (dec!(100), dec!(100.1), dec!(99.4), dec!(99.6)),
            (dec!(99.6), dec!(99.8), dec!(99.5), dec!(99.7)),
        ]);
        let signals = script(&candles, &[(0, Action::Buy, dec!(75))]);

        let results = simulator().run(&candles, &signals).unwrap();

        assert_eq!(results.trades.len(), 1);
        let trade = &results.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert_eq!(trade.exit_price, dec!(99.5));
        // Floored to the 101 minimum notional: qty 1.01
        assert_eq!(trade.quantity, dec!(1.01));
        // -0.505 gross, 0.101 entry fee, 0.100495 exit fee
        assert_eq!(trade.pnl, dec!(-0.706495));
        assert_eq!(results.equity_curve.len(), 3);
        assert!((results.report.final_balance - dec!(999.293505)).abs() < dec!(0.000001));
        assert_eq!(results.total_fees, dec!(0.201495));
    }

    #[test]
    fn test_trailing_level_raises_stop() {
        let candles = bars(&[
            (dec!(100), dec!(100), dec!(100), dec!(100)),
            (dec!(100), dec!(100.6), dec!(100), dec!(100.5)),
            (dec!(100.5), dec!(100.5), dec!(100.05), dec!(100.2)),
        ]);
        let signals = script(&candles, &[(0, Action::Buy, dec!(75))]);

        let results = simulator().run(&candles, &signals).unwrap();

        let trade = &results.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert_eq!(trade.exit_price, dec!(100.1));
        assert_eq!(trade.level, "L2_LOCK_PROFIT");
        // Locked in before fees
        assert!(trade.pnl + trade.fees > Decimal::ZERO);
    }

    #[test]
    fn test_stop_checked_before_take_profit() {
        let candles = bars(&[
            (dec!(100), dec!(100), dec!(100), dec!(100)),
            (dec!(100), dec!(102), dec!(99), dec!(101)),
        ]);
        let signals = script(&candles, &[(0, Action::Buy, dec!(75))]);

        let results = simulator().run(&candles, &signals).unwrap();

        assert_eq!(results.trades[0].exit_reason, ExitReason::StopLoss);
    }

    #[test]
    fn test_short_take_profit_and_opposite_signal_exit() {
        let candles = bars(&[
            (dec!(100), dec!(100), dec!(100), dec!(100)),
            (dec!(100), dec!(100.2), dec!(98.4), dec!(98.6)),
            (dec!(98.6), dec!(98.6), dec!(98.6), dec!(98.6)),
            (dec!(98.6), dec!(98.7), dec!(98.5), dec!(98.6)),
            (dec!(98.6), dec!(98.7), dec!(98.5), dec!(98.6)),
        ]);
        let signals = script(
            &candles,
            &[
                (0, Action::Sell, dec!(60)),
                (1, Action::Buy, dec!(90)),
                (2, Action::Buy, dec!(60)),
                (3, Action::Sell, dec!(60)),
            ],
        );

        let results = simulator().run(&candles, &signals).unwrap();

        assert_eq!(results.trades.len(), 2);
        assert_eq!(results.trades[0].side, PositionSide::Short);
        assert_eq!(results.trades[0].exit_reason, ExitReason::TakeProfit);
        assert_eq!(results.trades[0].exit_price, dec!(98.5));
        // Bar 1's BUY is ignored: no re-entry on the bar that closed the short
        assert_eq!(results.trades[1].side, PositionSide::Long);
        assert_eq!(results.trades[1].entry_time, candles[2].open_time);
        assert_eq!(results.trades[1].exit_reason, ExitReason::Signal);
        assert_eq!(results.trades[1].exit_price, dec!(98.6));
    }

    #[test]
    fn test_low_confidence_signals_are_skipped() {
        let candles = bars(&[
            (dec!(100), dec!(100), dec!(100), dec!(100)),
            (dec!(100), dec!(100), dec!(100), dec!(100)),
        ]);
        let signals = script(&candles, &[(0, Action::Buy, dec!(10)), (1, Action::Hold, dec!(90))]);

        let results = simulator().run(&candles, &signals).unwrap();

        assert!(results.trades.is_empty());
        assert_eq!(results.skipped_signals, 1);
        assert_eq!(results.report.final_balance, dec!(1000));
        assert_eq!(results.report.max_drawdown, 0.0);
    }

    #[test]
    fn test_rejects_unordered_candles() {
        let mut candles = bars(&[
            (dec!(100), dec!(100), dec!(100), dec!(100)),
            (dec!(100), dec!(100), dec!(100), dec!(100)),
        ]);
        candles.swap(0, 1);
        assert!(simulator().run(&candles, &ScriptedSignals::default()).is_err());
        assert!(simulator().run(&[], &ScriptedSignals::default()).is_err());
    }
}
