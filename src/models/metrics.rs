//! Backtest ledger entries and the performance report computed from them.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::PositionSide;

/// Why a simulated position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Signal,
    EndOfData,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::Signal => "SIGNAL",
            ExitReason::EndOfData => "END_OF_DATA",
        }
    }
}

/// Completed round trip in the backtest ledger. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub side: PositionSide,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    /// Contract quantity
    pub quantity: Decimal,
    pub margin: Decimal,
    pub leverage: u32,
    /// Entry plus exit fee
    pub fees: Decimal,
    /// Net of fees
    pub pnl: Decimal,
    pub exit_reason: ExitReason,
    /// Trailing level active when the position closed
    pub level: String,
}

/// Account equity observed at the close of one bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquitySample {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

/// Summary statistics over an equity curve and trade ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub initial_balance: Decimal,

    pub final_balance: Decimal,

    /// Fractional return over the whole run
    pub total_return: f64,

    pub annualized_return: f64,

    /// Annualized, zero risk-free rate
    pub sharpe_ratio: f64,

    pub sortino_ratio: f64,

    /// Worst peak-to-trough decline as a non-positive fraction (-0.25 = 25% below peak)
    pub max_drawdown: f64,

    /// Annualized return / |max drawdown|, 0 when there was no drawdown
    pub calmar_ratio: f64,

    pub total_trades: usize,

    pub winning_trades: usize,

    pub losing_trades: usize,

    /// 0.0 to 1.0
    pub win_rate: f64,

    pub avg_win: Decimal,

    /// Absolute value
    pub avg_loss: Decimal,

    /// Gross profit / gross loss. `f64::INFINITY` when there are wins and no
    /// losses, 0.0 when there are no wins.
    pub profit_factor: f64,

    /// Mean net P&L per trade
    pub expectancy: Decimal,

    pub periods_per_year: f64,
}

impl PerformanceReport {
    pub fn empty(initial_balance: Decimal) -> Self {
        Self {
            initial_balance,
            final_balance: initial_balance,
            total_return: 0.0,
            annualized_return: 0.0,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            max_drawdown: 0.0,
            calmar_ratio: 0.0,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            avg_win: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            profit_factor: 0.0,
            expectancy: Decimal::ZERO,
            periods_per_year: 0.0,
        }
    }

    /// True when no trade in the ledger lost money.
    pub fn has_no_losses(&self) -> bool {
        self.losing_trades == 0
    }
}

impl fmt::Display for PerformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Capital ---")?;
        writeln!(f, "Initial:       ${:.2}", self.initial_balance)?;
        writeln!(f, "Final:         ${:.2}", self.final_balance)?;
        writeln!(f, "Return:        {:.2}%", self.total_return * 100.0)?;
        writeln!(f, "Annualized:    {:.2}%", self.annualized_return * 100.0)?;
        writeln!(f)?;
        writeln!(f, "--- Trades ---")?;
        writeln!(f, "Total:         {}", self.total_trades)?;
        writeln!(f, "Winners:       {} ({:.1}%)", self.winning_trades, self.win_rate * 100.0)?;
        writeln!(f, "Losers:        {}", self.losing_trades)?;
        writeln!(f, "Avg Win:       ${:.2}", self.avg_win)?;
        writeln!(f, "Avg Loss:      ${:.2}", self.avg_loss)?;
        if self.profit_factor.is_infinite() {
            writeln!(f, "Profit Factor: inf (no losing trades)")?;
        } else {
            writeln!(f, "Profit Factor: {:.2}", self.profit_factor)?;
        }
        writeln!(f, "Expectancy:    ${:.2}", self.expectancy)?;
        writeln!(f)?;
        writeln!(f, "--- Risk Metrics ---")?;
        writeln!(f, "Max Drawdown:  {:.2}%", self.max_drawdown * 100.0)?;
        writeln!(f, "Sharpe Ratio:  {:.2}", self.sharpe_ratio)?;
        writeln!(f, "Sortino Ratio: {:.2}", self.sortino_ratio)?;
        writeln!(f, "Calmar Ratio:  {:.2}", self.calmar_ratio)?;
        Ok(())
    }
}
