//! Performance metrics from an equity curve and trade ledger: returns,
//! Sharpe/Sortino, max drawdown, Calmar, win rate, profit factor.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{ClosedTrade, EquitySample, PerformanceReport};

const SECONDS_PER_YEAR: f64 = 365.25 * 24.0 * 3600.0;

/// Stateless analyzer.
pub struct PerformanceAnalyzer;

impl PerformanceAnalyzer {
    /// Compute the report. `equity` holds one sample per bar in time order.
    pub fn analyze(equity: &[EquitySample], trades: &[ClosedTrade], initial_balance: Decimal) -> PerformanceReport {
        let mut report = PerformanceReport::empty(initial_balance);

        Self::trade_stats(&mut report, trades);

        let Some(last) = equity.last() else {
            return report;
        };
        report.final_balance = last.equity;

        let initial = initial_balance.to_f64().unwrap_or(0.0);
        let final_equity = last.equity.to_f64().unwrap_or(0.0);
        if initial > 0.0 {
            report.total_return = final_equity / initial - 1.0;
        }

        report.periods_per_year = Self::periods_per_year(equity);
        report.annualized_return = Self::annualize(report.total_return, report.periods_per_year, equity.len());

        let returns = Self::period_returns(equity);
        Self::sharpe_sortino(&mut report, &returns);

        report.max_drawdown = Self::max_drawdown(equity, initial_balance);
        if report.max_drawdown < 0.0 {
            report.calmar_ratio = report.annualized_return / report.max_drawdown.abs();
        }

        report
    }

    fn trade_stats(report: &mut PerformanceReport, trades: &[ClosedTrade]) {
        report.total_trades = trades.len();
        if trades.is_empty() {
            return;
        }

        let wins: Vec<Decimal> = trades.iter().map(|t| t.pnl).filter(|p| *p > Decimal::ZERO).collect();
        let losses: Vec<Decimal> = trades.iter().map(|t| t.pnl).filter(|p| *p < Decimal::ZERO).collect();

        report.winning_trades = wins.len();
        report.losing_trades = losses.len();
        report.win_rate = wins.len() as f64 / trades.len() as f64;

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();

        if !wins.is_empty() {
            report.avg_win = gross_profit / Decimal::from(wins.len());
        }
        if !losses.is_empty() {
            report.avg_loss = gross_loss / Decimal::from(losses.len());
        }

        report.profit_factor = if gross_loss > Decimal::ZERO {
            gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0)
        } else if gross_profit > Decimal::ZERO {
            f64::INFINITY
        } else {
            0.0
        };

        let net: Decimal = trades.iter().map(|t| t.pnl).sum();
        report.expectancy = net / Decimal::from(trades.len());
    }

    /// Bars per year from the median spacing between samples.
    fn periods_per_year(equity: &[EquitySample]) -> f64 {
        let mut gaps: Vec<i64> = equity
            .windows(2)
            .map(|w| (w[1].timestamp - w[0].timestamp).num_seconds())
            .filter(|s| *s > 0)
            .collect();
        if gaps.is_empty() {
            return 0.0;
        }
        gaps.sort_unstable();
        SECONDS_PER_YEAR / gaps[gaps.len() / 2] as f64
    }

    fn annualize(total_return: f64, periods_per_year: f64, samples: usize) -> f64 {
        let periods = samples.saturating_sub(1);
        if periods == 0 || periods_per_year <= 0.0 {
            return total_return;
        }
        let growth = 1.0 + total_return;
        if growth <= 0.0 {
            return -1.0;
        }
        growth.powf(periods_per_year / periods as f64) - 1.0
    }

    fn period_returns(equity: &[EquitySample]) -> Vec<f64> {
        equity
            .windows(2)
            .filter_map(|w| {
                let prev = w[0].equity.to_f64()?;
                let next = w[1].equity.to_f64()?;
                (prev > 0.0).then(|| next / prev - 1.0)
            })
            .collect()
    }

    /// Zero risk-free rate. Sortino uses downside deviation over all periods.
    fn sharpe_sortino(report: &mut PerformanceReport, returns: &[f64]) {
        if returns.len() < 2 || report.periods_per_year <= 0.0 {
            return;
        }
        let scale = report.periods_per_year.sqrt();

        let mean = returns.mean();
        let std_dev = returns.std_dev();
        if std_dev > 0.0 {
            report.sharpe_ratio = mean / std_dev * scale;
        }

        let downside = (returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / returns.len() as f64).sqrt();
        if downside > 0.0 {
            report.sortino_ratio = mean / downside * scale;
        }
    }

    /// Minimum of (equity - running peak) / running peak, starting from the
    /// initial balance. Always <= 0.
    fn max_drawdown(equity: &[EquitySample], initial_balance: Decimal) -> f64 {
        let mut peak = initial_balance.to_f64().unwrap_or(0.0);
        let mut worst = 0.0f64;

        for sample in equity {
            let value = sample.equity.to_f64().unwrap_or(0.0);
            if value > peak {
                peak = value;
            }
            if peak > 0.0 {
                worst = worst.min((value - peak) / peak);
            }
        }

        worst
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExitReason, PositionSide};
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn curve(values: &[Decimal]) -> Vec<EquitySample> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| EquitySample {
                timestamp: start + Duration::hours(i as i64),
                equity: *v,
            })
            .collect()
    }

    fn trade(pnl: Decimal) -> ClosedTrade {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ClosedTrade {
            side: PositionSide::Long,
            entry_time: t,
            exit_time: t + Duration::hours(1),
            entry_price: dec!(100),
            exit_price: dec!(101),
            quantity: dec!(1),
            margin: dec!(1),
            leverage: 150,
            fees: dec!(0.2),
            pnl,
            exit_reason: ExitReason::TakeProfit,
            level: "INITIAL".to_string(),
        }
    }

    #[test]
    fn test_monotonic_equity_has_no_drawdown() {
        let equity = curve(&[dec!(1000), dec!(1010), dec!(1025), dec!(1040)]);
        let trades = vec![trade(dec!(10)), trade(dec!(15)), trade(dec!(15))];

        let report = PerformanceAnalyzer::analyze(&equity, &trades, dec!(1000));

        assert_eq!(report.max_drawdown, 0.0);
        assert_eq!(report.calmar_ratio, 0.0);
        assert!(report.profit_factor.is_infinite());
        assert!(report.has_no_losses());
        assert!((report.total_return - 0.04).abs() < 1e-9);
        assert!((report.periods_per_year - 8766.0).abs() < 1e-6);
        assert!(report.sharpe_ratio > 0.0);
    }

    #[test]
    fn test_drawdown_and_trade_stats() {
        let equity = curve(&[dec!(1000), dec!(1500), dec!(500), dec!(1200)]);
        let trades = vec![trade(dec!(500)), trade(dec!(-1000)), trade(dec!(700))];

        let report = PerformanceAnalyzer::analyze(&equity, &trades, dec!(1000));

        // 1500 -> 500
        assert!((report.max_drawdown + 2.0 / 3.0).abs() < 1e-9);
        assert!(report.calmar_ratio != 0.0);
        assert_eq!(report.winning_trades, 2);
        assert_eq!(report.losing_trades, 1);
        assert!((report.win_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((report.profit_factor - 1.2).abs() < 1e-9);
        assert_eq!(report.avg_win, dec!(600));
        assert_eq!(report.avg_loss, dec!(1000));
        assert_eq!(report.expectancy, dec!(200) / dec!(3));
    }

    #[test]
    fn test_empty_inputs() {
        let report = PerformanceAnalyzer::analyze(&[], &[], dec!(1000));
        assert_eq!(report.total_trades, 0);
        assert_eq!(report.profit_factor, 0.0);
        assert_eq!(report.final_balance, dec!(1000));
    }
}
