//! Performance statistics over backtest results.

mod calculator;

pub use calculator::PerformanceAnalyzer;
