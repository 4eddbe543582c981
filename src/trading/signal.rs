//! Trade signals and the interface to whatever produces them.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Candle, PositionSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    /// Position this action asks for, `None` for HOLD.
    pub fn side(&self) -> Option<PositionSide> {
        match self {
            Action::Buy => Some(PositionSide::Long),
            Action::Sell => Some(PositionSide::Short),
            Action::Hold => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
            Action::Hold => "HOLD",
        };
        f.write_str(s)
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Upstream labels look like "STRONG BUY" or "SELL (weak)"
        let upper = s.to_ascii_uppercase();
        if upper.contains("HOLD") {
            Ok(Action::Hold)
        } else if upper.contains("BUY") || upper.contains("LONG") {
            Ok(Action::Buy)
        } else if upper.contains("SELL") || upper.contains("SHORT") {
            Ok(Action::Sell)
        } else {
            Err(format!("unknown action: {}", s))
        }
    }
}

/// Action plus confidence (0-100).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub action: Action,
    pub confidence: Decimal,
}

impl Signal {
    pub fn hold() -> Self {
        Self {
            action: Action::Hold,
            confidence: Decimal::ZERO,
        }
    }
}

/// Produces a signal for a symbol given the candles seen so far.
/// Opaque to the engine; the backtest calls it once per bar.
pub trait SignalSource {
    fn signal(&self, symbol: &str, history: &[Candle]) -> Signal;
}

#[derive(Debug, Clone, Deserialize)]
struct TimedSignal {
    #[serde(alias = "time")]
    timestamp: DateTime<Utc>,
    action: Action,
    confidence: Decimal,
}

/// Signals recorded ahead of time, keyed by the open time of the bar they apply to.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSignals {
    by_time: HashMap<DateTime<Utc>, Signal>,
}

impl ScriptedSignals {
    pub fn new(signals: impl IntoIterator<Item = (DateTime<Utc>, Signal)>) -> Self {
        Self {
            by_time: signals.into_iter().collect(),
        }
    }

    /// Load `[{"timestamp": ..., "action": "BUY", "confidence": 72}, ...]`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read signals {}", path.display()))?;
        let entries: Vec<TimedSignal> = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid signals file {}", path.display()))?;

        Ok(Self::new(entries.into_iter().map(|e| {
            (
                e.timestamp,
                Signal {
                    action: e.action,
                    confidence: e.confidence,
                },
            )
        })))
    }

    pub fn len(&self) -> usize {
        self.by_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_time.is_empty()
    }
}

impl SignalSource for ScriptedSignals {
    fn signal(&self, _symbol: &str, history: &[Candle]) -> Signal {
        history
            .last()
            .and_then(|bar| self.by_time.get(&bar.open_time))
            .copied()
            .unwrap_or_else(Signal::hold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_labels() {
        assert_eq!("STRONG BUY".parse::<Action>().unwrap(), Action::Buy);
        assert_eq!("sell".parse::<Action>().unwrap(), Action::Sell);
        assert_eq!("HOLD".parse::<Action>().unwrap(), Action::Hold);
        assert!("maybe".parse::<Action>().is_err());
        assert_eq!(Action::Sell.side(), Some(PositionSide::Short));
    }
}
