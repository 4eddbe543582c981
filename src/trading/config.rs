//! Risk and service configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// One row of the trailing-stop table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingLevel {
    pub name: String,

    /// Favorable move (fraction of entry) that activates this level
    pub trigger: Decimal,

    /// Stop offset from entry in the favorable direction.
    /// 0 is break-even, positive locks in profit, negative still risks some loss.
    pub sl_offset: Decimal,

    /// Take-profit offset from entry. `None` keeps the previous target.
    #[serde(default)]
    pub tp_offset: Option<Decimal>,
}

impl TrailingLevel {
    pub fn new(name: &str, trigger: Decimal, sl_offset: Decimal, tp_offset: Option<Decimal>) -> Self {
        Self {
            name: name.to_string(),
            trigger,
            sl_offset,
            tp_offset,
        }
    }
}

/// Immutable risk parameters shared by the live engine and the backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of balance a single stopped-out trade may lose
    pub max_drawdown_per_trade: Decimal,

    pub base_leverage: u32,

    /// Initial stop distance (fraction of entry)
    pub default_sl_pct: Decimal,

    /// Initial take-profit distance (fraction of entry)
    pub default_tp_pct: Decimal,

    /// Signals below this confidence (0-100) are rejected
    pub min_confidence: Decimal,

    /// Exchange minimum order notional in quote currency
    pub min_notional: Decimal,

    /// Largest fraction of balance a single entry may post as margin
    pub max_margin_fraction: Decimal,

    /// Protective orders are only replaced when the target moves by more
    /// than this fraction of the new trigger
    pub min_trail_delta: Decimal,

    /// Unfilled LIMIT entries older than this are cancelled
    pub stale_entry_ttl_secs: u64,

    /// Ordered by ascending trigger
    pub trailing_levels: Vec<TrailingLevel>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown_per_trade: dec!(0.02), // 2% of balance per stop-out
            base_leverage: 150,
            default_sl_pct: dec!(0.005),        // 0.5%
            default_tp_pct: dec!(0.015),        // 1.5%, 1:3 R:R
            min_confidence: dec!(20),
            min_notional: dec!(101),            // Binance floor is 100, keep a buffer
            max_margin_fraction: dec!(0.98),
            min_trail_delta: dec!(0.0001),
            stale_entry_ttl_secs: 4 * 3600,
            trailing_levels: vec![
                TrailingLevel::new("L1_BREAK_EVEN", dec!(0.002), dec!(0.0), None),
                TrailingLevel::new("L2_LOCK_PROFIT", dec!(0.005), dec!(0.001), Some(dec!(0.020))),
                TrailingLevel::new("L3_SECURE_PROFIT", dec!(0.010), dec!(0.005), Some(dec!(0.030))),
            ],
        }
    }
}

impl RiskConfig {
    /// Load from a JSON file, falling back to defaults for missing fields.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read risk config {}", path.display()))?;
        let config: RiskConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid risk config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn stale_entry_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_entry_ttl_secs)
    }

    /// Reject parameter sets that would size or trail incorrectly.
    pub fn validate(&self) -> Result<(), EngineError> {
        let fraction = |name: &str, v: Decimal| -> Result<(), EngineError> {
            if v <= Decimal::ZERO || v >= Decimal::ONE {
                return Err(EngineError::Configuration(format!("{} must be in (0, 1), got {}", name, v)));
            }
            Ok(())
        };

        fraction("max_drawdown_per_trade", self.max_drawdown_per_trade)?;
        fraction("default_sl_pct", self.default_sl_pct)?;
        fraction("default_tp_pct", self.default_tp_pct)?;

        if self.base_leverage == 0 {
            return Err(EngineError::Configuration("base_leverage must be at least 1".into()));
        }
        if self.min_confidence < Decimal::ZERO || self.min_confidence > dec!(100) {
            return Err(EngineError::Configuration(format!(
                "min_confidence must be in [0, 100], got {}",
                self.min_confidence
            )));
        }
        if self.min_notional < Decimal::ZERO {
            return Err(EngineError::Configuration("min_notional must not be negative".into()));
        }
        if self.max_margin_fraction <= Decimal::ZERO || self.max_margin_fraction > Decimal::ONE {
            return Err(EngineError::Configuration(format!(
                "max_margin_fraction must be in (0, 1], got {}",
                self.max_margin_fraction
            )));
        }
        if self.min_trail_delta < Decimal::ZERO {
            return Err(EngineError::Configuration("min_trail_delta must not be negative".into()));
        }
        if self.stale_entry_ttl_secs == 0 {
            return Err(EngineError::Configuration("stale_entry_ttl_secs must be positive".into()));
        }

        self.validate_trailing_table()
    }

    fn validate_trailing_table(&self) -> Result<(), EngineError> {
        // A level's stop may never be looser than the initial stop or the level below it.
        let mut prev_trigger = Decimal::ZERO;
        let mut prev_sl = -self.default_sl_pct;

        for level in &self.trailing_levels {
            if level.trigger <= prev_trigger {
                return Err(EngineError::Configuration(format!(
                    "trailing level {} trigger {} must be positive and above the previous level",
                    level.name, level.trigger
                )));
            }
            if level.sl_offset < prev_sl {
                return Err(EngineError::Configuration(format!(
                    "trailing level {} would loosen the stop ({} < {})",
                    level.name, level.sl_offset, prev_sl
                )));
            }
            if level.sl_offset >= level.trigger {
                return Err(EngineError::Configuration(format!(
                    "trailing level {} stop offset {} is at or beyond its trigger {}",
                    level.name, level.sl_offset, level.trigger
                )));
            }
            if let Some(tp) = level.tp_offset {
                if tp <= level.trigger {
                    return Err(EngineError::Configuration(format!(
                        "trailing level {} take-profit {} is not beyond its trigger {}",
                        level.name, tp, level.trigger
                    )));
                }
            }
            prev_trigger = level.trigger;
            prev_sl = level.sl_offset;
        }

        Ok(())
    }
}

/// Order in which a protective order is swapped for a better one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePolicy {
    /// Cancel first. Leaves the position briefly unprotected; a failed
    /// placement is repaired on the next poll.
    #[default]
    CancelThenPlace,
    /// Place first. Briefly leaves two protective orders of the same kind.
    PlaceThenCancel,
}

/// Runtime settings for the background loops.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Reconciler poll interval
    pub poll_interval: Duration,

    /// Stale-entry janitor interval
    pub janitor_interval: Duration,

    /// Clock is resynced every N reconciler cycles
    pub clock_resync_cycles: u32,

    /// Hard deadline for any single exchange call
    pub call_timeout: Duration,

    /// Symbols watched by the janitor and the record lifecycle
    pub symbols: Vec<String>,

    /// Log decisions without placing or cancelling orders
    pub dry_run: bool,

    pub replace_policy: ReplacePolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            janitor_interval: Duration::from_secs(30),
            clock_resync_cycles: 10, // ~5 min at the default poll interval
            call_timeout: Duration::from_secs(10),
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string(), "SOLUSDT".to_string()],
            dry_run: false,
            replace_policy: ReplacePolicy::CancelThenPlace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RiskConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_loosening_table() {
        let mut config = RiskConfig::default();
        config.trailing_levels[2].sl_offset = dec!(-0.001);

        let err = config.validate().unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_rejects_unsorted_triggers() {
        let mut config = RiskConfig::default();
        config.trailing_levels.swap(0, 1);

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let config = RiskConfig {
            default_sl_pct: Decimal::ZERO,
            ..RiskConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RiskConfig {
            base_leverage: 0,
            ..RiskConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RiskConfig = serde_json::from_str(r#"{"base_leverage": 20}"#).unwrap();
        assert_eq!(config.base_leverage, 20);
        assert_eq!(config.default_sl_pct, dec!(0.005));
        assert_eq!(config.trailing_levels.len(), 3);
    }
}
