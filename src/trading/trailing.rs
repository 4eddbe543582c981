//! Trailing-stop state machine.
//!
//! Maps (entry, side, best favorable excursion) to the active level and its
//! SL/TP prices. Pure: the caller tracks the excursion.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::PositionSide;
use super::{RiskConfig, TrailingLevel};

/// Name reported when no trailing level is active.
pub const DEFAULT_LEVEL: &str = "INITIAL";

/// Protection the engine wants for a position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrailTarget {
    pub level: String,
    /// Index into the trailing table, `None` for the initial stop
    pub level_index: Option<usize>,
    pub sl_price: Decimal,
    pub tp_price: Decimal,
}

#[derive(Debug, Clone)]
pub struct TrailingStopEngine {
    config: RiskConfig,
}

impl TrailingStopEngine {
    /// `config` is expected to have passed `RiskConfig::validate`, which
    /// guarantees stops only tighten as the level rises.
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Initial SL/TP for a fresh entry.
    pub fn initial_targets(&self, entry: Decimal, side: PositionSide) -> (Decimal, Decimal) {
        (
            side.price_at_offset(entry, -self.config.default_sl_pct),
            side.price_at_offset(entry, self.config.default_tp_pct),
        )
    }

    /// Highest level whose trigger has been reached, if any.
    pub fn active_level(&self, excursion: Decimal) -> Option<(usize, &TrailingLevel)> {
        self.config
            .trailing_levels
            .iter()
            .enumerate()
            .rev()
            .find(|(_, level)| level.trigger <= excursion)
    }

    pub fn evaluate(&self, entry: Decimal, side: PositionSide, excursion: Decimal) -> TrailTarget {
        let (default_sl, default_tp) = self.initial_targets(entry, side);

        let Some((index, level)) = self.active_level(excursion) else {
            return TrailTarget {
                level: DEFAULT_LEVEL.to_string(),
                level_index: None,
                sl_price: default_sl,
                tp_price: default_tp,
            };
        };

        let sl_price = side.price_at_offset(entry, level.sl_offset);

        // Levels without a TP keep whatever target the levels below them set.
        let tp_price = self.config.trailing_levels[..=index]
            .iter()
            .rev()
            .find_map(|l| l.tp_offset)
            .map(|offset| side.price_at_offset(entry, offset))
            .unwrap_or(default_tp);

        TrailTarget {
            level: level.name.clone(),
            level_index: Some(index),
            sl_price,
            tp_price,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }
}
