//! Trading logic: risk config, sizing, trailing stops, and the background workers.

mod clock;
mod config;
mod gateway;
mod janitor;
mod position_sizer;
mod reconciler;
mod signal;
mod trailing;

pub use clock::ClockSync;
pub use config::{ReplacePolicy, RiskConfig, ServiceConfig, TrailingLevel};
pub use gateway::{EntryRequest, ExecutionGateway};
pub use janitor::StaleEntryJanitor;
pub use position_sizer::{PositionSizer, SizingPlan};
pub use reconciler::{ProtectiveOrderReconciler, SymbolStatus};
pub use signal::{Action, ScriptedSignals, Signal, SignalSource};
pub use trailing::TrailingStopEngine;
