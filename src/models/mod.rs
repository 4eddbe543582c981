//! Data models for positions, orders, trade records, candles and performance reports.

mod candle;
mod metrics;
mod order;
mod position;
mod trade;

pub use candle::Candle;
pub use metrics::{ClosedTrade, EquitySample, ExitReason, PerformanceReport};
pub use order::{OpenOrder, OrderAck, OrderKind, OrderRequest, ProtectionKind, ProtectiveOrder};
pub use position::{Position, PositionSide};
pub use trade::{TradeRecord, TradeSide, TradeStatus};
