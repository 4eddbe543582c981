//! Exchange adapter: the trait the control loops consume and its Binance futures implementation.

mod binance_client;
mod exchange;
mod types;

#[cfg(test)]
pub mod mock;

pub use binance_client::BinanceClient;
pub use exchange::{normalize_symbol, Exchange, SymbolRules, TimedExchange};
