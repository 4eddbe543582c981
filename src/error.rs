//! Error taxonomy for the guardian.
//!
//! Only `EngineError::Configuration` is fatal, and only at startup. Everything
//! else is reported per symbol and the loops keep going.

use rust_decimal::Decimal;
use thiserror::Error;

/// Failure of a single exchange call.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Timeout, connection failure, rate limit or exchange-side 5xx.
    /// Picked up again on the next poll, never retried in place.
    #[error("transient exchange failure: {0}")]
    Transient(String),

    /// The exchange refused the request (precision, unknown order, already filled...).
    #[error("exchange rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },

    /// Signed request fell outside the exchange's receive window.
    #[error("request timestamp rejected: {0}")]
    ClockSkew(String),

    /// Response body could not be understood.
    #[error("failed to decode exchange response: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// Whether the next poll is expected to succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_) | ExchangeError::ClockSkew(_))
    }

    /// Binance code for "order does not exist", returned when cancelling
    /// something that already triggered or was cancelled elsewhere.
    pub fn is_unknown_order(&self) -> bool {
        matches!(self, ExchangeError::Rejected { code: -2011, .. } | ExchangeError::Rejected { code: -2013, .. })
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ExchangeError::Decode(err.to_string())
        } else {
            ExchangeError::Transient(err.to_string())
        }
    }
}

/// Why the sizer refused to produce an order plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("LOW_CONFIDENCE: {confidence} below minimum {minimum}")]
    LowConfidence { confidence: Decimal, minimum: Decimal },

    #[error("INSUFFICIENT_BALANCE: balance {balance} cannot fund required margin {required_margin}")]
    InsufficientBalance { balance: Decimal, required_margin: Decimal },

    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    #[error("HOLD: signal does not ask for a position")]
    Hold,
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("sizing rejected: {0}")]
    SizingRejected(#[from] RejectReason),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("clock sync failed: {0}")]
    ClockSkew(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Persistence(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Transient("timeout".into()).is_transient());
        assert!(ExchangeError::ClockSkew("-1021".into()).is_transient());
        assert!(!ExchangeError::Rejected { code: -1111, message: "precision".into() }.is_transient());
    }

    #[test]
    fn test_unknown_order_detection() {
        let err = ExchangeError::Rejected { code: -2011, message: "Unknown order sent.".into() };
        assert!(err.is_unknown_order());
        assert!(!ExchangeError::Decode("bad".into()).is_unknown_order());
    }
}
