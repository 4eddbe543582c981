//! Exchange clock synchronization.
//!
//! Signed requests carry a millisecond timestamp the exchange only accepts
//! inside its receive window. The offset between the local clock and the
//! exchange clock is estimated from the round-trip midpoint and applied to
//! every timestamp. Single writer (the sync task), many readers.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoff;
use chrono::Utc;
use tracing::{info, warn};

use crate::api::Exchange;
use crate::error::{EngineError, ExchangeError};

#[derive(Debug, Default)]
pub struct ClockSync {
    offset_ms: AtomicI64,
    synced: AtomicBool,
    resync_requested: AtomicBool,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local wall clock in epoch milliseconds.
    pub fn local_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Current estimate of the exchange clock.
    pub fn now_ms(&self) -> i64 {
        Self::local_ms() + self.offset_ms()
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Ask the sync task to recalibrate before its next scheduled run.
    pub fn request_resync(&self) {
        self.resync_requested.store(true, Ordering::Release);
    }

    /// Consume a pending resync request.
    pub fn take_resync_request(&self) -> bool {
        self.resync_requested.swap(false, Ordering::AcqRel)
    }

    /// Recalibrate against the exchange. On failure the previous offset is kept.
    pub async fn sync(&self, exchange: &dyn Exchange) -> Result<i64, EngineError> {
        let sent = Self::local_ms();
        match exchange.get_server_time().await {
            Ok(server_time) => {
                let received = Self::local_ms();
                let midpoint = sent + (received - sent) / 2;
                let offset = server_time - midpoint;

                self.offset_ms.store(offset, Ordering::Release);
                self.synced.store(true, Ordering::Release);
                info!(offset_ms = offset, rtt_ms = received - sent, "Exchange clock synced");
                Ok(offset)
            }
            Err(e) => {
                warn!(
                    operation = "get_server_time",
                    error = %e,
                    offset_ms = self.offset_ms(),
                    "Clock sync failed, keeping previous offset"
                );
                Err(EngineError::ClockSkew(e.to_string()))
            }
        }
    }

    /// Startup sync: retried with exponential backoff for at most `max_elapsed`.
    pub async fn sync_with_retry(&self, exchange: &dyn Exchange, max_elapsed: Duration) -> Result<i64, EngineError> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_elapsed_time: Some(max_elapsed),
            ..ExponentialBackoff::default()
        };

        backoff::future::retry(policy, || async {
            self.sync(exchange).await.map_err(|e| match e {
                EngineError::ClockSkew(_) => backoff::Error::transient(e),
                other => backoff::Error::permanent(other),
            })
        })
        .await
    }

    /// Hook for adapters: a timestamp rejection means the offset drifted.
    pub fn observe_error(&self, err: &ExchangeError) {
        if matches!(err, ExchangeError::ClockSkew(_)) {
            self.request_resync();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockExchange;

    #[tokio::test]
    async fn test_offset_tracks_server_time() {
        let exchange = MockExchange::new();
        let server = ClockSync::local_ms() + 5_000;
        exchange.set_server_time(Some(server));

        let clock = ClockSync::new();
        let offset = tokio_test::assert_ok!(clock.sync(&exchange).await);

        assert!(clock.is_synced());
        assert!((offset - 5_000).abs() < 1_000, "offset {}", offset);
        assert!((clock.now_ms() - (ClockSync::local_ms() + offset)).abs() < 50);
    }

    #[tokio::test]
    async fn test_failed_sync_retains_previous_offset() {
        let exchange = MockExchange::new();
        exchange.set_server_time(Some(ClockSync::local_ms() - 3_000));

        let clock = ClockSync::new();
        let offset = clock.sync(&exchange).await.unwrap();
        assert_ne!(offset, 0);

        exchange.set_server_time(None);
        let result = clock.sync(&exchange).await;

        assert!(matches!(result, Err(EngineError::ClockSkew(_))));
        assert_eq!(clock.offset_ms(), offset);
        assert!(clock.is_synced());
    }

    #[test]
    fn test_clock_skew_error_requests_resync() {
        let clock = ClockSync::new();
        clock.observe_error(&ExchangeError::Transient("timeout".into()));
        assert!(!clock.take_resync_request());

        clock.observe_error(&ExchangeError::ClockSkew("-1021".into()));
        assert!(clock.take_resync_request());
        assert!(!clock.take_resync_request());
    }
}
