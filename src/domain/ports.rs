//! Ports to external collaborators.
//!
//! The pipeline only sees these traits; the Bybit REST client and the
//! broadcast event bus implement them in the infrastructure and application
//! layers.

use crate::domain::alerts::{OrderBookSnapshot, ScanEvent};
use crate::domain::market::Candle;
use anyhow::Result;
use async_trait::async_trait;

/// Drift-corrected time source. Implementations keep their offsets in
/// atomics, so reads are cheap and never suspend.
pub trait Clock: Send + Sync {
    /// Wall UTC corrected by the external time-server offset.
    fn now_utc_ms(&self) -> i64;

    /// Exchange time: corrected UTC plus the exchange offset.
    fn now_exchange_ms(&self) -> i64;

    /// Whether a candle closing at `close_time_ms` is over in exchange time.
    /// With no sync the offsets are zero and this degrades to the naive
    /// local comparison.
    fn is_candle_closed(&self, close_time_ms: i64) -> bool {
        self.now_exchange_ms() >= close_time_ms
    }
}

/// Fetches historical klines from the exchange REST endpoint.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Closed one-minute candles in `[start_ms, end_ms]`, oldest first,
    /// open times aligned to the minute.
    async fn fetch_klines(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>>;
}

/// Fetches a point-in-time order-book snapshot for alert annotation.
#[async_trait]
pub trait OrderBookProvider: Send + Sync {
    async fn order_book_snapshot(&self, symbol: &str) -> Result<OrderBookSnapshot>;
}

/// Downstream sink for scanner events. Implementations must not block the
/// per-symbol handler; delivery failures are the sink's problem.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, event: ScanEvent) -> Result<()>;
}
