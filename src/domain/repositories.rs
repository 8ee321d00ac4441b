//! Repository Pattern Abstractions
//!
//! Repository traits decouple the pipeline from the storage engine. The
//! SQLite implementations live in `infrastructure::persistence`; in-memory
//! implementations backing the integration tests live in
//! `infrastructure::repositories`.
//!
//! Time-windowed queries take an explicit `now_ms` so callers can pass
//! exchange-corrected time and tests can pin the clock.

use crate::domain::alerts::Alert;
use crate::domain::market::{Candle, IntegrityReport, VolumeFilter};
use anyhow::Result;
use async_trait::async_trait;

/// Persists and queries one-minute candles keyed by (symbol, open time).
#[async_trait]
pub trait CandleRepository: Send + Sync {
    /// Insert or update a candle. Idempotent; on conflict the mutable fields
    /// (high/low/close/volume/is_closed) are overwritten.
    async fn upsert(&self, candle: &Candle) -> Result<()>;

    /// The most recent `count` closed candles, ordered oldest first.
    async fn recent_closed(&self, symbol: &str, count: usize) -> Result<Vec<Candle>>;

    /// Quote volumes of closed candles in the window
    /// `[now - (hours + offset_minutes), now - offset_minutes)`, filtered by
    /// candle direction, ordered by open time.
    async fn historical_quote_volumes(
        &self,
        symbol: &str,
        hours: u64,
        offset_minutes: u64,
        filter: VolumeFilter,
        now_ms: i64,
    ) -> Result<Vec<f64>>;

    /// Delete candles older than the retention cutoff.
    async fn cleanup(&self, symbol: &str, retention_hours: u64, now_ms: i64) -> Result<u64>;

    /// Closed-candle coverage over the trailing `hours` window.
    async fn integrity(&self, symbol: &str, hours: u64, now_ms: i64) -> Result<IntegrityReport>;
}

/// Persists, updates and queries alerts.
#[async_trait]
pub trait AlertRepository: Send + Sync {
    /// Insert a new alert, returning the assigned id. Ids are monotone.
    async fn save(&self, alert: &Alert) -> Result<i64>;

    /// Full overwrite of the mutable fields of an existing row. The id never
    /// changes.
    async fn update(&self, id: i64, alert: &Alert) -> Result<()>;

    /// Volume-spike alerts for `symbol` newer than `minutes_back`.
    async fn recent_volume_spikes(
        &self,
        symbol: &str,
        minutes_back: u64,
        now_ms: i64,
    ) -> Result<Vec<Alert>>;

    /// Drop alerts older than the retention period.
    async fn cleanup(&self, older_than_days: u64, now_ms: i64) -> Result<u64>;
}

/// The set of symbols the scanner actively tracks.
#[async_trait]
pub trait WatchlistRepository: Send + Sync {
    async fn active_symbols(&self) -> Result<Vec<String>>;

    async fn add(&self, symbol: &str) -> Result<()>;

    async fn remove(&self, symbol: &str) -> Result<()>;
}
