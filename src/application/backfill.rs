//! Historical backfill and stored-window maintenance.
//!
//! At startup every watchlist symbol is checked for closed-candle coverage
//! over the full window the detectors need (retention + analysis + one hour
//! of slack) and refilled from the REST kline endpoint when coverage is
//! poor. After each processed close the same service evicts expired candles
//! and refills fresh gaps.

use crate::application::processor::RangeMaintainer;
use crate::config::SettingsHandle;
use crate::domain::market::Candle;
use crate::domain::ports::{Clock, HistoryProvider};
use crate::domain::repositories::CandleRepository;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

const STARTUP_MIN_PERCENT: f64 = 80.0;
const STARTUP_MIN_EXISTING: u64 = 60;
const MAINTAIN_MIN_PERCENT: f64 = 90.0;
const MAINTAIN_MAX_MISSING: u64 = 5;
/// Pause between per-symbol REST loads.
const LOAD_PACING_MS: u64 = 100;

pub struct BackfillService {
    candles: Arc<dyn CandleRepository>,
    history: Arc<dyn HistoryProvider>,
    clock: Arc<dyn Clock>,
    settings: SettingsHandle,
}

impl BackfillService {
    pub fn new(
        candles: Arc<dyn CandleRepository>,
        history: Arc<dyn HistoryProvider>,
        clock: Arc<dyn Clock>,
        settings: SettingsHandle,
    ) -> Self {
        Self {
            candles,
            history,
            clock,
            settings,
        }
    }

    /// Check coverage for every symbol and refill the poor ones.
    pub async fn run_startup(&self, symbols: &[String]) {
        let hours = self.settings.snapshot().total_history_hours();
        let now_ms = self.clock.now_utc_ms();

        let mut to_load = Vec::new();
        for symbol in symbols {
            match self.candles.integrity(symbol, hours, now_ms).await {
                Ok(report)
                    if report.percent < STARTUP_MIN_PERCENT
                        || report.existing < STARTUP_MIN_EXISTING =>
                {
                    info!(
                        symbol,
                        existing = report.existing,
                        expected = report.expected,
                        percent = format!("{:.1}", report.percent),
                        "Backfill required"
                    );
                    to_load.push(symbol.clone());
                }
                Ok(report) => {
                    debug!(
                        symbol,
                        existing = report.existing,
                        percent = format!("{:.1}", report.percent),
                        "Stored data is current"
                    );
                }
                Err(e) => {
                    warn!(symbol, "Integrity check failed, scheduling load: {:#}", e);
                    to_load.push(symbol.clone());
                }
            }
        }

        if to_load.is_empty() {
            info!("All {} symbols have current data", symbols.len());
            return;
        }

        info!("Loading history for {} symbols", to_load.len());
        for symbol in &to_load {
            if let Err(e) = self.load_symbol(symbol, hours).await {
                warn!(symbol, "History load failed: {:#}", e);
            }
            sleep(Duration::from_millis(LOAD_PACING_MS)).await;
        }
        info!("Startup backfill finished");
    }

    /// Backfill one symbol for new watchlist entries.
    pub async fn backfill_symbol(&self, symbol: &str) -> Result<()> {
        let hours = self.settings.snapshot().total_history_hours();
        self.load_symbol(symbol, hours).await
    }

    async fn load_symbol(&self, symbol: &str, hours: u64) -> Result<()> {
        let end_ms = self.clock.now_utc_ms();
        let start_ms = end_ms - hours as i64 * 3_600_000;

        let klines = self
            .history
            .fetch_klines(symbol, start_ms, end_ms)
            .await
            .context("Kline fetch failed")?;

        let now_exchange_ms = self.clock.now_exchange_ms();
        let mut saved = 0usize;
        for mut candle in klines {
            candle.open_time_ms = Candle::align_to_minute(candle.open_time_ms);
            candle.close_time_ms = Candle::close_time_for(candle.open_time_ms);
            // The newest row may still be forming; never archive it as
            // closed.
            if candle.close_time_ms > now_exchange_ms {
                continue;
            }
            candle.is_closed = true;
            self.candles
                .upsert(&candle)
                .await
                .context("Backfill upsert failed")?;
            saved += 1;
        }

        debug!(symbol, saved, "Backfill loaded candles");
        Ok(())
    }
}

#[async_trait]
impl RangeMaintainer for BackfillService {
    /// Evict expired candles, then refill when the window decayed: coverage
    /// under 90% with more than five candles missing.
    async fn maintain_range(&self, symbol: &str) -> Result<()> {
        let hours = self.settings.snapshot().total_history_hours();
        let now_ms = self.clock.now_utc_ms();

        self.candles
            .cleanup(symbol, hours, now_ms)
            .await
            .context("Candle cleanup failed")?;

        let report = self
            .candles
            .integrity(symbol, hours, now_ms)
            .await
            .context("Integrity check failed")?;

        if report.percent < MAINTAIN_MIN_PERCENT && report.missing > MAINTAIN_MAX_MISSING {
            info!(
                symbol,
                missing = report.missing,
                percent = format!("{:.1}", report.percent),
                "Refilling decayed window"
            );
            self.load_symbol(symbol, hours).await?;
        }

        Ok(())
    }
}
