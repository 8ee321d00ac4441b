//! Thread-safe in-memory repository implementations.
//!
//! They honor the same contracts as the SQLite repositories (monotone ids,
//! closed-only window queries, update-in-place) and back the integration
//! tests and offline runs.

use crate::domain::alerts::{Alert, AlertKind};
use crate::domain::market::{Candle, IntegrityReport, VolumeFilter};
use crate::domain::repositories::{AlertRepository, CandleRepository, WatchlistRepository};
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryCandleRepository {
    candles: RwLock<HashMap<String, BTreeMap<i64, Candle>>>,
}

impl InMemoryCandleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self, symbol: &str) -> usize {
        self.candles
            .read()
            .await
            .get(symbol)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CandleRepository for InMemoryCandleRepository {
    async fn upsert(&self, candle: &Candle) -> Result<()> {
        let mut guard = self.candles.write().await;
        guard
            .entry(candle.symbol.clone())
            .or_default()
            .insert(candle.open_time_ms, candle.clone());
        Ok(())
    }

    async fn recent_closed(&self, symbol: &str, count: usize) -> Result<Vec<Candle>> {
        let guard = self.candles.read().await;
        let Some(per_symbol) = guard.get(symbol) else {
            return Ok(Vec::new());
        };
        let mut closed: Vec<Candle> = per_symbol
            .values()
            .rev()
            .filter(|c| c.is_closed)
            .take(count)
            .cloned()
            .collect();
        closed.reverse();
        Ok(closed)
    }

    async fn historical_quote_volumes(
        &self,
        symbol: &str,
        hours: u64,
        offset_minutes: u64,
        filter: VolumeFilter,
        now_ms: i64,
    ) -> Result<Vec<f64>> {
        let end_ms = now_ms - offset_minutes as i64 * 60_000;
        let start_ms = end_ms - hours as i64 * 3_600_000;

        let guard = self.candles.read().await;
        let Some(per_symbol) = guard.get(symbol) else {
            return Ok(Vec::new());
        };
        Ok(per_symbol
            .range(start_ms..end_ms)
            .map(|(_, c)| c)
            .filter(|c| c.is_closed)
            .filter(|c| match filter {
                VolumeFilter::Bull => c.is_bullish(),
                VolumeFilter::Bear => !c.is_bullish(),
                VolumeFilter::All => true,
            })
            .map(|c| c.volume_quote_f64())
            .collect())
    }

    async fn cleanup(&self, symbol: &str, retention_hours: u64, now_ms: i64) -> Result<u64> {
        let cutoff_ms = now_ms - retention_hours as i64 * 3_600_000;
        let mut guard = self.candles.write().await;
        let Some(per_symbol) = guard.get_mut(symbol) else {
            return Ok(0);
        };
        let before = per_symbol.len();
        per_symbol.retain(|open_time_ms, _| *open_time_ms >= cutoff_ms);
        Ok((before - per_symbol.len()) as u64)
    }

    async fn integrity(&self, symbol: &str, hours: u64, now_ms: i64) -> Result<IntegrityReport> {
        let expected = hours * 60;
        let start_ms = now_ms - hours as i64 * 3_600_000;

        let guard = self.candles.read().await;
        let existing = guard
            .get(symbol)
            .map(|per_symbol| {
                per_symbol
                    .range(start_ms..)
                    .filter(|(_, c)| c.is_closed)
                    .count() as u64
            })
            .unwrap_or(0);
        Ok(IntegrityReport::new(expected, existing))
    }
}

#[derive(Default)]
struct AlertStore {
    next_id: i64,
    rows: BTreeMap<i64, Alert>,
}

#[derive(Default)]
pub struct InMemoryAlertRepository {
    store: RwLock<AlertStore>,
}

impl InMemoryAlertRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Alert> {
        self.store.read().await.rows.values().cloned().collect()
    }

    pub async fn by_id(&self, id: i64) -> Option<Alert> {
        self.store.read().await.rows.get(&id).cloned()
    }

    pub async fn by_kind(&self, kind: AlertKind) -> Vec<Alert> {
        self.store
            .read()
            .await
            .rows
            .values()
            .filter(|a| a.kind() == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AlertRepository for InMemoryAlertRepository {
    async fn save(&self, alert: &Alert) -> Result<i64> {
        let mut store = self.store.write().await;
        store.next_id += 1;
        let id = store.next_id;
        let mut row = alert.clone();
        row.id = Some(id);
        store.rows.insert(id, row);
        Ok(id)
    }

    async fn update(&self, id: i64, alert: &Alert) -> Result<()> {
        let mut store = self.store.write().await;
        let Some(existing) = store.rows.get_mut(&id) else {
            bail!("No alert with id {}", id);
        };
        let mut row = alert.clone();
        row.id = Some(id);
        *existing = row;
        Ok(())
    }

    async fn recent_volume_spikes(
        &self,
        symbol: &str,
        minutes_back: u64,
        now_ms: i64,
    ) -> Result<Vec<Alert>> {
        let cutoff_ms = now_ms - minutes_back as i64 * 60_000;
        Ok(self
            .store
            .read()
            .await
            .rows
            .values()
            .filter(|a| {
                a.symbol == symbol
                    && a.kind() == AlertKind::VolumeSpike
                    && a.alert_time_ms > cutoff_ms
            })
            .cloned()
            .collect())
    }

    async fn cleanup(&self, older_than_days: u64, now_ms: i64) -> Result<u64> {
        let cutoff_ms = now_ms - older_than_days as i64 * 86_400_000;
        let mut store = self.store.write().await;
        let before = store.rows.len();
        store.rows.retain(|_, a| a.alert_time_ms >= cutoff_ms);
        Ok((before - store.rows.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryWatchlistRepository {
    symbols: RwLock<BTreeSet<String>>,
}

impl InMemoryWatchlistRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn replace(&self, symbols: Vec<String>) {
        let mut guard = self.symbols.write().await;
        *guard = symbols.into_iter().collect();
    }
}

#[async_trait]
impl WatchlistRepository for InMemoryWatchlistRepository {
    async fn active_symbols(&self) -> Result<Vec<String>> {
        Ok(self.symbols.read().await.iter().cloned().collect())
    }

    async fn add(&self, symbol: &str) -> Result<()> {
        self.symbols.write().await.insert(symbol.to_string());
        Ok(())
    }

    async fn remove(&self, symbol: &str) -> Result<()> {
        self.symbols.write().await.remove(symbol);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(open_time_ms: i64, bullish: bool, closed: bool) -> Candle {
        let (open, close) = if bullish {
            (dec!(100), dec!(101))
        } else {
            (dec!(101), dec!(100))
        };
        Candle {
            symbol: "BTCUSDT".to_string(),
            open_time_ms,
            close_time_ms: open_time_ms + 60_000,
            open,
            high: dec!(102),
            low: dec!(99),
            close,
            volume: dec!(10),
            is_closed: closed,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let repo = InMemoryCandleRepository::new();
        let c = candle(60_000, true, true);
        repo.upsert(&c).await.unwrap();
        repo.upsert(&c).await.unwrap();
        assert_eq!(repo.count("BTCUSDT").await, 1);
    }

    #[tokio::test]
    async fn test_historical_volumes_exclude_open_candles() {
        let repo = InMemoryCandleRepository::new();
        let now_ms = 3_600_000i64;
        repo.upsert(&candle(60_000, true, true)).await.unwrap();
        repo.upsert(&candle(120_000, true, false)).await.unwrap();

        let volumes = repo
            .historical_quote_volumes("BTCUSDT", 1, 0, VolumeFilter::Bull, now_ms)
            .await
            .unwrap();
        assert_eq!(volumes.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_drops_expired_candles() {
        let repo = InMemoryCandleRepository::new();
        let now_ms = 10 * 3_600_000i64;
        repo.upsert(&candle(0, true, true)).await.unwrap();
        repo.upsert(&candle(now_ms - 60_000, true, true)).await.unwrap();

        let deleted = repo.cleanup("BTCUSDT", 2, now_ms).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.count("BTCUSDT").await, 1);
    }

    #[tokio::test]
    async fn test_alert_ids_are_monotone() {
        let repo = InMemoryAlertRepository::new();
        let alert = Alert {
            id: None,
            symbol: "BTCUSDT".to_string(),
            price: dec!(100),
            alert_time_ms: 1,
            close_time_ms: None,
            is_closed: false,
            has_imbalance: false,
            imbalance: None,
            candle: None,
            order_book: None,
            message: String::new(),
            payload: crate::domain::alerts::AlertPayload::ConsecutiveRun {
                consecutive_count: 5,
            },
        };
        let first = repo.save(&alert).await.unwrap();
        let second = repo.save(&alert).await.unwrap();
        assert!(second > first);
    }
}
