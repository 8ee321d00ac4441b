use crate::domain::market::{Candle, IntegrityReport, VolumeFilter};
use crate::domain::repositories::CandleRepository;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

pub struct SqliteCandleRepository {
    pool: SqlitePool,
}

impl SqliteCandleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn decimal_column(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Decimal> {
    let raw: String = row.try_get(column)?;
    Decimal::from_str(&raw).with_context(|| format!("Invalid decimal in column '{}'", column))
}

fn candle_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Candle> {
    Ok(Candle {
        symbol: row.try_get("symbol")?,
        open_time_ms: row.try_get("open_time_ms")?,
        close_time_ms: row.try_get("close_time_ms")?,
        open: decimal_column(row, "open")?,
        high: decimal_column(row, "high")?,
        low: decimal_column(row, "low")?,
        close: decimal_column(row, "close")?,
        volume: decimal_column(row, "volume")?,
        is_closed: row.try_get("is_closed")?,
    })
}

#[async_trait]
impl CandleRepository for SqliteCandleRepository {
    async fn upsert(&self, candle: &Candle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO candles (
                symbol, open_time_ms, close_time_ms, open, high, low, close,
                volume, volume_quote, is_bullish, is_closed
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (symbol, open_time_ms)
            DO UPDATE SET
                close_time_ms = excluded.close_time_ms,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume,
                volume_quote = excluded.volume_quote,
                is_bullish = excluded.is_bullish,
                is_closed = excluded.is_closed
            "#,
        )
        .bind(&candle.symbol)
        .bind(candle.open_time_ms)
        .bind(candle.close_time_ms)
        .bind(candle.open.to_string())
        .bind(candle.high.to_string())
        .bind(candle.low.to_string())
        .bind(candle.close.to_string())
        .bind(candle.volume.to_string())
        .bind(candle.volume_quote().to_string())
        .bind(candle.is_bullish())
        .bind(candle.is_closed)
        .execute(&self.pool)
        .await
        .context("Failed to upsert candle")?;

        Ok(())
    }

    async fn recent_closed(&self, symbol: &str, count: usize) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM candles
            WHERE symbol = ? AND is_closed = 1
            ORDER BY open_time_ms DESC
            LIMIT ?
            "#,
        )
        .bind(symbol)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query recent closed candles")?;

        // Newest-first from the index, returned oldest-first.
        let mut candles = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            candles.push(candle_from_row(row)?);
        }
        Ok(candles)
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

        let direction_condition = match filter {
            VolumeFilter::Bull => "AND is_bullish = 1",
            VolumeFilter::Bear => "AND is_bullish = 0",
            VolumeFilter::All => "",
        };

        let query = format!(
            r#"
            SELECT volume_quote FROM candles
            WHERE symbol = ?
            AND open_time_ms >= ?
            AND open_time_ms < ?
            AND is_closed = 1
            {}
            ORDER BY open_time_ms
            "#,
            direction_condition
        );

        let rows = sqlx::query(&query)
            .bind(symbol)
            .bind(start_ms)
            .bind(end_ms)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query historical quote volumes")?;

        let mut volumes = Vec::with_capacity(rows.len());
        for row in &rows {
            let raw: String = row.try_get("volume_quote")?;
            let value: f64 = raw
                .parse()
                .with_context(|| format!("Invalid quote volume '{}'", raw))?;
            volumes.push(value);
        }
        Ok(volumes)
    }

    async fn cleanup(&self, symbol: &str, retention_hours: u64, now_ms: i64) -> Result<u64> {
        let cutoff_ms = now_ms - retention_hours as i64 * 3_600_000;
        let result = sqlx::query("DELETE FROM candles WHERE symbol = ? AND open_time_ms < ?")
            .bind(symbol)
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await
            .context("Failed to delete expired candles")?;
        Ok(result.rows_affected())
    }

    async fn integrity(&self, symbol: &str, hours: u64, now_ms: i64) -> Result<IntegrityReport> {
        let expected = hours * 60;
        let start_ms = now_ms - hours as i64 * 3_600_000;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS existing FROM candles
            WHERE symbol = ? AND open_time_ms >= ? AND is_closed = 1
            "#,
        )
        .bind(symbol)
        .bind(start_ms)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count stored candles")?;

        let existing: i64 = row.try_get("existing")?;
        Ok(IntegrityReport::new(expected, existing.max(0) as u64))
    }
}
