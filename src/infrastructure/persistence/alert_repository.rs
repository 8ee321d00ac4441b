use crate::domain::alerts::{
    Alert, AlertKind, AlertPayload, CandleSnapshot, Imbalance, OrderBookSnapshot,
};
use crate::domain::repositories::AlertRepository;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

pub struct SqliteAlertRepository {
    pool: SqlitePool,
}

impl SqliteAlertRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Kind-specific columns flattened out of the payload for binding.
struct PayloadColumns {
    volume_ratio: Option<f64>,
    consecutive_count: Option<i64>,
    current_volume_quote: Option<f64>,
    average_volume_quote: Option<f64>,
    is_true_signal: Option<bool>,
}

fn payload_columns(payload: &AlertPayload) -> PayloadColumns {
    match payload {
        AlertPayload::VolumeSpike {
            volume_ratio,
            current_volume_quote,
            average_volume_quote,
            is_true_signal,
        } => PayloadColumns {
            volume_ratio: Some(*volume_ratio),
            consecutive_count: None,
            current_volume_quote: Some(*current_volume_quote),
            average_volume_quote: Some(*average_volume_quote),
            is_true_signal: *is_true_signal,
        },
        AlertPayload::ConsecutiveRun { consecutive_count } => PayloadColumns {
            volume_ratio: None,
            consecutive_count: Some(*consecutive_count as i64),
            current_volume_quote: None,
            average_volume_quote: None,
            is_true_signal: None,
        },
        AlertPayload::Priority {
            consecutive_count,
            volume_ratio,
            current_volume_quote,
            average_volume_quote,
        } => PayloadColumns {
            volume_ratio: *volume_ratio,
            consecutive_count: Some(*consecutive_count as i64),
            current_volume_quote: *current_volume_quote,
            average_volume_quote: *average_volume_quote,
            is_true_signal: None,
        },
    }
}

fn blob<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).context("Failed to serialize alert substructure"))
        .transpose()
}

fn parse_blob<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Result<Option<T>> {
    raw.map(|s| serde_json::from_str(&s).context("Failed to parse alert substructure"))
        .transpose()
}

fn payload_from_row(kind: AlertKind, row: &sqlx::sqlite::SqliteRow) -> Result<AlertPayload> {
    Ok(match kind {
        AlertKind::VolumeSpike => AlertPayload::VolumeSpike {
            volume_ratio: row.try_get::<Option<f64>, _>("volume_ratio")?.unwrap_or(0.0),
            current_volume_quote: row
                .try_get::<Option<f64>, _>("current_volume_quote")?
                .unwrap_or(0.0),
            average_volume_quote: row
                .try_get::<Option<f64>, _>("average_volume_quote")?
                .unwrap_or(0.0),
            is_true_signal: row.try_get("is_true_signal")?,
        },
        AlertKind::ConsecutiveLong => AlertPayload::ConsecutiveRun {
            consecutive_count: row
                .try_get::<Option<i64>, _>("consecutive_count")?
                .unwrap_or(0) as u32,
        },
        AlertKind::Priority => AlertPayload::Priority {
            consecutive_count: row
                .try_get::<Option<i64>, _>("consecutive_count")?
                .unwrap_or(0) as u32,
            volume_ratio: row.try_get("volume_ratio")?,
            current_volume_quote: row.try_get("current_volume_quote")?,
            average_volume_quote: row.try_get("average_volume_quote")?,
        },
    })
}

fn alert_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Alert> {
    let kind_raw: String = row.try_get("kind")?;
    let kind =
        AlertKind::parse(&kind_raw).ok_or_else(|| anyhow!("Unknown alert kind '{}'", kind_raw))?;

    let price_raw: String = row.try_get("price")?;
    let price = Decimal::from_str(&price_raw).context("Invalid alert price")?;

    let imbalance: Option<Imbalance> = parse_blob(row.try_get("imbalance_json")?)?;
    let candle: Option<CandleSnapshot> = parse_blob(row.try_get("candle_json")?)?;
    let order_book: Option<OrderBookSnapshot> = parse_blob(row.try_get("order_book_json")?)?;

    Ok(Alert {
        id: Some(row.try_get("id")?),
        symbol: row.try_get("symbol")?,
        price,
        alert_time_ms: row.try_get("alert_time_ms")?,
        close_time_ms: row.try_get("close_time_ms")?,
        is_closed: row.try_get("is_closed")?,
        has_imbalance: row.try_get("has_imbalance")?,
        imbalance,
        candle,
        order_book,
        message: row
            .try_get::<Option<String>, _>("message")?
            .unwrap_or_default(),
        payload: payload_from_row(kind, row)?,
    })
}

#[async_trait]
impl AlertRepository for SqliteAlertRepository {
    async fn save(&self, alert: &Alert) -> Result<i64> {
        let columns = payload_columns(&alert.payload);
        let result = sqlx::query(
            r#"
            INSERT INTO alerts (
                symbol, kind, price, alert_time_ms, close_time_ms,
                volume_ratio, consecutive_count, current_volume_quote,
                average_volume_quote, is_closed, is_true_signal, has_imbalance,
                imbalance_json, candle_json, order_book_json, message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&alert.symbol)
        .bind(alert.kind().to_string())
        .bind(alert.price.to_string())
        .bind(alert.alert_time_ms)
        .bind(alert.close_time_ms)
        .bind(columns.volume_ratio)
        .bind(columns.consecutive_count)
        .bind(columns.current_volume_quote)
        .bind(columns.average_volume_quote)
        .bind(alert.is_closed)
        .bind(columns.is_true_signal)
        .bind(alert.has_imbalance)
        .bind(blob(&alert.imbalance)?)
        .bind(blob(&alert.candle)?)
        .bind(blob(&alert.order_book)?)
        .bind(&alert.message)
        .execute(&self.pool)
        .await
        .context("Failed to insert alert")?;

        Ok(result.last_insert_rowid())
    }

    async fn update(&self, id: i64, alert: &Alert) -> Result<()> {
        let columns = payload_columns(&alert.payload);
        sqlx::query(
            r#"
            UPDATE alerts SET
                symbol = ?, kind = ?, price = ?, alert_time_ms = ?,
                close_time_ms = ?, volume_ratio = ?, consecutive_count = ?,
                current_volume_quote = ?, average_volume_quote = ?,
                is_closed = ?, is_true_signal = ?, has_imbalance = ?,
                imbalance_json = ?, candle_json = ?, order_book_json = ?,
                message = ?
            WHERE id = ?
            "#,
        )
        .bind(&alert.symbol)
        .bind(alert.kind().to_string())
        .bind(alert.price.to_string())
        .bind(alert.alert_time_ms)
        .bind(alert.close_time_ms)
        .bind(columns.volume_ratio)
        .bind(columns.consecutive_count)
        .bind(columns.current_volume_quote)
        .bind(columns.average_volume_quote)
        .bind(alert.is_closed)
        .bind(columns.is_true_signal)
        .bind(alert.has_imbalance)
        .bind(blob(&alert.imbalance)?)
        .bind(blob(&alert.candle)?)
        .bind(blob(&alert.order_book)?)
        .bind(&alert.message)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update alert")?;

        Ok(())
    }

    async fn recent_volume_spikes(
        &self,
        symbol: &str,
        minutes_back: u64,
        now_ms: i64,
    ) -> Result<Vec<Alert>> {
        let cutoff_ms = now_ms - minutes_back as i64 * 60_000;
        let rows = sqlx::query(
            r#"
            SELECT * FROM alerts
            WHERE symbol = ? AND kind = ? AND alert_time_ms > ?
            ORDER BY alert_time_ms DESC
            "#,
        )
        .bind(symbol)
        .bind(AlertKind::VolumeSpike.to_string())
        .bind(cutoff_ms)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query recent volume spikes")?;

        rows.iter().map(alert_from_row).collect()
    }

    async fn cleanup(&self, older_than_days: u64, now_ms: i64) -> Result<u64> {
        let cutoff_ms = now_ms - older_than_days as i64 * 86_400_000;
        let result = sqlx::query("DELETE FROM alerts WHERE alert_time_ms < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await
            .context("Failed to delete expired alerts")?;
        Ok(result.rows_affected())
    }
}
