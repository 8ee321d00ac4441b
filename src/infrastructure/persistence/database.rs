use anyhow::{Context, Result};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// One writer path (the symbol workers funnel through the repositories) plus
/// a few readers for backfill and maintenance queries.
const POOL_MAX_CONNECTIONS: u32 = 5;

/// Database wrapper owning the SQLite pool and the schema.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        Self::prepare_parent_dir(db_url).await?;

        // WAL keeps candle upserts from blocking the window reads the
        // detectors issue on every tick.
        let options = SqliteConnectOptions::from_str(db_url)
            .context("Invalid DATABASE_URL")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database at {}", db_url))?;

        let db = Self { pool };
        db.init().await?;
        info!("Database ready: {}", db_url);

        Ok(db)
    }

    /// A first run against a fresh `sqlite://data/...` URL has no data
    /// directory yet; create it before the driver tries the file.
    async fn prepare_parent_dir(db_url: &str) -> Result<()> {
        let Some(file_path) = db_url.strip_prefix("sqlite://") else {
            return Ok(());
        };
        if let Some(parent) = Path::new(file_path).parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        // 1. Watchlist Table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watchlist (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT UNIQUE NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create watchlist table")?;

        // 2. Candles Table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                symbol TEXT NOT NULL,
                open_time_ms INTEGER NOT NULL,
                close_time_ms INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                volume_quote TEXT NOT NULL,
                is_bullish BOOLEAN NOT NULL,
                is_closed BOOLEAN NOT NULL DEFAULT 0,
                PRIMARY KEY (symbol, open_time_ms)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create candles table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_candles_symbol_time
            ON candles (symbol, open_time_ms DESC);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create candle time index")?;

        // Index for closed-window scans (volume baseline, integrity)
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_candles_symbol_closed
            ON candles (symbol, is_closed, open_time_ms DESC);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create candle closed index")?;

        // 3. Alerts Table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                kind TEXT NOT NULL,
                price TEXT NOT NULL,
                alert_time_ms INTEGER NOT NULL,
                close_time_ms INTEGER,
                volume_ratio REAL,
                consecutive_count INTEGER,
                current_volume_quote REAL,
                average_volume_quote REAL,
                is_closed BOOLEAN NOT NULL DEFAULT 0,
                is_true_signal BOOLEAN,
                has_imbalance BOOLEAN NOT NULL DEFAULT 0,
                imbalance_json TEXT,
                candle_json TEXT,
                order_book_json TEXT,
                message TEXT,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create alerts table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_alerts_symbol_kind_time
            ON alerts (symbol, kind, alert_time_ms DESC);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create alert index")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
