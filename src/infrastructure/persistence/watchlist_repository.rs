use crate::domain::repositories::WatchlistRepository;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

pub struct SqliteWatchlistRepository {
    pool: SqlitePool,
}

impl SqliteWatchlistRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Activate a set of symbols without touching existing entries. Used to
    /// seed the watchlist from configuration on first start.
    pub async fn seed(&self, symbols: &[String]) -> Result<()> {
        for symbol in symbols {
            self.add(symbol).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl WatchlistRepository for SqliteWatchlistRepository {
    async fn active_symbols(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT symbol FROM watchlist WHERE is_active = 1 ORDER BY symbol")
            .fetch_all(&self.pool)
            .await
            .context("Failed to query watchlist")?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("symbol").map_err(Into::into))
            .collect()
    }

    async fn add(&self, symbol: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watchlist (symbol, is_active) VALUES (?, 1)
            ON CONFLICT (symbol) DO UPDATE SET is_active = 1
            "#,
        )
        .bind(symbol)
        .execute(&self.pool)
        .await
        .context("Failed to add watchlist symbol")?;
        Ok(())
    }

    async fn remove(&self, symbol: &str) -> Result<()> {
        // Deactivate rather than delete so the entry's history survives.
        sqlx::query("UPDATE watchlist SET is_active = 0 WHERE symbol = ?")
            .bind(symbol)
            .execute(&self.pool)
            .await
            .context("Failed to remove watchlist symbol")?;
        Ok(())
    }
}
