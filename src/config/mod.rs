//! Configuration for the scanner.
//!
//! Static wiring (endpoints, database, shard count) is loaded once from
//! environment variables. Detection parameters live in a
//! [`DetectionSettings`] snapshot published behind a [`SettingsHandle`]:
//! handlers read one immutable snapshot per call, and a settings update
//! swaps in a new snapshot without touching in-flight work.

use crate::domain::market::VolumeFilter;
use anyhow::{Context, Result, bail};
use std::env;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

/// Parse an env var, falling back to `default` when unset. A present but
/// unparsable value is a hard error so misconfiguration fails at startup.
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid value for {}: '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("Invalid value for {}: '{}'", key, other),
        },
        Err(_) => Ok(default),
    }
}

/// Hot-reloadable detection parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    pub analysis_hours: u64,
    pub offset_minutes: u64,
    pub volume_multiplier: f64,
    pub min_volume_quote: f64,
    pub consecutive_long_count: u32,
    pub alert_grouping_minutes: u64,
    pub data_retention_hours: u64,
    pub update_interval_seconds: u64,
    pub volume_filter: VolumeFilter,
    pub imbalance_enabled: bool,
    pub fvg_enabled: bool,
    pub order_block_enabled: bool,
    pub breaker_block_enabled: bool,
    pub orderbook_snapshot_on_alert: bool,
    pub volume_alerts_enabled: bool,
    pub consecutive_alerts_enabled: bool,
    pub priority_alerts_enabled: bool,
    pub min_gap_pct: f64,
    pub order_block_move_pct: f64,
    pub breaker_block_move_pct: f64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            analysis_hours: 1,
            offset_minutes: 0,
            volume_multiplier: 2.0,
            min_volume_quote: 1000.0,
            consecutive_long_count: 5,
            alert_grouping_minutes: 5,
            data_retention_hours: 2,
            update_interval_seconds: 1,
            volume_filter: VolumeFilter::Bull,
            imbalance_enabled: true,
            fvg_enabled: true,
            order_block_enabled: true,
            breaker_block_enabled: true,
            orderbook_snapshot_on_alert: false,
            volume_alerts_enabled: true,
            consecutive_alerts_enabled: true,
            priority_alerts_enabled: true,
            min_gap_pct: 0.1,
            order_block_move_pct: 2.0,
            breaker_block_move_pct: 1.0,
        }
    }
}

impl DetectionSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let settings = Self {
            analysis_hours: env_parse("ANALYSIS_HOURS", defaults.analysis_hours)?,
            offset_minutes: env_parse("OFFSET_MINUTES", defaults.offset_minutes)?,
            volume_multiplier: env_parse("VOLUME_MULTIPLIER", defaults.volume_multiplier)?,
            min_volume_quote: env_parse("MIN_VOLUME_QUOTE", defaults.min_volume_quote)?,
            consecutive_long_count: env_parse(
                "CONSECUTIVE_LONG_COUNT",
                defaults.consecutive_long_count,
            )?,
            alert_grouping_minutes: env_parse(
                "ALERT_GROUPING_MINUTES",
                defaults.alert_grouping_minutes,
            )?,
            data_retention_hours: env_parse("DATA_RETENTION_HOURS", defaults.data_retention_hours)?,
            update_interval_seconds: env_parse(
                "UPDATE_INTERVAL_SECONDS",
                defaults.update_interval_seconds,
            )?,
            volume_filter: match env::var("VOLUME_TYPE") {
                Ok(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid value for VOLUME_TYPE: '{}'", raw))?,
                Err(_) => defaults.volume_filter,
            },
            imbalance_enabled: env_bool("IMBALANCE_ENABLED", defaults.imbalance_enabled)?,
            fvg_enabled: env_bool("FVG_ENABLED", defaults.fvg_enabled)?,
            order_block_enabled: env_bool("ORDER_BLOCK_ENABLED", defaults.order_block_enabled)?,
            breaker_block_enabled: env_bool(
                "BREAKER_BLOCK_ENABLED",
                defaults.breaker_block_enabled,
            )?,
            orderbook_snapshot_on_alert: env_bool(
                "ORDERBOOK_SNAPSHOT_ON_ALERT",
                defaults.orderbook_snapshot_on_alert,
            )?,
            volume_alerts_enabled: env_bool(
                "VOLUME_ALERTS_ENABLED",
                defaults.volume_alerts_enabled,
            )?,
            consecutive_alerts_enabled: env_bool(
                "CONSECUTIVE_ALERTS_ENABLED",
                defaults.consecutive_alerts_enabled,
            )?,
            priority_alerts_enabled: env_bool(
                "PRIORITY_ALERTS_ENABLED",
                defaults.priority_alerts_enabled,
            )?,
            min_gap_pct: env_parse("MIN_GAP_PCT", defaults.min_gap_pct)?,
            order_block_move_pct: env_parse(
                "ORDER_BLOCK_MOVE_PCT",
                defaults.order_block_move_pct,
            )?,
            breaker_block_move_pct: env_parse(
                "BREAKER_BLOCK_MOVE_PCT",
                defaults.breaker_block_move_pct,
            )?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.volume_multiplier <= 0.0 {
            bail!(
                "VOLUME_MULTIPLIER must be positive, got {}",
                self.volume_multiplier
            );
        }
        if self.min_volume_quote < 0.0 {
            bail!(
                "MIN_VOLUME_QUOTE must not be negative, got {}",
                self.min_volume_quote
            );
        }
        if self.consecutive_long_count == 0 {
            bail!("CONSECUTIVE_LONG_COUNT must be at least 1");
        }
        if self.analysis_hours == 0 {
            bail!("ANALYSIS_HOURS must be at least 1");
        }
        if self.data_retention_hours == 0 {
            bail!("DATA_RETENTION_HOURS must be at least 1");
        }
        if self.min_gap_pct <= 0.0 || self.order_block_move_pct <= 0.0
            || self.breaker_block_move_pct <= 0.0
        {
            bail!("Imbalance thresholds must be positive");
        }
        Ok(())
    }

    /// Hours of closed candles the store must hold: retention plus the
    /// analysis window plus one hour of slack.
    pub fn total_history_hours(&self) -> u64 {
        self.data_retention_hours + self.analysis_hours + 1
    }
}

/// Shared handle publishing immutable [`DetectionSettings`] snapshots.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Arc<DetectionSettings>>>,
}

impl SettingsHandle {
    pub fn new(settings: DetectionSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    /// The current snapshot. Handlers call this once per invocation and keep
    /// using the same snapshot for the whole call.
    pub fn snapshot(&self) -> Arc<DetectionSettings> {
        self.inner
            .read()
            .expect("settings lock poisoned")
            .clone()
    }

    /// Validate and publish a new snapshot. In-flight handlers keep their
    /// old snapshot; subsequent calls observe the new one.
    pub fn publish(&self, settings: DetectionSettings) -> Result<()> {
        settings.validate()?;
        let mut guard = self.inner.write().expect("settings lock poisoned");
        *guard = Arc::new(settings);
        Ok(())
    }
}

/// Static application wiring, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bybit_ws_url: String,
    pub bybit_rest_url: String,
    /// Initial watchlist seed; the watchlist table is the runtime source of
    /// truth for subscriptions.
    pub symbols: Vec<String>,
    pub worker_shards: usize,
    pub time_servers: Vec<String>,
    pub alert_retention_days: u64,
    pub detection: DetectionSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://data/tokenscan.db".to_string());
        let bybit_ws_url = env::var("BYBIT_WS_URL")
            .unwrap_or_else(|_| "wss://stream.bybit.com/v5/public/linear".to_string());
        url::Url::parse(&bybit_ws_url).context("Invalid BYBIT_WS_URL")?;
        let bybit_rest_url =
            env::var("BYBIT_REST_URL").unwrap_or_else(|_| "https://api.bybit.com".to_string());
        url::Url::parse(&bybit_rest_url).context("Invalid BYBIT_REST_URL")?;

        let symbols = env::var("SYMBOLS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let worker_shards = env_parse("WORKER_SHARDS", 8usize)?;
        if worker_shards == 0 {
            bail!("WORKER_SHARDS must be at least 1");
        }

        let time_servers = env::var("TIME_SERVERS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|_| {
                vec![
                    "http://worldtimeapi.org/api/timezone/UTC".to_string(),
                    "https://timeapi.io/api/Time/current/zone?timeZone=UTC".to_string(),
                    "http://worldclockapi.com/api/json/utc/now".to_string(),
                ]
            });

        let alert_retention_days = env_parse("ALERT_RETENTION_DAYS", 7u64)?;
        let detection = DetectionSettings::from_env()?;

        Ok(Self {
            database_url,
            bybit_ws_url,
            bybit_rest_url,
            symbols,
            worker_shards,
            time_servers,
            alert_retention_days,
            detection,
        })
    }
}
