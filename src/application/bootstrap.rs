//! Service container: constructs every component at startup and owns the
//! lifecycle. All handles are explicit; nothing lives in module-level state.

use crate::application::backfill::BackfillService;
use crate::application::events::EventBus;
use crate::application::processor::{RangeMaintainer, SymbolProcessor};
use crate::application::scanner::ScannerService;
use crate::config::{Config, SettingsHandle};
use crate::domain::ports::{AlertSink, Clock, OrderBookProvider};
use crate::domain::repositories::{AlertRepository, CandleRepository, WatchlistRepository};
use crate::infrastructure::bybit::{BybitMarketData, BybitWebSocketClient};
use crate::infrastructure::persistence::{
    Database, SqliteAlertRepository, SqliteCandleRepository, SqliteWatchlistRepository,
};
use crate::infrastructure::timesync::TimeOracle;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const ALERT_CLEANUP_INTERVAL_SECS: u64 = 3600;

pub struct Application {
    config: Config,
    settings: SettingsHandle,
    database: Database,
    candles: Arc<dyn CandleRepository>,
    alerts: Arc<dyn AlertRepository>,
    watchlist: Arc<dyn WatchlistRepository>,
    oracle: Arc<TimeOracle>,
    market_data: Arc<BybitMarketData>,
    bus: EventBus,
}

impl Application {
    pub async fn build(config: Config) -> Result<Self> {
        config.detection.validate()?;
        let settings = SettingsHandle::new(config.detection.clone());

        let database = Database::new(&config.database_url).await?;

        let watchlist_repo = SqliteWatchlistRepository::new(database.pool.clone());
        watchlist_repo
            .seed(&config.symbols)
            .await
            .context("Failed to seed watchlist")?;

        let candles: Arc<dyn CandleRepository> =
            Arc::new(SqliteCandleRepository::new(database.pool.clone()));
        let alerts: Arc<dyn AlertRepository> =
            Arc::new(SqliteAlertRepository::new(database.pool.clone()));
        let watchlist: Arc<dyn WatchlistRepository> = Arc::new(watchlist_repo);

        let oracle = Arc::new(TimeOracle::new(
            config.time_servers.clone(),
            &config.bybit_rest_url,
        ));
        let market_data = Arc::new(BybitMarketData::new(config.bybit_rest_url.clone()));
        let bus = EventBus::new();

        Ok(Self {
            config,
            settings,
            database,
            candles,
            alerts,
            watchlist,
            oracle,
            market_data,
            bus,
        })
    }

    pub fn event_bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn settings(&self) -> SettingsHandle {
        self.settings.clone()
    }

    /// Start every task and hand back the running system.
    pub async fn start(self) -> Result<RunningApplication> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Time sync first so candle-close decisions are correct from the
        // first processed update.
        let oracle_task = self.oracle.start();

        let backfill = Arc::new(BackfillService::new(
            self.candles.clone(),
            self.market_data.clone(),
            self.oracle.clone() as Arc<dyn Clock>,
            self.settings.clone(),
        ));

        let symbols = self
            .watchlist
            .active_symbols()
            .await
            .context("Failed to load watchlist")?;
        info!(pairs = symbols.len(), "Starting scanner");
        backfill.run_startup(&symbols).await;

        let processor = Arc::new(SymbolProcessor::new(
            self.candles.clone(),
            self.alerts.clone(),
            Arc::new(self.bus.clone()) as Arc<dyn AlertSink>,
            self.oracle.clone() as Arc<dyn Clock>,
            Some(self.market_data.clone() as Arc<dyn OrderBookProvider>),
            Some(backfill.clone() as Arc<dyn RangeMaintainer>),
            self.settings.clone(),
        ));
        let scanner = Arc::new(ScannerService::spawn(
            processor,
            self.config.worker_shards,
        ));

        let ws_client = Arc::new(BybitWebSocketClient::new(
            self.config.bybit_ws_url.clone(),
            self.watchlist.clone(),
            scanner.clone(),
            backfill,
            self.bus.clone(),
            shutdown_rx.clone(),
        ));
        let ws_task = tokio::spawn(ws_client.run());

        let maintenance_task = tokio::spawn(Self::run_alert_cleanup(
            self.alerts.clone(),
            self.oracle.clone(),
            self.config.alert_retention_days,
            shutdown_rx,
        ));

        Ok(RunningApplication {
            database: self.database,
            bus: self.bus,
            settings: self.settings,
            scanner,
            shutdown_tx,
            oracle_task,
            ws_task,
            maintenance_task,
        })
    }

    async fn run_alert_cleanup(
        alerts: Arc<dyn AlertRepository>,
        clock: Arc<TimeOracle>,
        retention_days: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tokio::time::Duration::from_secs(
                    ALERT_CLEANUP_INTERVAL_SECS,
                )) => {}
                _ = shutdown.changed() => return,
            }
            match alerts.cleanup(retention_days, clock.now_utc_ms()).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Dropped expired alerts"),
                Err(e) => warn!("Alert cleanup failed: {:#}", e),
            }
        }
    }
}

pub struct RunningApplication {
    database: Database,
    pub bus: EventBus,
    pub settings: SettingsHandle,
    scanner: Arc<ScannerService>,
    shutdown_tx: watch::Sender<bool>,
    oracle_task: JoinHandle<()>,
    ws_task: JoinHandle<()>,
    maintenance_task: JoinHandle<()>,
}

impl RunningApplication {
    /// Orderly shutdown: stop ingestion and the reconciler, drain in-flight
    /// symbol handlers, then close the store.
    pub async fn shutdown(self) {
        info!("Shutting down");
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.ws_task.await {
            warn!("WebSocket supervisor ended abnormally: {}", e);
        }
        self.maintenance_task.abort();
        self.oracle_task.abort();

        self.scanner.shutdown().await;
        self.database.close().await;
        info!("Shutdown complete");
    }
}
