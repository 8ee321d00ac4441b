//! Per-symbol processing pipeline.
//!
//! One [`SymbolProcessor`] is shared by all workers; the mutable state lives
//! in a [`SymbolState`] owned by exactly one worker, so every symbol is
//! handled by a single writer. The processor persists the candle, updates
//! the rolling window and drives the detectors, translating their pure
//! decisions into repository writes and sink events.
//!
//! No error escapes a handler call: store and sink failures are logged and
//! the update is dropped, so one symbol's failure never affects another.

use crate::application::candle_cache::{CandleWindow, WINDOW_CAPACITY};
use crate::application::detectors::consecutive::{RunAction, RunTracker};
use crate::application::detectors::imbalance::ImbalanceDetector;
use crate::application::detectors::priority;
use crate::application::detectors::volume::{self, VolumeAction, VolumeAlertBook, VolumeSignal};
use crate::config::{DetectionSettings, SettingsHandle};
use crate::domain::alerts::{Alert, Imbalance, OrderBookSnapshot, ScanEvent};
use crate::domain::market::Candle;
use crate::domain::ports::{AlertSink, Clock, OrderBookProvider};
use crate::domain::repositories::{AlertRepository, CandleRepository};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Mutable state for one symbol, owned by its worker.
#[derive(Default)]
pub struct SymbolState {
    window: CandleWindow,
    volume_book: VolumeAlertBook,
    run_tracker: RunTracker,
    /// Open time of the last closed candle that went through the detectors.
    last_processed_ms: i64,
    /// Throttle mark for in-progress evaluations.
    last_evaluation_ms: i64,
    warmed_up: bool,
}

impl SymbolState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Hook invoked after closed-candle processing to keep the stored window
/// healthy. Implemented by the backfill service.
#[async_trait::async_trait]
pub trait RangeMaintainer: Send + Sync {
    async fn maintain_range(&self, symbol: &str) -> anyhow::Result<()>;
}

pub struct SymbolProcessor {
    candles: Arc<dyn CandleRepository>,
    alerts: Arc<dyn AlertRepository>,
    sink: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    order_books: Option<Arc<dyn OrderBookProvider>>,
    maintainer: Option<Arc<dyn RangeMaintainer>>,
    settings: SettingsHandle,
}

impl SymbolProcessor {
    pub fn new(
        candles: Arc<dyn CandleRepository>,
        alerts: Arc<dyn AlertRepository>,
        sink: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        order_books: Option<Arc<dyn OrderBookProvider>>,
        maintainer: Option<Arc<dyn RangeMaintainer>>,
        settings: SettingsHandle,
    ) -> Self {
        Self {
            candles,
            alerts,
            sink,
            clock,
            order_books,
            maintainer,
            settings,
        }
    }

    /// Entry point for every kline update of one symbol.
    pub async fn handle_update(&self, state: &mut SymbolState, mut candle: Candle) {
        let settings = self.settings.snapshot();
        let now_ms = self.clock.now_utc_ms();

        if !state.warmed_up {
            self.warm_up(state, &candle.symbol).await;
        }

        let closed = candle.is_closed || self.clock.is_candle_closed(candle.close_time_ms);
        if closed {
            candle.open_time_ms = Candle::align_to_minute(candle.open_time_ms);
            candle.close_time_ms = Candle::close_time_for(candle.open_time_ms);
            candle.is_closed = true;
        }

        // Persistence failures drop the update; the next tick re-upserts.
        if let Err(e) = self.candles.upsert(&candle).await {
            warn!(symbol = %candle.symbol, "Failed to upsert candle: {:#}", e);
        }
        state.window.update(candle.clone());

        if closed {
            if candle.open_time_ms > state.last_processed_ms {
                self.process_close(state, &candle, &settings, now_ms).await;
                state.last_processed_ms = candle.open_time_ms;

                if let Some(maintainer) = &self.maintainer {
                    if let Err(e) = maintainer.maintain_range(&candle.symbol).await {
                        warn!(symbol = %candle.symbol, "Range maintenance failed: {:#}", e);
                    }
                }
            }
        } else {
            self.process_in_progress(state, &candle, &settings, now_ms)
                .await;
        }

        state
            .volume_book
            .sweep_stale(now_ms, settings.alert_grouping_minutes);
    }

    /// Seed the rolling window from the store so pattern detection has
    /// context right after startup.
    async fn warm_up(&self, state: &mut SymbolState, symbol: &str) {
        state.warmed_up = true;
        match self.candles.recent_closed(symbol, WINDOW_CAPACITY).await {
            Ok(history) if !history.is_empty() => {
                debug!(symbol, candles = history.len(), "Warmed candle window");
                state.window.warm_up(history);
            }
            Ok(_) => {}
            Err(e) => warn!(symbol, "Window warm-up failed: {:#}", e),
        }
    }

    async fn process_in_progress(
        &self,
        state: &mut SymbolState,
        candle: &Candle,
        settings: &DetectionSettings,
        now_ms: i64,
    ) {
        if !settings.volume_alerts_enabled {
            return;
        }

        let throttle_ms = settings.update_interval_seconds as i64 * 1000;
        if now_ms - state.last_evaluation_ms < throttle_ms {
            return;
        }
        state.last_evaluation_ms = now_ms;

        let Some(signal) = self.evaluate_volume(candle, settings).await else {
            return;
        };

        let imbalance = self.detect_imbalance(state, settings);
        let order_book = self.fetch_order_book(&candle.symbol, settings).await;

        if let Some(action) =
            state
                .volume_book
                .on_in_progress(candle, signal, imbalance, order_book, now_ms)
        {
            self.apply_volume_action(state, action).await;
        }
    }

    async fn process_close(
        &self,
        state: &mut SymbolState,
        candle: &Candle,
        settings: &DetectionSettings,
        now_ms: i64,
    ) {
        let mut batch: Vec<Alert> = Vec::new();
        let imbalance = self.detect_imbalance(state, settings);

        // Phase B of the volume lifecycle.
        if settings.volume_alerts_enabled {
            let signal = self.evaluate_volume(candle, settings).await;
            let order_book = self.fetch_order_book(&candle.symbol, settings).await;
            if let Some(action) = state.volume_book.on_close(
                candle,
                signal,
                imbalance.clone(),
                order_book,
                now_ms,
            ) {
                if let Some(alert) = self.apply_volume_action(state, action).await {
                    batch.push(alert);
                }
            }
        }

        // Consecutive-run tracking.
        if settings.consecutive_alerts_enabled {
            let action = state.run_tracker.on_closed_candle(
                candle,
                settings.consecutive_long_count,
                imbalance.clone(),
            );
            match action {
                Some(RunAction::Create(alert)) => {
                    let alert = self.persist_new(alert).await;
                    if let Some(id) = alert.id {
                        state.run_tracker.assign_alert_id(id);
                    }
                    batch.push(alert);
                }
                Some(RunAction::Update(alert)) => {
                    let alert = self.persist_rewrite(alert).await;
                    batch.push(alert);
                }
                Some(RunAction::Finalize(alert)) => {
                    // A broken run is published but does not join the batch,
                    // so it cannot seed a priority signal.
                    self.persist_rewrite(alert).await;
                }
                None => {}
            }
        }

        // Priority correlation over the batch.
        if settings.priority_alerts_enabled
            && let Some(consecutive) = priority::consecutive_in(&batch)
        {
            let run_minutes = consecutive.consecutive_count().unwrap_or(0) as u64;
            let has_batch_volume = batch.iter().any(|a| a.volume_ratio().is_some());
            let has_recent = if has_batch_volume {
                false
            } else {
                self.had_recent_volume_spike(&candle.symbol, run_minutes, now_ms)
                    .await
            };

            if let Some(alert) = priority::correlate(&batch, has_recent) {
                self.persist_new(alert).await;
            }
        }
    }

    async fn evaluate_volume(
        &self,
        candle: &Candle,
        settings: &DetectionSettings,
    ) -> Option<VolumeSignal> {
        // The baseline window ends at the candle's open, so the evaluated
        // candle never feeds its own average.
        let baseline_end_ms = candle.open_time_ms + settings.offset_minutes as i64 * 60_000;
        let history = match self
            .candles
            .historical_quote_volumes(
                &candle.symbol,
                settings.analysis_hours,
                settings.offset_minutes,
                settings.volume_filter,
                baseline_end_ms,
            )
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(symbol = %candle.symbol, "Historical volume query failed: {:#}", e);
                return None;
            }
        };
        volume::evaluate(candle, &history, settings)
    }

    fn detect_imbalance(
        &self,
        state: &SymbolState,
        settings: &DetectionSettings,
    ) -> Option<Imbalance> {
        if !settings.imbalance_enabled {
            return None;
        }
        ImbalanceDetector::from_settings(settings).detect(state.window.slice())
    }

    async fn fetch_order_book(
        &self,
        symbol: &str,
        settings: &DetectionSettings,
    ) -> Option<OrderBookSnapshot> {
        if !settings.orderbook_snapshot_on_alert {
            return None;
        }
        let provider = self.order_books.as_ref()?;
        match provider.order_book_snapshot(symbol).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                debug!(symbol, "Order-book snapshot failed: {:#}", e);
                None
            }
        }
    }

    async fn had_recent_volume_spike(
        &self,
        symbol: &str,
        minutes_back: u64,
        now_ms: i64,
    ) -> bool {
        if minutes_back == 0 {
            return false;
        }
        match self
            .alerts
            .recent_volume_spikes(symbol, minutes_back, now_ms)
            .await
        {
            Ok(alerts) => !alerts.is_empty(),
            Err(e) => {
                warn!(symbol, "Recent volume-spike query failed: {:#}", e);
                false
            }
        }
    }

    async fn apply_volume_action(
        &self,
        state: &mut SymbolState,
        action: VolumeAction,
    ) -> Option<Alert> {
        match action {
            VolumeAction::Create(alert) => {
                let alert = self.persist_new(alert).await;
                if let Some(id) = alert.id {
                    state.volume_book.assign_entry_id(id);
                }
                Some(alert)
            }
            VolumeAction::CreateFinalized(alert) => Some(self.persist_new(alert).await),
            VolumeAction::Update(alert) | VolumeAction::Finalize(alert) => {
                Some(self.persist_rewrite(alert).await)
            }
        }
    }

    /// Save a fresh alert. On persistence failure the alert is still
    /// surfaced to the sinks without an id, marking it ephemeral.
    async fn persist_new(&self, mut alert: Alert) -> Alert {
        match self.alerts.save(&alert).await {
            Ok(id) => alert.id = Some(id),
            Err(e) => {
                error!(symbol = %alert.symbol, kind = %alert.kind(), "Failed to persist alert: {:#}", e);
            }
        }
        self.deliver(ScanEvent::NewAlert {
            alert: alert.clone(),
        })
        .await;
        alert
    }

    /// Rewrite an existing row in place. An alert that never got an id (its
    /// insert failed earlier) is saved as new instead, so the store ends up
    /// with exactly one row.
    async fn persist_rewrite(&self, mut alert: Alert) -> Alert {
        match alert.id {
            Some(id) => {
                if let Err(e) = self.alerts.update(id, &alert).await {
                    error!(symbol = %alert.symbol, id, "Failed to update alert: {:#}", e);
                }
                self.deliver(ScanEvent::AlertUpdated {
                    alert: alert.clone(),
                })
                .await;
            }
            None => match self.alerts.save(&alert).await {
                Ok(id) => {
                    alert.id = Some(id);
                    self.deliver(ScanEvent::NewAlert {
                        alert: alert.clone(),
                    })
                    .await;
                }
                Err(e) => {
                    error!(symbol = %alert.symbol, kind = %alert.kind(), "Failed to persist alert: {:#}", e);
                    self.deliver(ScanEvent::AlertUpdated {
                        alert: alert.clone(),
                    })
                    .await;
                }
            },
        }
        alert
    }

    async fn deliver(&self, event: ScanEvent) {
        if let Err(e) = self.sink.deliver(event).await {
            warn!("Sink delivery failed: {:#}", e);
        }
    }
}
