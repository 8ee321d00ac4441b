//! Bybit public linear WebSocket ingestion.
//!
//! One supervisor task owns the connection lifecycle: connect, subscribe the
//! watchlist to `kline.1.{symbol}` in batches, then read until the stream
//! errors, the server closes, the watchdog trips on 120 s of silence, or
//! shutdown is signalled. Every exit path returns to the supervisor loop,
//! which reconnects after a fixed 5 s pause.
//!
//! A per-connection reconciler polls the watchlist store every 60 s and
//! converges the live subscriptions: removed pairs are unsubscribed in one
//! batch, new pairs subscribed in paced batches and backfilled.

use crate::application::backfill::BackfillService;
use crate::application::events::EventBus;
use crate::application::scanner::ScannerService;
use crate::domain::alerts::ScanEvent;
use crate::domain::errors::ExchangeError;
use crate::domain::market::Candle;
use crate::domain::repositories::WatchlistRepository;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{RwLock, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const SUBSCRIBE_BATCH_SIZE: usize = 50;
const SUBSCRIBE_BATCH_PACING_MS: u64 = 500;
const RECONCILE_INTERVAL_SECS: u64 = 60;
const WATCHDOG_CHECK_SECS: u64 = 60;
const SILENCE_TIMEOUT_SECS: i64 = 120;
const RECONNECT_DELAY_SECS: u64 = 5;
const KLINE_TOPIC_PREFIX: &str = "kline.1.";

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    ret_msg: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    start: i64,
    end: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    confirm: bool,
}

/// Parse one raw frame into a kline update. Non-kline frames (subscription
/// acks, op echoes) yield `None`.
fn parse_kline_frame(text: &str) -> Result<Option<Candle>> {
    let envelope: WsEnvelope =
        serde_json::from_str(text).context("Unparsable WebSocket frame")?;

    if let Some(success) = envelope.success {
        if !success {
            warn!(
                "Subscription request rejected: {}",
                envelope.ret_msg.unwrap_or_default()
            );
        }
        return Ok(None);
    }
    if envelope.op.is_some() {
        return Ok(None);
    }

    let Some(topic) = envelope.topic else {
        return Ok(None);
    };
    let Some(symbol) = topic.strip_prefix(KLINE_TOPIC_PREFIX) else {
        return Ok(None);
    };

    let data = envelope.data.context("Kline frame without data")?;
    let payloads: Vec<KlinePayload> =
        serde_json::from_value(data).context("Malformed kline payload")?;
    let Some(kline) = payloads.into_iter().next() else {
        return Ok(None);
    };

    let parse = |raw: &str, field: &str| -> Result<Decimal> {
        Decimal::from_str(raw).with_context(|| format!("Invalid {} '{}'", field, raw))
    };

    Ok(Some(Candle {
        symbol: symbol.to_string(),
        open_time_ms: kline.start,
        close_time_ms: kline.end,
        open: parse(&kline.open, "open")?,
        high: parse(&kline.high, "high")?,
        low: parse(&kline.low, "low")?,
        close: parse(&kline.close, "close")?,
        volume: parse(&kline.volume, "volume")?,
        is_closed: kline.confirm,
    }))
}

/// Difference between the tracked set and the watchlist, sorted for
/// deterministic batching.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscriptionPlan {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SubscriptionPlan {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn diff_watchlist(tracked: &HashSet<String>, desired: &HashSet<String>) -> SubscriptionPlan {
    let mut added: Vec<String> = desired.difference(tracked).cloned().collect();
    let mut removed: Vec<String> = tracked.difference(desired).cloned().collect();
    added.sort();
    removed.sort();
    SubscriptionPlan { added, removed }
}

fn subscribe_message(symbols: &[String]) -> String {
    let args: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}{}", KLINE_TOPIC_PREFIX, s))
        .collect();
    serde_json::json!({ "op": "subscribe", "args": args }).to_string()
}

fn unsubscribe_message(symbols: &[String]) -> String {
    let args: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}{}", KLINE_TOPIC_PREFIX, s))
        .collect();
    serde_json::json!({ "op": "unsubscribe", "args": args }).to_string()
}

pub struct BybitWebSocketClient {
    ws_url: String,
    watchlist: Arc<dyn WatchlistRepository>,
    scanner: Arc<ScannerService>,
    backfill: Arc<BackfillService>,
    bus: EventBus,
    /// Pairs the connection is subscribed to.
    tracked: Arc<RwLock<HashSet<String>>>,
    /// Pairs that have delivered at least one frame this connection.
    confirmed: Arc<RwLock<HashSet<String>>>,
    shutdown: watch::Receiver<bool>,
}

impl BybitWebSocketClient {
    pub fn new(
        ws_url: String,
        watchlist: Arc<dyn WatchlistRepository>,
        scanner: Arc<ScannerService>,
        backfill: Arc<BackfillService>,
        bus: EventBus,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ws_url,
            watchlist,
            scanner,
            backfill,
            bus,
            tracked: Arc::new(RwLock::new(HashSet::new())),
            confirmed: Arc::new(RwLock::new(HashSet::new())),
            shutdown,
        }
    }

    /// Supervisor loop: reconnect with a fixed pause until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.connect_and_stream().await {
                Ok(()) => info!("WebSocket connection closed"),
                Err(e) => error!("WebSocket connection failed: {:#}", e),
            }
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(tokio::time::Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("WebSocket supervisor stopped");
    }

    async fn connect_and_stream(&self) -> Result<()> {
        let symbols = self
            .watchlist
            .active_symbols()
            .await
            .context("Failed to load watchlist")?;
        {
            let mut tracked = self.tracked.write().await;
            *tracked = symbols.iter().cloned().collect();
            self.confirmed.write().await.clear();
        }

        info!(
            pairs = symbols.len(),
            "Connecting to WebSocket: {}", self.ws_url
        );
        let (ws_stream, _) = connect_async(&self.ws_url)
            .await
            .context("WebSocket connect failed")?;
        let (mut write, mut read) = ws_stream.split();

        // All outgoing frames go through one writer task.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(100);
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        self.send_subscriptions(&out_tx, &symbols).await?;
        self.publish_subscription_event(symbols.clone(), Vec::new())
            .await;

        // Watchdog: tear the connection down after prolonged silence.
        let last_message_ms = Arc::new(AtomicI64::new(chrono::Utc::now().timestamp_millis()));
        let silence = Arc::new(tokio::sync::Notify::new());
        let watchdog = tokio::spawn(Self::run_watchdog(
            last_message_ms.clone(),
            silence.clone(),
        ));

        let reconciler = tokio::spawn(Self::run_reconciler_loop(
            self.watchlist.clone(),
            self.backfill.clone(),
            self.bus.clone(),
            out_tx.clone(),
            self.shutdown.clone(),
            self.tracked.clone(),
            self.confirmed.clone(),
        ));

        let mut shutdown = self.shutdown.clone();
        let result = loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            last_message_ms
                                .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
                            self.handle_frame(text.as_str()).await;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = out_tx.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("WebSocket closed by server: {:?}", frame);
                            break Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            break Err(ExchangeError::ConnectionLost {
                                reason: e.to_string(),
                            }
                            .into());
                        }
                        None => {
                            break Err(ExchangeError::ConnectionLost {
                                reason: "stream ended".to_string(),
                            }
                            .into());
                        }
                    }
                }
                _ = silence.notified() => {
                    break Err(ExchangeError::ConnectionLost {
                        reason: format!("no messages for {}s", SILENCE_TIMEOUT_SECS),
                    }
                    .into());
                }
                _ = shutdown.changed() => {
                    info!("Shutdown requested, closing WebSocket");
                    break Ok(());
                }
            }
        };

        watchdog.abort();
        reconciler.abort();
        drop(out_tx);
        let _ = writer.await;
        result
    }

    async fn handle_frame(&self, text: &str) {
        match parse_kline_frame(text) {
            Ok(Some(candle)) => {
                {
                    let tracked = self.tracked.read().await;
                    if !tracked.contains(&candle.symbol) {
                        debug!(symbol = %candle.symbol, "Frame for untracked pair");
                        return;
                    }
                }
                self.confirmed.write().await.insert(candle.symbol.clone());
                self.scanner.dispatch(candle).await;
            }
            Ok(None) => {}
            Err(e) => debug!("Ignoring unparsable frame: {:#}", e),
        }
    }

    async fn send_subscriptions(
        &self,
        out_tx: &mpsc::Sender<Message>,
        symbols: &[String],
    ) -> Result<()> {
        for (batch_index, batch) in symbols.chunks(SUBSCRIBE_BATCH_SIZE).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(tokio::time::Duration::from_millis(
                    SUBSCRIBE_BATCH_PACING_MS,
                ))
                .await;
            }
            out_tx
                .send(Message::Text(subscribe_message(batch).into()))
                .await
                .context("Writer task is gone")?;
            debug!(batch = batch_index + 1, pairs = batch.len(), "Sent subscription batch");
        }
        Ok(())
    }

    async fn publish_subscription_event(&self, added: Vec<String>, removed: Vec<String>) {
        let tracked = self.tracked.read().await;
        let confirmed = self.confirmed.read().await;
        self.bus.publish(ScanEvent::SubscriptionUpdated {
            total: tracked.len(),
            subscribed: confirmed.len(),
            pending: tracked.len().saturating_sub(confirmed.len()),
            added,
            removed,
        });
    }

    async fn run_watchdog(last_message_ms: Arc<AtomicI64>, silence: Arc<tokio::sync::Notify>) {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(WATCHDOG_CHECK_SECS)).await;
            let elapsed_ms =
                chrono::Utc::now().timestamp_millis() - last_message_ms.load(Ordering::Relaxed);
            if elapsed_ms > SILENCE_TIMEOUT_SECS * 1000 {
                warn!(
                    elapsed_secs = elapsed_ms / 1000,
                    "No WebSocket messages, forcing reconnect"
                );
                silence.notify_one();
                return;
            }
        }
    }

    async fn run_reconciler_loop(
        watchlist: Arc<dyn WatchlistRepository>,
        backfill: Arc<BackfillService>,
        bus: EventBus,
        out_tx: mpsc::Sender<Message>,
        mut shutdown: watch::Receiver<bool>,
        tracked_pairs: Arc<RwLock<HashSet<String>>>,
        confirmed_pairs: Arc<RwLock<HashSet<String>>>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tokio::time::Duration::from_secs(RECONCILE_INTERVAL_SECS)) => {}
                _ = shutdown.changed() => return,
            }

            let desired: HashSet<String> = match watchlist.active_symbols().await {
                Ok(symbols) => symbols.into_iter().collect(),
                Err(e) => {
                    warn!("Watchlist poll failed: {:#}", e);
                    continue;
                }
            };

            let plan = {
                let tracked = tracked_pairs.read().await;
                diff_watchlist(&tracked, &desired)
            };
            if plan.is_empty() {
                continue;
            }

            info!(
                added = plan.added.len(),
                removed = plan.removed.len(),
                "Reconciling subscriptions"
            );

            if !plan.removed.is_empty()
                && out_tx
                    .send(Message::Text(unsubscribe_message(&plan.removed).into()))
                    .await
                    .is_err()
            {
                return;
            }

            for (batch_index, batch) in plan.added.chunks(SUBSCRIBE_BATCH_SIZE).enumerate() {
                if batch_index > 0 {
                    tokio::time::sleep(tokio::time::Duration::from_millis(
                        SUBSCRIBE_BATCH_PACING_MS,
                    ))
                    .await;
                }
                if out_tx
                    .send(Message::Text(subscribe_message(batch).into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }

            {
                let mut tracked = tracked_pairs.write().await;
                let mut confirmed = confirmed_pairs.write().await;
                for symbol in &plan.removed {
                    tracked.remove(symbol);
                    confirmed.remove(symbol);
                }
                for symbol in &plan.added {
                    tracked.insert(symbol.clone());
                }
            }

            for symbol in &plan.added {
                if let Err(e) = backfill.backfill_symbol(symbol).await {
                    warn!(symbol, "Backfill for new pair failed: {:#}", e);
                }
            }

            let (total, subscribed) = {
                let tracked = tracked_pairs.read().await;
                let confirmed = confirmed_pairs.read().await;
                (tracked.len(), confirmed.len())
            };
            bus.publish(ScanEvent::SubscriptionUpdated {
                total,
                subscribed,
                pending: total.saturating_sub(subscribed),
                added: plan.added.clone(),
                removed: plan.removed.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_in_progress_kline_frame() {
        let frame = r#"{
            "topic": "kline.1.BTCUSDT",
            "type": "snapshot",
            "ts": 1700000045123,
            "data": [{
                "start": 1700000040000,
                "end": 1700000100000,
                "interval": "1",
                "open": "100.5",
                "high": "101.2",
                "low": "100.1",
                "close": "100.9",
                "volume": "1234.5",
                "turnover": "124500.0",
                "confirm": false,
                "timestamp": 1700000045123
            }]
        }"#;

        let candle = parse_kline_frame(frame).unwrap().unwrap();
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.open_time_ms, 1_700_000_040_000);
        assert_eq!(candle.close, dec!(100.9));
        assert!(!candle.is_closed);
    }

    #[test]
    fn test_parse_confirm_flag() {
        let frame = r#"{
            "topic": "kline.1.ETHUSDT",
            "data": [{
                "start": 1700000040000,
                "end": 1700000100000,
                "open": "1",
                "high": "2",
                "low": "1",
                "close": "2",
                "volume": "10",
                "confirm": true
            }]
        }"#;
        let candle = parse_kline_frame(frame).unwrap().unwrap();
        assert!(candle.is_closed);
    }

    #[test]
    fn test_subscription_ack_yields_nothing() {
        let frame = r#"{"success": true, "op": "subscribe", "conn_id": "abc"}"#;
        assert!(parse_kline_frame(frame).unwrap().is_none());
    }

    #[test]
    fn test_diff_watchlist_plan() {
        let tracked: HashSet<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        let desired: HashSet<String> =
            ["B", "C", "D", "E"].iter().map(|s| s.to_string()).collect();

        let plan = diff_watchlist(&tracked, &desired);
        assert_eq!(plan.added, vec!["D".to_string(), "E".to_string()]);
        assert_eq!(plan.removed, vec!["A".to_string()]);

        let unchanged = diff_watchlist(&desired, &desired);
        assert!(unchanged.is_empty());
    }

    #[test]
    fn test_subscription_messages() {
        let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let subscribe = subscribe_message(&symbols);
        assert!(subscribe.contains(r#""op":"subscribe""#));
        assert!(subscribe.contains("kline.1.BTCUSDT"));

        let unsubscribe = unsubscribe_message(&symbols[..1].to_vec());
        assert!(unsubscribe.contains(r#""op":"unsubscribe""#));
        assert!(unsubscribe.contains("kline.1.BTCUSDT"));
    }
}
