//! Volume-spike detection with the two-phase alert lifecycle.
//!
//! [`evaluate`] is the pure spike test run against every update of a bullish
//! candle. [`VolumeAlertBook`] is the per-symbol state machine that coalesces
//! preliminary emissions for a minute into a single alert row and finalizes
//! it when the candle closes. The book only decides; persistence and sink
//! delivery happen in the processor, which feeds assigned ids back via
//! [`VolumeAlertBook::assign_entry_id`].

use crate::config::DetectionSettings;
use crate::domain::alerts::{Alert, AlertPayload, CandleSnapshot, Imbalance, OrderBookSnapshot};
use crate::domain::market::Candle;
use rust_decimal::Decimal;
use tracing::debug;

/// Minimum closed candles required in the baseline window.
pub const MIN_HISTORY: usize = 10;

/// Outcome of the pure spike test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeSignal {
    pub volume_quote: f64,
    pub average_volume: f64,
    pub ratio: f64,
}

/// Pure spike evaluation for one candle update against the historical
/// baseline. Returns `None` when any gate fails: candle not bullish, quote
/// volume below the floor, baseline too small, or ratio under the
/// multiplier.
pub fn evaluate(
    candle: &Candle,
    history: &[f64],
    settings: &DetectionSettings,
) -> Option<VolumeSignal> {
    if !candle.is_bullish() {
        return None;
    }

    let volume_quote = candle.volume_quote_f64();
    if volume_quote < settings.min_volume_quote {
        return None;
    }

    if history.len() < MIN_HISTORY {
        debug!(
            symbol = %candle.symbol,
            available = history.len(),
            "Skipping volume evaluation: insufficient history"
        );
        return None;
    }

    let average_volume = history.iter().sum::<f64>() / history.len() as f64;
    if average_volume <= 0.0 {
        return None;
    }

    let ratio = volume_quote / average_volume;
    if ratio < settings.volume_multiplier {
        return None;
    }

    Some(VolumeSignal {
        volume_quote,
        average_volume,
        ratio,
    })
}

/// Decision produced by the book; the processor persists and broadcasts it.
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeAction {
    /// New preliminary alert for this minute (save, then feed the id back).
    Create(Alert),
    /// In-place rewrite of the preliminary alert (same id).
    Update(Alert),
    /// The pending preliminary became final (same id).
    Finalize(Alert),
    /// The spike only showed at close; a finalized alert with a fresh id.
    CreateFinalized(Alert),
}

#[derive(Debug, Clone)]
struct PendingEntry {
    open_time_ms: i64,
    volume_quote: f64,
    alert_level: Decimal,
    alert: Alert,
}

/// Per-symbol two-phase lifecycle state.
#[derive(Debug, Default)]
pub struct VolumeAlertBook {
    entry: Option<PendingEntry>,
    last_true_signal_ms: Option<i64>,
}

impl VolumeAlertBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp of the last finalized true signal, kept as a per-symbol
    /// cooldown mark.
    pub fn last_true_signal_ms(&self) -> Option<i64> {
        self.last_true_signal_ms
    }

    pub fn has_pending(&self) -> bool {
        self.entry.is_some()
    }

    /// Record the repository-assigned id of the pending preliminary alert.
    pub fn assign_entry_id(&mut self, id: i64) {
        if let Some(entry) = self.entry.as_mut() {
            entry.alert.id = Some(id);
        }
    }

    /// Phase A: an in-progress update passed the spike test.
    pub fn on_in_progress(
        &mut self,
        candle: &Candle,
        signal: VolumeSignal,
        imbalance: Option<Imbalance>,
        order_book: Option<OrderBookSnapshot>,
        now_ms: i64,
    ) -> Option<VolumeAction> {
        if let Some(entry) = self.entry.as_mut() {
            if entry.open_time_ms == candle.open_time_ms {
                // Rewrite the same row only when the minute got louder.
                if signal.volume_quote <= entry.volume_quote {
                    return None;
                }
                let alert_level = entry.alert_level;
                entry.volume_quote = signal.volume_quote;
                entry.alert.price = candle.close;
                entry.alert.candle = Some(CandleSnapshot::with_alert_level(candle, alert_level));
                entry.alert.set_imbalance(imbalance);
                if order_book.is_some() {
                    entry.alert.order_book = order_book;
                }
                entry.alert.message =
                    format!("Preliminary alert: volume {:.2}x average", signal.ratio);
                entry.alert.payload = AlertPayload::VolumeSpike {
                    volume_ratio: round2(signal.ratio),
                    current_volume_quote: signal.volume_quote,
                    average_volume_quote: signal.average_volume,
                    is_true_signal: None,
                };
                return Some(VolumeAction::Update(entry.alert.clone()));
            }
            // A pending entry for an older minute means its close call never
            // arrived; drop it rather than mixing minutes.
            debug!(
                symbol = %candle.symbol,
                stale_minute = entry.open_time_ms,
                "Discarding stale preliminary volume entry"
            );
            self.entry = None;
        }

        if let Some(window) = self.last_true_signal_ms {
            debug!(
                symbol = %candle.symbol,
                cooldown_since = window,
                "New preliminary alert while cooldown mark is set"
            );
        }

        let alert_level = candle.close;
        let mut alert = Alert {
            id: None,
            symbol: candle.symbol.clone(),
            price: candle.close,
            alert_time_ms: now_ms,
            close_time_ms: None,
            is_closed: false,
            has_imbalance: false,
            imbalance: None,
            candle: Some(CandleSnapshot::with_alert_level(candle, alert_level)),
            order_book,
            message: format!("Preliminary alert: volume {:.2}x average", signal.ratio),
            payload: AlertPayload::VolumeSpike {
                volume_ratio: round2(signal.ratio),
                current_volume_quote: signal.volume_quote,
                average_volume_quote: signal.average_volume,
                is_true_signal: None,
            },
        };
        alert.set_imbalance(imbalance);

        self.entry = Some(PendingEntry {
            open_time_ms: candle.open_time_ms,
            volume_quote: signal.volume_quote,
            alert_level,
            alert: alert.clone(),
        });

        Some(VolumeAction::Create(alert))
    }

    /// Phase B: the candle closed. A pending preliminary is always finalized
    /// with the candle's true direction, even when the spike test no longer
    /// passes on the final shape. Without a pending entry a finalized alert
    /// is created only when the final candle itself passes the test.
    pub fn on_close(
        &mut self,
        candle: &Candle,
        signal: Option<VolumeSignal>,
        imbalance: Option<Imbalance>,
        order_book: Option<OrderBookSnapshot>,
        now_ms: i64,
    ) -> Option<VolumeAction> {
        let is_true = candle.is_bullish();
        let close_time_ms = Candle::close_time_for(candle.open_time_ms);

        if let Some(entry) = self.entry.take() {
            if entry.open_time_ms != candle.open_time_ms {
                // Close for a different minute than the pending one; put the
                // entry back and treat this close on its own.
                self.entry = Some(entry);
            } else {
                let mut alert = entry.alert;
                let (ratio, volume_quote, average) = match signal {
                    Some(s) => (round2(s.ratio), s.volume_quote, s.average_volume),
                    // Keep the last evaluated figures when the final candle
                    // no longer passes the gates.
                    None => match &alert.payload {
                        AlertPayload::VolumeSpike {
                            volume_ratio,
                            current_volume_quote,
                            average_volume_quote,
                            ..
                        } => (*volume_ratio, *current_volume_quote, *average_volume_quote),
                        _ => (0.0, 0.0, 0.0),
                    },
                };

                alert.price = candle.close;
                alert.is_closed = true;
                alert.close_time_ms = Some(close_time_ms);
                alert.candle = Some(CandleSnapshot::with_alert_level(candle, entry.alert_level));
                if imbalance.is_some() {
                    alert.set_imbalance(imbalance);
                }
                if order_book.is_some() {
                    alert.order_book = order_book;
                }
                alert.message = format!(
                    "Final alert: volume {:.2}x average ({} signal)",
                    ratio,
                    if is_true { "true" } else { "false" }
                );
                alert.payload = AlertPayload::VolumeSpike {
                    volume_ratio: ratio,
                    current_volume_quote: volume_quote,
                    average_volume_quote: average,
                    is_true_signal: Some(is_true),
                };

                if is_true {
                    self.last_true_signal_ms = Some(now_ms);
                }
                return Some(VolumeAction::Finalize(alert));
            }
        }

        let signal = signal?;
        let mut alert = Alert {
            id: None,
            symbol: candle.symbol.clone(),
            price: candle.close,
            alert_time_ms: close_time_ms,
            close_time_ms: Some(close_time_ms),
            is_closed: true,
            has_imbalance: false,
            imbalance: None,
            candle: Some(CandleSnapshot::with_alert_level(candle, candle.close)),
            order_book,
            message: format!(
                "Final alert: volume {:.2}x average ({} signal)",
                signal.ratio,
                if is_true { "true" } else { "false" }
            ),
            payload: AlertPayload::VolumeSpike {
                volume_ratio: round2(signal.ratio),
                current_volume_quote: signal.volume_quote,
                average_volume_quote: signal.average_volume,
                is_true_signal: Some(is_true),
            },
        };
        alert.set_imbalance(imbalance);

        if is_true {
            self.last_true_signal_ms = Some(now_ms);
        }

        Some(VolumeAction::CreateFinalized(alert))
    }

    /// Drop a pending entry that outlived the grouping window and cooldown
    /// marks older than one hour.
    pub fn sweep_stale(&mut self, now_ms: i64, grouping_minutes: u64) {
        let entry_cutoff = now_ms - grouping_minutes as i64 * 60_000;
        if self
            .entry
            .as_ref()
            .is_some_and(|e| e.open_time_ms < entry_cutoff)
        {
            self.entry = None;
        }
        let cooldown_cutoff = now_ms - 3_600_000;
        if self.last_true_signal_ms.is_some_and(|t| t < cooldown_cutoff) {
            self.last_true_signal_ms = None;
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
