//! Consecutive-bullish run tracking.
//!
//! Operates on closed candles only. The per-symbol counter equals the length
//! of the current bullish suffix; when it crosses the configured threshold a
//! single alert row is created and then grown in place on every further
//! bullish close. A bearish close finalizes the open row with a "run broken"
//! message and resets the counter.

use crate::domain::alerts::{Alert, AlertPayload, CandleSnapshot, Imbalance};
use crate::domain::market::Candle;

/// Decision produced by the tracker; persistence happens in the processor.
#[derive(Debug, Clone, PartialEq)]
pub enum RunAction {
    /// The run just reached the threshold (save, then feed the id back).
    Create(Alert),
    /// The run extended; rewrite the same row.
    Update(Alert),
    /// The run broke; final rewrite of the same row.
    Finalize(Alert),
}

/// Per-symbol run state.
#[derive(Debug, Default)]
pub struct RunTracker {
    count: u32,
    open_alert: Option<Alert>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn open_alert_id(&self) -> Option<i64> {
        self.open_alert.as_ref().and_then(|a| a.id)
    }

    /// Record the repository-assigned id of the open run alert.
    pub fn assign_alert_id(&mut self, id: i64) {
        if let Some(alert) = self.open_alert.as_mut() {
            alert.id = Some(id);
        }
    }

    pub fn on_closed_candle(
        &mut self,
        candle: &Candle,
        threshold: u32,
        imbalance: Option<Imbalance>,
    ) -> Option<RunAction> {
        let close_time_ms = Candle::close_time_for(candle.open_time_ms);

        if candle.is_bullish() {
            self.count += 1;
            if self.count < threshold {
                return None;
            }

            match self.open_alert.as_mut() {
                None => {
                    let mut alert = Alert {
                        id: None,
                        symbol: candle.symbol.clone(),
                        price: candle.close,
                        alert_time_ms: close_time_ms,
                        close_time_ms: Some(close_time_ms),
                        is_closed: true,
                        has_imbalance: false,
                        imbalance: None,
                        candle: Some(CandleSnapshot::of(candle)),
                        order_book: None,
                        message: format!("{} consecutive bullish closes", self.count),
                        payload: AlertPayload::ConsecutiveRun {
                            consecutive_count: self.count,
                        },
                    };
                    alert.set_imbalance(imbalance);
                    self.open_alert = Some(alert.clone());
                    Some(RunAction::Create(alert))
                }
                Some(alert) => {
                    alert.price = candle.close;
                    alert.alert_time_ms = close_time_ms;
                    alert.close_time_ms = Some(close_time_ms);
                    alert.candle = Some(CandleSnapshot::of(candle));
                    alert.set_imbalance(imbalance);
                    alert.message = format!("{} consecutive bullish closes", self.count);
                    alert.payload = AlertPayload::ConsecutiveRun {
                        consecutive_count: self.count,
                    };
                    Some(RunAction::Update(alert.clone()))
                }
            }
        } else {
            let action = match self.open_alert.take() {
                Some(mut alert) if self.count >= threshold => {
                    alert.price = candle.close;
                    alert.close_time_ms = Some(close_time_ms);
                    alert.candle = Some(CandleSnapshot::of(candle));
                    alert.set_imbalance(imbalance);
                    alert.message = "Bullish run broken by bearish close".to_string();
                    Some(RunAction::Finalize(alert))
                }
                _ => None,
            };

            self.count = 0;
            self.open_alert = None;
            action
        }
    }
}
