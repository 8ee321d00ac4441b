//! Alert records emitted by the signal detectors.
//!
//! An [`Alert`] is a tagged record: a common header shared by every kind plus
//! an [`AlertPayload`] variant carrying the kind-specific fields. Optional
//! substructures (imbalance, candle snapshot, order-book snapshot) are kept
//! as typed values here and serialized to opaque JSON blobs at the store
//! boundary.

use crate::domain::market::Candle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    VolumeSpike,
    ConsecutiveLong,
    Priority,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::VolumeSpike => write!(f, "volume_spike"),
            AlertKind::ConsecutiveLong => write!(f, "consecutive_long"),
            AlertKind::Priority => write!(f, "priority"),
        }
    }
}

impl AlertKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "volume_spike" => Some(AlertKind::VolumeSpike),
            "consecutive_long" => Some(AlertKind::ConsecutiveLong),
            "priority" => Some(AlertKind::Priority),
            _ => None,
        }
    }
}

/// Smart-Money price-action structure detected over the recent window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Imbalance {
    pub kind: ImbalanceKind,
    pub direction: Direction,
    /// Displacement size in percent.
    pub strength: f64,
    pub top: Decimal,
    pub bottom: Decimal,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImbalanceKind {
    FairValueGap,
    OrderBlock,
    BreakerBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bull,
    Bear,
}

/// OHLCV snapshot of the triggering candle, frozen into the alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleSnapshot {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Price at which the first preliminary alert fired, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_level: Option<Decimal>,
}

impl CandleSnapshot {
    pub fn of(candle: &Candle) -> Self {
        Self {
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            alert_level: None,
        }
    }

    pub fn with_alert_level(candle: &Candle, level: Decimal) -> Self {
        Self {
            alert_level: Some(level),
            ..Self::of(candle)
        }
    }
}

/// 25-level order-book snapshot taken at alert time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub timestamp_ms: i64,
}

/// Kind-specific alert fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AlertPayload {
    VolumeSpike {
        volume_ratio: f64,
        current_volume_quote: f64,
        average_volume_quote: f64,
        /// Defined only after the candle closes: whether it closed bullish.
        is_true_signal: Option<bool>,
    },
    ConsecutiveRun {
        consecutive_count: u32,
    },
    Priority {
        consecutive_count: u32,
        volume_ratio: Option<f64>,
        current_volume_quote: Option<f64>,
        average_volume_quote: Option<f64>,
    },
}

impl AlertPayload {
    pub fn kind(&self) -> AlertKind {
        match self {
            AlertPayload::VolumeSpike { .. } => AlertKind::VolumeSpike,
            AlertPayload::ConsecutiveRun { .. } => AlertKind::ConsecutiveLong,
            AlertPayload::Priority { .. } => AlertKind::Priority,
        }
    }
}

/// A signal emitted by the pipeline.
///
/// `id` is assigned by the alert repository on first save. An alert reaching
/// the sinks with `id == None` could not be persisted and is ephemeral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Option<i64>,
    pub symbol: String,
    pub price: Decimal,
    pub alert_time_ms: i64,
    pub close_time_ms: Option<i64>,
    pub is_closed: bool,
    pub has_imbalance: bool,
    pub imbalance: Option<Imbalance>,
    pub candle: Option<CandleSnapshot>,
    pub order_book: Option<OrderBookSnapshot>,
    pub message: String,
    pub payload: AlertPayload,
}

impl Alert {
    pub fn kind(&self) -> AlertKind {
        self.payload.kind()
    }

    pub fn consecutive_count(&self) -> Option<u32> {
        match &self.payload {
            AlertPayload::ConsecutiveRun { consecutive_count }
            | AlertPayload::Priority {
                consecutive_count, ..
            } => Some(*consecutive_count),
            AlertPayload::VolumeSpike { .. } => None,
        }
    }

    pub fn volume_ratio(&self) -> Option<f64> {
        match &self.payload {
            AlertPayload::VolumeSpike { volume_ratio, .. } => Some(*volume_ratio),
            AlertPayload::Priority { volume_ratio, .. } => *volume_ratio,
            AlertPayload::ConsecutiveRun { .. } => None,
        }
    }

    pub fn set_imbalance(&mut self, imbalance: Option<Imbalance>) {
        self.has_imbalance = imbalance.is_some();
        self.imbalance = imbalance;
    }
}

/// Events carried over the sink broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEvent {
    NewAlert {
        alert: Alert,
    },
    AlertUpdated {
        alert: Alert,
    },
    SubscriptionUpdated {
        total: usize,
        subscribed: usize,
        pending: usize,
        added: Vec<String>,
        removed: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn volume_alert() -> Alert {
        Alert {
            id: Some(7),
            symbol: "BTCUSDT".to_string(),
            price: dec!(110),
            alert_time_ms: 1_700_000_100_000,
            close_time_ms: None,
            is_closed: false,
            has_imbalance: false,
            imbalance: None,
            candle: None,
            order_book: None,
            message: "Preliminary volume spike: 3.30x average".to_string(),
            payload: AlertPayload::VolumeSpike {
                volume_ratio: 3.3,
                current_volume_quote: 3300.0,
                average_volume_quote: 1000.0,
                is_true_signal: None,
            },
        }
    }

    #[test]
    fn test_kind_from_payload() {
        assert_eq!(volume_alert().kind(), AlertKind::VolumeSpike);
        assert_eq!(AlertKind::VolumeSpike.to_string(), "volume_spike");
        assert_eq!(
            AlertKind::parse("consecutive_long"),
            Some(AlertKind::ConsecutiveLong)
        );
        assert_eq!(AlertKind::parse("unknown"), None);
    }

    #[test]
    fn test_field_accessors() {
        let alert = volume_alert();
        assert_eq!(alert.volume_ratio(), Some(3.3));
        assert_eq!(alert.consecutive_count(), None);

        let mut priority = alert.clone();
        priority.payload = AlertPayload::Priority {
            consecutive_count: 5,
            volume_ratio: Some(3.3),
            current_volume_quote: Some(3300.0),
            average_volume_quote: Some(1000.0),
        };
        assert_eq!(priority.consecutive_count(), Some(5));
        assert_eq!(priority.volume_ratio(), Some(3.3));
    }

    #[test]
    fn test_imbalance_flag_follows_value() {
        let mut alert = volume_alert();
        alert.set_imbalance(Some(Imbalance {
            kind: ImbalanceKind::FairValueGap,
            direction: Direction::Bull,
            strength: 1.85,
            top: dec!(110),
            bottom: dec!(108),
            timestamp_ms: 1_700_000_040_000,
        }));
        assert!(alert.has_imbalance);

        alert.set_imbalance(None);
        assert!(!alert.has_imbalance);
        assert!(alert.imbalance.is_none());
    }

    #[test]
    fn test_payload_round_trips_as_json() {
        let alert = volume_alert();
        let json = serde_json::to_string(&alert).unwrap();
        let back: Alert = serde_json::from_str(&json).unwrap();
        assert_eq!(back, alert);
    }
}
