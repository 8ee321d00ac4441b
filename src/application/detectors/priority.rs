//! Priority correlation over the close batch.
//!
//! A priority alert fires when the batch produced at a candle close contains
//! a consecutive-run alert and volume confirmation: either a volume-spike
//! alert in the same batch, or a recent volume spike within the run length
//! (in minutes) reported by the alert repository.

use crate::domain::alerts::{Alert, AlertKind, AlertPayload};

/// The consecutive-run alert in a close batch, if any. The processor uses
/// its run length as the lookback for the recent-spike query.
pub fn consecutive_in(batch: &[Alert]) -> Option<&Alert> {
    batch
        .iter()
        .find(|a| a.kind() == AlertKind::ConsecutiveLong)
}

fn volume_in(batch: &[Alert]) -> Option<&Alert> {
    batch.iter().find(|a| a.kind() == AlertKind::VolumeSpike)
}

/// Join the batch into a priority alert. `has_recent_volume_spike` is the
/// repository's answer for the last `run length` minutes and only matters
/// when the batch itself carries no volume alert.
pub fn correlate(batch: &[Alert], has_recent_volume_spike: bool) -> Option<Alert> {
    let consecutive = consecutive_in(batch)?;
    let volume = volume_in(batch);

    if volume.is_none() && !has_recent_volume_spike {
        return None;
    }

    let consecutive_count = consecutive.consecutive_count().unwrap_or(0);

    let (volume_ratio, current_volume_quote, average_volume_quote) = match volume {
        Some(alert) => match &alert.payload {
            AlertPayload::VolumeSpike {
                volume_ratio,
                current_volume_quote,
                average_volume_quote,
                ..
            } => (
                Some(*volume_ratio),
                Some(*current_volume_quote),
                Some(*average_volume_quote),
            ),
            _ => (None, None, None),
        },
        None => (None, None, None),
    };

    // Imbalance is the OR of the two sources, preferring the volume side.
    let imbalance = volume
        .and_then(|a| a.imbalance.clone())
        .or_else(|| consecutive.imbalance.clone());
    let has_imbalance = imbalance.is_some();

    let candle = volume
        .and_then(|a| a.candle.clone())
        .or_else(|| consecutive.candle.clone());

    let mut message = format!(
        "Priority signal: {} bullish closes with volume spike",
        consecutive_count
    );
    if has_imbalance {
        message.push_str(" and imbalance");
    }

    Some(Alert {
        id: None,
        symbol: consecutive.symbol.clone(),
        price: consecutive.price,
        alert_time_ms: consecutive.alert_time_ms,
        close_time_ms: consecutive.close_time_ms,
        is_closed: true,
        has_imbalance,
        imbalance,
        candle,
        order_book: None,
        message,
        payload: AlertPayload::Priority {
            consecutive_count,
            volume_ratio,
            current_volume_quote,
            average_volume_quote,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alerts::{CandleSnapshot, Direction, Imbalance, ImbalanceKind};
    use rust_decimal_macros::dec;

    fn consecutive_alert(count: u32, with_imbalance: bool) -> Alert {
        let mut alert = Alert {
            id: Some(3),
            symbol: "BTCUSDT".to_string(),
            price: dec!(105),
            alert_time_ms: 300_000,
            close_time_ms: Some(300_000),
            is_closed: true,
            has_imbalance: false,
            imbalance: None,
            candle: Some(CandleSnapshot {
                open: dec!(104),
                high: dec!(106),
                low: dec!(103),
                close: dec!(105),
                volume: dec!(10),
                alert_level: None,
            }),
            order_book: None,
            message: format!("{} consecutive bullish closes", count),
            payload: AlertPayload::ConsecutiveRun {
                consecutive_count: count,
            },
        };
        if with_imbalance {
            alert.set_imbalance(Some(Imbalance {
                kind: ImbalanceKind::OrderBlock,
                direction: Direction::Bull,
                strength: 2.4,
                top: dec!(104),
                bottom: dec!(103),
                timestamp_ms: 240_000,
            }));
        }
        alert
    }

    fn volume_alert() -> Alert {
        Alert {
            id: Some(4),
            symbol: "BTCUSDT".to_string(),
            price: dec!(105),
            alert_time_ms: 300_000,
            close_time_ms: Some(300_000),
            is_closed: true,
            has_imbalance: false,
            imbalance: None,
            candle: None,
            order_book: None,
            message: "Final alert: volume 3.30x average (true signal)".to_string(),
            payload: AlertPayload::VolumeSpike {
                volume_ratio: 3.3,
                current_volume_quote: 3300.0,
                average_volume_quote: 1000.0,
                is_true_signal: Some(true),
            },
        }
    }

    #[test]
    fn test_both_alerts_in_batch_produce_priority() {
        let batch = vec![volume_alert(), consecutive_alert(5, false)];
        let priority = correlate(&batch, false).unwrap();

        assert_eq!(priority.kind(), AlertKind::Priority);
        assert_eq!(priority.consecutive_count(), Some(5));
        assert_eq!(priority.volume_ratio(), Some(3.3));
        assert_eq!(priority.price, dec!(105));
        assert!(priority.is_closed);
    }

    #[test]
    fn test_recent_spike_substitutes_for_batch_volume() {
        let batch = vec![consecutive_alert(6, false)];
        let priority = correlate(&batch, true).unwrap();

        assert_eq!(priority.consecutive_count(), Some(6));
        // Volume figures are unavailable without a batch volume alert.
        assert_eq!(priority.volume_ratio(), None);
    }

    #[test]
    fn test_no_consecutive_alert_no_priority() {
        let batch = vec![volume_alert()];
        assert!(correlate(&batch, true).is_none());
    }

    #[test]
    fn test_no_volume_evidence_no_priority() {
        let batch = vec![consecutive_alert(5, false)];
        assert!(correlate(&batch, false).is_none());
    }

    #[test]
    fn test_imbalance_is_or_of_sources() {
        let batch = vec![volume_alert(), consecutive_alert(5, true)];
        let priority = correlate(&batch, false).unwrap();
        assert!(priority.has_imbalance);
        assert_eq!(
            priority.imbalance.as_ref().unwrap().kind,
            ImbalanceKind::OrderBlock
        );

        let batch = vec![volume_alert(), consecutive_alert(5, false)];
        let priority = correlate(&batch, false).unwrap();
        assert!(!priority.has_imbalance);
    }
}
