//! Consecutive-run and priority-correlation scenarios.

mod common;

use common::{BASE_MS, TestRig, candle, new_state};
use rust_decimal_macros::dec;
use tokenscan::config::DetectionSettings;
use tokenscan::domain::alerts::{AlertKind, AlertPayload};

const SYMBOL: &str = "ETHUSDT";

/// Bullish close with quote volume too small to trip the volume detector.
fn quiet_bullish(minute: i64) -> tokenscan::domain::market::Candle {
    // 1 * 101 = 101 quote volume, under the 1000 floor.
    candle(SYMBOL, minute, dec!(100), dec!(101), dec!(1), true)
}

fn quiet_bearish(minute: i64) -> tokenscan::domain::market::Candle {
    candle(SYMBOL, minute, dec!(101), dec!(100), dec!(1), true)
}

#[tokio::test]
async fn run_alert_grows_then_breaks() {
    let rig = TestRig::new(DetectionSettings::default(), BASE_MS);
    let mut state = new_state();

    // Five consecutive bullish closes create one alert with count 5.
    for i in 0..5 {
        let minute = BASE_MS + i * 60_000;
        rig.clock.set(minute + 61_000);
        rig.processor.handle_update(&mut state, quiet_bullish(minute)).await;
    }

    let runs = rig.alerts.by_kind(AlertKind::ConsecutiveLong).await;
    assert_eq!(runs.len(), 1);
    let run_id = runs[0].id.unwrap();
    assert_eq!(runs[0].consecutive_count(), Some(5));
    assert!(runs[0].is_closed);

    // A sixth bullish close grows the same row.
    let minute = BASE_MS + 5 * 60_000;
    rig.clock.set(minute + 61_000);
    rig.processor.handle_update(&mut state, quiet_bullish(minute)).await;

    let runs = rig.alerts.by_kind(AlertKind::ConsecutiveLong).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, Some(run_id));
    assert_eq!(runs[0].consecutive_count(), Some(6));

    // A bearish close finalizes the row with the break message.
    let minute = BASE_MS + 6 * 60_000;
    rig.clock.set(minute + 61_000);
    rig.processor.handle_update(&mut state, quiet_bearish(minute)).await;

    let runs = rig.alerts.by_kind(AlertKind::ConsecutiveLong).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, Some(run_id));
    assert_eq!(runs[0].message, "Bullish run broken by bearish close");
    assert_eq!(runs[0].consecutive_count(), Some(6));

    // A fresh run starts a new row with a new id.
    for i in 7..12 {
        let minute = BASE_MS + i * 60_000;
        rig.clock.set(minute + 61_000);
        rig.processor.handle_update(&mut state, quiet_bullish(minute)).await;
    }
    let runs = rig.alerts.by_kind(AlertKind::ConsecutiveLong).await;
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().any(|a| a.id != Some(run_id)));
}

#[tokio::test]
async fn short_run_never_alerts() {
    let rig = TestRig::new(DetectionSettings::default(), BASE_MS);
    let mut state = new_state();

    for i in 0..4 {
        let minute = BASE_MS + i * 60_000;
        rig.clock.set(minute + 61_000);
        rig.processor.handle_update(&mut state, quiet_bullish(minute)).await;
    }
    let minute = BASE_MS + 4 * 60_000;
    rig.clock.set(minute + 61_000);
    rig.processor.handle_update(&mut state, quiet_bearish(minute)).await;

    assert!(rig.alerts.by_kind(AlertKind::ConsecutiveLong).await.is_empty());
}

#[tokio::test]
async fn priority_fires_when_run_and_spike_coincide() {
    let rig = TestRig::new(DetectionSettings::default(), BASE_MS);
    // Baseline for the volume detector: quote volume 1000 on average.
    rig.seed_closed_bullish(SYMBOL, 60, BASE_MS, dec!(1000)).await;

    let mut state = new_state();

    // Four bullish closes with baseline-sized volume keep the run alive
    // without tripping the volume detector (ratio 1.0).
    for i in 0..4 {
        let minute = BASE_MS + i * 60_000;
        rig.clock.set(minute + 61_000);
        let c = candle(SYMBOL, minute, dec!(99), dec!(100), dec!(10), true);
        rig.processor.handle_update(&mut state, c).await;
    }

    // The fifth close is both the run threshold and a 3.3x volume spike.
    let minute = BASE_MS + 4 * 60_000;
    rig.clock.set(minute + 61_000);
    let spike = candle(SYMBOL, minute, dec!(100), dec!(110), dec!(30), true);
    rig.processor.handle_update(&mut state, spike).await;

    let volume_alerts = rig.alerts.by_kind(AlertKind::VolumeSpike).await;
    let run_alerts = rig.alerts.by_kind(AlertKind::ConsecutiveLong).await;
    let priority_alerts = rig.alerts.by_kind(AlertKind::Priority).await;
    assert_eq!(volume_alerts.len(), 1, "source volume alert is kept");
    assert_eq!(run_alerts.len(), 1, "source run alert is kept");
    assert_eq!(priority_alerts.len(), 1, "priority joins the two");

    let priority = &priority_alerts[0];
    match &priority.payload {
        AlertPayload::Priority {
            consecutive_count,
            volume_ratio,
            current_volume_quote,
            average_volume_quote,
        } => {
            assert_eq!(*consecutive_count, 5);
            assert_eq!(*volume_ratio, volume_alerts[0].volume_ratio());
            assert!(current_volume_quote.is_some());
            assert!(average_volume_quote.is_some());
        }
        other => panic!("unexpected payload: {:?}", other),
    }
    assert_eq!(
        priority.has_imbalance,
        volume_alerts[0].has_imbalance || run_alerts[0].has_imbalance
    );
    assert_eq!(priority.price, run_alerts[0].price);
}

#[tokio::test]
async fn priority_uses_recent_spike_lookback() {
    let rig = TestRig::new(DetectionSettings::default(), BASE_MS);
    rig.seed_closed_bullish(SYMBOL, 60, BASE_MS, dec!(1000)).await;

    let mut state = new_state();

    // Two quiet bullish closes.
    for i in 0..2 {
        let minute = BASE_MS + i * 60_000;
        rig.clock.set(minute + 61_000);
        let c = candle(SYMBOL, minute, dec!(99), dec!(100), dec!(10), true);
        rig.processor.handle_update(&mut state, c).await;
    }

    // Third close spikes (run count 3, still below the threshold).
    let minute = BASE_MS + 2 * 60_000;
    rig.clock.set(minute + 61_000);
    let spike = candle(SYMBOL, minute, dec!(100), dec!(110), dec!(30), true);
    rig.processor.handle_update(&mut state, spike).await;
    assert_eq!(rig.alerts.by_kind(AlertKind::VolumeSpike).await.len(), 1);
    assert!(rig.alerts.by_kind(AlertKind::Priority).await.is_empty());

    // Two more quiet closes reach the run threshold. The batch has no
    // volume alert, but the spike two minutes back is inside the
    // run-length lookback.
    for i in 3..5 {
        let minute = BASE_MS + i * 60_000;
        rig.clock.set(minute + 61_000);
        let c = candle(SYMBOL, minute, dec!(99), dec!(100), dec!(10), true);
        rig.processor.handle_update(&mut state, c).await;
    }

    let priority_alerts = rig.alerts.by_kind(AlertKind::Priority).await;
    assert_eq!(priority_alerts.len(), 1);
    match &priority_alerts[0].payload {
        AlertPayload::Priority {
            consecutive_count,
            volume_ratio,
            ..
        } => {
            assert_eq!(*consecutive_count, 5);
            // No batch volume alert to copy figures from.
            assert!(volume_ratio.is_none());
        }
        other => panic!("unexpected payload: {:?}", other),
    }
}
