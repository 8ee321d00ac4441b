//! End-to-end volume-spike lifecycle scenarios driven through the
//! per-symbol processor with in-memory repositories.

mod common;

use common::{BASE_MS, TestRig, candle, new_state};
use rust_decimal_macros::dec;
use tokenscan::config::DetectionSettings;
use tokenscan::domain::alerts::{AlertKind, AlertPayload, ScanEvent};

const SYMBOL: &str = "BTCUSDT";

#[tokio::test]
async fn volume_spike_on_directly_closed_candle() {
    // 60 bullish closed candles with quote volume 1000 (average 1000).
    let rig = TestRig::new(DetectionSettings::default(), BASE_MS);
    rig.seed_closed_bullish(SYMBOL, 60, BASE_MS, dec!(1000)).await;

    let mut state = new_state();
    let mut rx = rig.bus.subscribe();

    // Closed candle: open 100, close 110, volume 30 -> vq 3300, ratio 3.3.
    rig.clock.set(BASE_MS + 61_000);
    let spike = candle(SYMBOL, BASE_MS, dec!(100), dec!(110), dec!(30), true);
    rig.processor.handle_update(&mut state, spike).await;

    let alerts = rig.alerts.by_kind(AlertKind::VolumeSpike).await;
    assert_eq!(alerts.len(), 1, "exactly one volume-spike row");
    let alert = &alerts[0];
    assert!(alert.is_closed);
    assert_eq!(alert.price, dec!(110));
    match &alert.payload {
        AlertPayload::VolumeSpike {
            volume_ratio,
            current_volume_quote,
            average_volume_quote,
            is_true_signal,
        } => {
            assert_eq!(*volume_ratio, 3.30);
            assert_eq!(*current_volume_quote, 3300.0);
            assert_eq!(*average_volume_quote, 1000.0);
            assert_eq!(*is_true_signal, Some(true));
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    match rx.try_recv().unwrap() {
        ScanEvent::NewAlert { alert } => assert_eq!(alert.kind(), AlertKind::VolumeSpike),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn preliminary_alert_finalized_under_same_id() {
    let rig = TestRig::new(DetectionSettings::default(), BASE_MS);
    rig.seed_closed_bullish(SYMBOL, 60, BASE_MS, dec!(1000)).await;

    let mut state = new_state();
    let minute = BASE_MS;

    // First in-progress tick: vq 2500 -> preliminary alert.
    rig.clock.set(minute + 10_000);
    let tick = candle(SYMBOL, minute, dec!(99), dec!(100), dec!(25), false);
    rig.processor.handle_update(&mut state, tick).await;

    let alerts = rig.alerts.by_kind(AlertKind::VolumeSpike).await;
    assert_eq!(alerts.len(), 1);
    let preliminary_id = alerts[0].id.unwrap();
    assert!(!alerts[0].is_closed);

    // Louder tick five seconds later: same id, updated in place.
    rig.clock.set(minute + 15_000);
    let tick = candle(SYMBOL, minute, dec!(99), dec!(100), dec!(40), false);
    rig.processor.handle_update(&mut state, tick).await;

    let alerts = rig.alerts.by_kind(AlertKind::VolumeSpike).await;
    assert_eq!(alerts.len(), 1, "update must not create a second row");
    assert_eq!(alerts[0].id, Some(preliminary_id));
    match &alerts[0].payload {
        AlertPayload::VolumeSpike {
            current_volume_quote,
            ..
        } => assert_eq!(*current_volume_quote, 4000.0),
        other => panic!("unexpected payload: {:?}", other),
    }

    // The candle closes bearish with vq 3800: same id, finalized false.
    rig.clock.set(minute + 65_000);
    let closed = candle(SYMBOL, minute, dec!(100), dec!(95), dec!(40), true);
    rig.processor.handle_update(&mut state, closed).await;

    let alerts = rig.alerts.by_kind(AlertKind::VolumeSpike).await;
    assert_eq!(alerts.len(), 1, "finalization reuses the preliminary row");
    let alert = &alerts[0];
    assert_eq!(alert.id, Some(preliminary_id));
    assert!(alert.is_closed);
    assert_eq!(alert.close_time_ms, Some(minute + 60_000));
    match &alert.payload {
        AlertPayload::VolumeSpike { is_true_signal, .. } => {
            assert_eq!(*is_true_signal, Some(false));
        }
        other => panic!("unexpected payload: {:?}", other),
    }
}

#[tokio::test]
async fn bearish_updates_never_alert() {
    let rig = TestRig::new(DetectionSettings::default(), BASE_MS);
    rig.seed_closed_bullish(SYMBOL, 60, BASE_MS, dec!(1000)).await;

    let mut state = new_state();
    rig.clock.set(BASE_MS + 10_000);
    let tick = candle(SYMBOL, BASE_MS, dec!(100), dec!(95), dec!(50), false);
    rig.processor.handle_update(&mut state, tick).await;

    assert!(rig.alerts.all().await.is_empty());
}

#[tokio::test]
async fn insufficient_history_suppresses_alerts() {
    let rig = TestRig::new(DetectionSettings::default(), BASE_MS);
    // Only 9 closed candles: below the ten-candle floor.
    rig.seed_closed_bullish(SYMBOL, 9, BASE_MS, dec!(1000)).await;

    let mut state = new_state();
    rig.clock.set(BASE_MS + 61_000);
    let spike = candle(SYMBOL, BASE_MS, dec!(100), dec!(110), dec!(30), true);
    rig.processor.handle_update(&mut state, spike).await;

    assert!(rig.alerts.by_kind(AlertKind::VolumeSpike).await.is_empty());
}

#[tokio::test]
async fn replaying_a_closed_candle_is_idempotent() {
    let rig = TestRig::new(DetectionSettings::default(), BASE_MS);
    rig.seed_closed_bullish(SYMBOL, 60, BASE_MS, dec!(1000)).await;

    let mut state = new_state();
    rig.clock.set(BASE_MS + 61_000);
    let spike = candle(SYMBOL, BASE_MS, dec!(100), dec!(110), dec!(30), true);

    rig.processor.handle_update(&mut state, spike.clone()).await;
    let after_first = rig.alerts.all().await;
    let candles_after_first = rig.candles.count(SYMBOL).await;

    // The exchange occasionally re-delivers the confirm frame.
    rig.processor.handle_update(&mut state, spike.clone()).await;
    rig.processor.handle_update(&mut state, spike).await;

    assert_eq!(rig.alerts.all().await, after_first);
    assert_eq!(rig.candles.count(SYMBOL).await, candles_after_first);
}

#[tokio::test]
async fn settings_update_applies_to_subsequent_closes() {
    let rig = TestRig::new(DetectionSettings::default(), BASE_MS);
    rig.seed_closed_bullish(SYMBOL, 60, BASE_MS + 120_000, dec!(1000)).await;

    let mut state = new_state();

    // Ratio 3.3 passes the default 2.0 multiplier.
    rig.clock.set(BASE_MS + 61_000);
    let spike = candle(SYMBOL, BASE_MS, dec!(100), dec!(110), dec!(30), true);
    rig.processor.handle_update(&mut state, spike).await;
    assert_eq!(rig.alerts.by_kind(AlertKind::VolumeSpike).await.len(), 1);

    // Raise the multiplier: the next snapshot suppresses the same ratio.
    let mut stricter = DetectionSettings::default();
    stricter.volume_multiplier = 5.0;
    rig.settings.publish(stricter).unwrap();

    rig.clock.set(BASE_MS + 121_000);
    let spike = candle(
        SYMBOL,
        BASE_MS + 60_000,
        dec!(100),
        dec!(110),
        dec!(30),
        true,
    );
    rig.processor.handle_update(&mut state, spike).await;
    assert_eq!(rig.alerts.by_kind(AlertKind::VolumeSpike).await.len(), 1);
}

#[tokio::test]
async fn disabled_volume_alerts_only_archive_candles() {
    let mut settings = DetectionSettings::default();
    settings.volume_alerts_enabled = false;
    let rig = TestRig::new(settings, BASE_MS);
    rig.seed_closed_bullish(SYMBOL, 60, BASE_MS, dec!(1000)).await;

    let mut state = new_state();
    rig.clock.set(BASE_MS + 61_000);
    let spike = candle(SYMBOL, BASE_MS, dec!(100), dec!(110), dec!(30), true);
    rig.processor.handle_update(&mut state, spike).await;

    assert!(rig.alerts.by_kind(AlertKind::VolumeSpike).await.is_empty());
    assert_eq!(rig.candles.count(SYMBOL).await, 61);
}
