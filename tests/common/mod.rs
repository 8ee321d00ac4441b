//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokenscan::application::events::EventBus;
use tokenscan::application::processor::{SymbolProcessor, SymbolState};
use tokenscan::config::{DetectionSettings, SettingsHandle};
use tokenscan::domain::market::Candle;
use tokenscan::domain::ports::Clock;
use tokenscan::domain::repositories::CandleRepository;
use tokenscan::infrastructure::repositories::{
    InMemoryAlertRepository, InMemoryCandleRepository,
};

/// Minute-aligned base timestamp used by every scenario.
pub const BASE_MS: i64 = 1_700_000_040_000;

/// Manually advanced clock; exchange time equals corrected UTC.
pub struct TestClock {
    now_ms: AtomicI64,
}

impl TestClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

impl Clock for TestClock {
    fn now_utc_ms(&self) -> i64 {
        self.now_ms.load(Ordering::Relaxed)
    }

    fn now_exchange_ms(&self) -> i64 {
        self.now_ms.load(Ordering::Relaxed)
    }
}

pub struct TestRig {
    pub candles: Arc<InMemoryCandleRepository>,
    pub alerts: Arc<InMemoryAlertRepository>,
    pub bus: EventBus,
    pub clock: Arc<TestClock>,
    pub settings: SettingsHandle,
    pub processor: SymbolProcessor,
}

impl TestRig {
    pub fn new(settings: DetectionSettings, now_ms: i64) -> Self {
        let candles = Arc::new(InMemoryCandleRepository::new());
        let alerts = Arc::new(InMemoryAlertRepository::new());
        let bus = EventBus::new();
        let clock = Arc::new(TestClock::new(now_ms));
        let settings = SettingsHandle::new(settings);

        let processor = SymbolProcessor::new(
            candles.clone(),
            alerts.clone(),
            Arc::new(bus.clone()),
            clock.clone(),
            None,
            None,
            settings.clone(),
        );

        Self {
            candles,
            alerts,
            bus,
            clock,
            settings,
            processor,
        }
    }

    /// Store `count` closed candles ending one minute before `end_ms`, each
    /// with the given quote volume, alternating nothing: all bullish.
    pub async fn seed_closed_bullish(&self, symbol: &str, count: usize, end_ms: i64, vq: Decimal) {
        for i in 0..count {
            let open_time_ms = end_ms - (count as i64 - i as i64) * 60_000;
            // close 100, open 99: bullish with volume_quote = volume * 100.
            let volume = vq / Decimal::from(100);
            let candle = Candle {
                symbol: symbol.to_string(),
                open_time_ms,
                close_time_ms: open_time_ms + 60_000,
                open: Decimal::from(99),
                high: Decimal::from(101),
                low: Decimal::from(98),
                close: Decimal::from(100),
                volume,
                is_closed: true,
            };
            self.candles.upsert(&candle).await.unwrap();
        }
    }
}

/// Candle builder for stream updates.
pub fn candle(
    symbol: &str,
    open_time_ms: i64,
    open: Decimal,
    close: Decimal,
    volume: Decimal,
    is_closed: bool,
) -> Candle {
    Candle {
        symbol: symbol.to_string(),
        open_time_ms,
        close_time_ms: open_time_ms + 60_000,
        open,
        high: open.max(close),
        low: open.min(close),
        close,
        volume,
        is_closed,
    }
}

pub fn new_state() -> SymbolState {
    SymbolState::new()
}
