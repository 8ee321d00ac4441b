use anyhow::anyhow;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Duration of one kline interval in milliseconds.
pub const CANDLE_INTERVAL_MS: i64 = 60_000;

/// One-minute OHLCV record for a (symbol, open time) pair.
///
/// While `is_closed` is false the candle is still forming and subsequent
/// stream ticks may overwrite high/low/close/volume. Once closed the tuple is
/// frozen; the store upsert is the only mutation path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub is_closed: bool,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// Volume expressed in the quote asset (base volume x close).
    pub fn volume_quote(&self) -> Decimal {
        self.volume * self.close
    }

    pub fn volume_quote_f64(&self) -> f64 {
        self.volume_quote().to_f64().unwrap_or(0.0)
    }

    /// Rounds a millisecond timestamp down to its minute boundary.
    pub fn align_to_minute(timestamp_ms: i64) -> i64 {
        (timestamp_ms / CANDLE_INTERVAL_MS) * CANDLE_INTERVAL_MS
    }

    /// Close time for a candle opening at `open_time_ms`.
    pub fn close_time_for(open_time_ms: i64) -> i64 {
        open_time_ms + CANDLE_INTERVAL_MS
    }
}

/// Which candle direction contributes to the historical volume baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeFilter {
    Bull,
    Bear,
    All,
}

impl FromStr for VolumeFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "long" | "bull" => Ok(VolumeFilter::Bull),
            "short" | "bear" => Ok(VolumeFilter::Bear),
            "all" => Ok(VolumeFilter::All),
            _ => Err(anyhow!(
                "Invalid volume type: '{}'. Must be 'long', 'short' or 'all'",
                s
            )),
        }
    }
}

impl fmt::Display for VolumeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeFilter::Bull => write!(f, "long"),
            VolumeFilter::Bear => write!(f, "short"),
            VolumeFilter::All => write!(f, "all"),
        }
    }
}

/// Result of a store integrity check over a trailing window.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityReport {
    pub expected: u64,
    pub existing: u64,
    pub missing: u64,
    pub percent: f64,
}

impl IntegrityReport {
    pub fn new(expected: u64, existing: u64) -> Self {
        let missing = expected.saturating_sub(existing);
        let percent = if expected > 0 {
            existing as f64 / expected as f64 * 100.0
        } else {
            0.0
        };
        Self {
            expected,
            existing,
            missing,
            percent,
        }
    }
}
