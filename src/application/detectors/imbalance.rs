//! Smart-Money imbalance detection.
//!
//! Stateless scan over the cached candle window ending at the current
//! candle. Three patterns are checked in a fixed order and the first match
//! wins: Fair Value Gap, Order Block, Breaker Block. The same input slice
//! always yields the same output.

use crate::config::DetectionSettings;
use crate::domain::alerts::{Direction, Imbalance, ImbalanceKind};
use crate::domain::market::Candle;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::VecDeque;

fn pct_above(value: Decimal, base: Decimal) -> Option<f64> {
    if base <= Decimal::ZERO {
        return None;
    }
    ((value - base) / base * Decimal::ONE_HUNDRED).to_f64()
}

/// Pattern scanner configured from a settings snapshot.
#[derive(Debug, Clone)]
pub struct ImbalanceDetector {
    fvg_enabled: bool,
    order_block_enabled: bool,
    breaker_block_enabled: bool,
    min_gap_pct: f64,
    order_block_move_pct: f64,
    breaker_block_move_pct: f64,
}

impl ImbalanceDetector {
    pub fn from_settings(settings: &DetectionSettings) -> Self {
        Self {
            fvg_enabled: settings.fvg_enabled,
            order_block_enabled: settings.order_block_enabled,
            breaker_block_enabled: settings.breaker_block_enabled,
            min_gap_pct: settings.min_gap_pct,
            order_block_move_pct: settings.order_block_move_pct,
            breaker_block_move_pct: settings.breaker_block_move_pct,
        }
    }

    /// First matching pattern over the window, FVG before OB before breaker.
    pub fn detect(&self, candles: &VecDeque<Candle>) -> Option<Imbalance> {
        if self.fvg_enabled
            && let Some(fvg) = self.fair_value_gap(candles)
        {
            return Some(fvg);
        }
        if self.order_block_enabled
            && let Some(ob) = self.order_block(candles)
        {
            return Some(ob);
        }
        if self.breaker_block_enabled
            && let Some(breaker) = self.breaker_block(candles)
        {
            return Some(breaker);
        }
        None
    }

    /// Gap between the candle two back and the latest candle, left by an
    /// impulsive middle candle.
    fn fair_value_gap(&self, candles: &VecDeque<Candle>) -> Option<Imbalance> {
        if candles.len() < 3 {
            return None;
        }
        let prev = &candles[candles.len() - 3];
        let middle = &candles[candles.len() - 2];
        let last = &candles[candles.len() - 1];

        if prev.low > last.high && middle.is_bullish() {
            let strength = pct_above(prev.low, last.high)?;
            if strength >= self.min_gap_pct {
                return Some(Imbalance {
                    kind: ImbalanceKind::FairValueGap,
                    direction: Direction::Bull,
                    strength,
                    top: prev.low,
                    bottom: last.high,
                    timestamp_ms: middle.open_time_ms,
                });
            }
        }

        if prev.high < last.low && !middle.is_bullish() {
            let strength = pct_above(last.low, prev.high)?;
            if strength >= self.min_gap_pct {
                return Some(Imbalance {
                    kind: ImbalanceKind::FairValueGap,
                    direction: Direction::Bear,
                    strength,
                    top: last.low,
                    bottom: prev.high,
                    timestamp_ms: middle.open_time_ms,
                });
            }
        }

        None
    }

    /// Last opposite-direction candle before a displacement through it.
    fn order_block(&self, candles: &VecDeque<Candle>) -> Option<Imbalance> {
        if candles.len() < 10 {
            return None;
        }
        let current = &candles[candles.len() - 1];
        let window_start = candles.len() - 10;
        let window = candles.range(window_start..candles.len() - 1);

        if current.is_bullish() {
            let block = window.rev().find(|c| !c.is_bullish())?;
            let strength = pct_above(current.close, block.high)?;
            if strength >= self.order_block_move_pct {
                return Some(Imbalance {
                    kind: ImbalanceKind::OrderBlock,
                    direction: Direction::Bull,
                    strength,
                    top: block.high,
                    bottom: block.low,
                    timestamp_ms: block.open_time_ms,
                });
            }
        } else {
            let block = window.rev().find(|c| c.is_bullish())?;
            if block.low <= Decimal::ZERO {
                return None;
            }
            let strength = ((block.low - current.close) / block.low
                * Decimal::ONE_HUNDRED)
                .to_f64()?;
            if strength >= self.order_block_move_pct {
                return Some(Imbalance {
                    kind: ImbalanceKind::OrderBlock,
                    direction: Direction::Bear,
                    strength,
                    top: block.high,
                    bottom: block.low,
                    timestamp_ms: block.open_time_ms,
                });
            }
        }

        None
    }

    /// Close beyond the extreme of the trailing fourteen-candle range.
    fn breaker_block(&self, candles: &VecDeque<Candle>) -> Option<Imbalance> {
        if candles.len() < 15 {
            return None;
        }
        let current = &candles[candles.len() - 1];
        let window_start = candles.len() - 15;
        let mut highs = Decimal::MIN;
        let mut lows = Decimal::MAX;
        for c in candles.range(window_start..candles.len() - 1) {
            highs = highs.max(c.high);
            lows = lows.min(c.low);
        }

        if current.close > highs && current.is_bullish() {
            let strength = pct_above(current.close, highs)?;
            if strength >= self.breaker_block_move_pct {
                return Some(Imbalance {
                    kind: ImbalanceKind::BreakerBlock,
                    direction: Direction::Bull,
                    strength,
                    top: highs,
                    bottom: lows,
                    timestamp_ms: current.open_time_ms,
                });
            }
        }

        if current.close < lows && !current.is_bullish() && lows > Decimal::ZERO {
            let strength = ((lows - current.close) / lows * Decimal::ONE_HUNDRED).to_f64()?;
            if strength >= self.breaker_block_move_pct {
                return Some(Imbalance {
                    kind: ImbalanceKind::BreakerBlock,
                    direction: Direction::Bear,
                    strength,
                    top: highs,
                    bottom: lows,
                    timestamp_ms: current.open_time_ms,
                });
            }
        }

        None
    }
}
