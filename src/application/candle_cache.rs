//! In-memory rolling candle window, one per symbol.
//!
//! Each window is owned by the symbol's worker, so mutation is serialized
//! without locks; detectors read a snapshot slice.

use crate::domain::market::Candle;
use std::collections::VecDeque;

/// Maximum candles kept per symbol (two hours of one-minute data).
pub const WINDOW_CAPACITY: usize = 120;

/// Ordered window of the most recent candles for one symbol.
///
/// Insertion keeps candles sorted by open time ascending; an update with an
/// already-present open time overwrites in place. Overflow drops the oldest.
#[derive(Debug, Default)]
pub struct CandleWindow {
    candles: VecDeque<Candle>,
}

impl CandleWindow {
    pub fn new() -> Self {
        Self {
            candles: VecDeque::with_capacity(WINDOW_CAPACITY),
        }
    }

    /// Seed the window with closed candles loaded from the store, oldest
    /// first. Existing entries win on open-time collision.
    pub fn warm_up(&mut self, history: Vec<Candle>) {
        for candle in history {
            if !self
                .candles
                .iter()
                .any(|c| c.open_time_ms == candle.open_time_ms)
            {
                self.update(candle);
            }
        }
    }

    pub fn update(&mut self, candle: Candle) {
        match self
            .candles
            .binary_search_by_key(&candle.open_time_ms, |c| c.open_time_ms)
        {
            Ok(idx) => {
                self.candles[idx] = candle;
            }
            Err(idx) => {
                self.candles.insert(idx, candle);
                while self.candles.len() > WINDOW_CAPACITY {
                    self.candles.pop_front();
                }
            }
        }
    }

    /// Drop candles opening before `cutoff_ms`.
    pub fn evict_older_than(&mut self, cutoff_ms: i64) {
        while self
            .candles
            .front()
            .is_some_and(|c| c.open_time_ms < cutoff_ms)
        {
            self.candles.pop_front();
        }
    }

    pub fn slice(&self) -> &VecDeque<Candle> {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}
