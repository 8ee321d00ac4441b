pub mod backfill;
pub mod bootstrap;
pub mod candle_cache;
pub mod detectors;
pub mod events;
pub mod processor;
pub mod scanner;
