//! Real-time perpetual-futures volume scanner.
//!
//! Ingests one-minute klines from the Bybit public linear stream, keeps a
//! rolling per-symbol history, and emits volume-spike, consecutive-bullish
//! and priority alerts, optionally annotated with Smart-Money imbalance
//! patterns. Alerts and candles persist to SQLite; downstream sinks consume
//! a broadcast event stream.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
