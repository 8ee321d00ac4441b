pub mod bybit;
pub mod core;
pub mod persistence;
pub mod repositories;
pub mod timesync;
