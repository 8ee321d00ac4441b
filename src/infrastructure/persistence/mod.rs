pub mod alert_repository;
pub mod candle_repository;
pub mod database;
pub mod watchlist_repository;

pub use alert_repository::SqliteAlertRepository;
pub use candle_repository::SqliteCandleRepository;
pub use database::Database;
pub use watchlist_repository::SqliteWatchlistRepository;
