pub mod market_data;
pub mod websocket;

pub use market_data::BybitMarketData;
pub use websocket::{BybitWebSocketClient, SubscriptionPlan, diff_watchlist};
