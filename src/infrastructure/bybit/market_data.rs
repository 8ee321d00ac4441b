//! Bybit v5 REST market data.
//!
//! Two read-only endpoints are used: the kline window for backfill and the
//! order-book snapshot for alert annotation. Order-book fetches are bounded
//! to five in flight with 200 ms pacing so alert bursts cannot hammer the
//! endpoint.

use crate::domain::alerts::OrderBookSnapshot;
use crate::domain::errors::ExchangeError;
use crate::domain::market::Candle;
use crate::domain::ports::{HistoryProvider, OrderBookProvider};
use crate::infrastructure::core::HttpClientFactory;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tokio::sync::Semaphore;
use tokio::time::{Duration, sleep};
use tracing::debug;

const KLINE_LIMIT_MAX: u64 = 1000;
const ORDER_BOOK_DEPTH: u32 = 25;
const ORDER_BOOK_MAX_IN_FLIGHT: usize = 5;
const ORDER_BOOK_PACING_MS: u64 = 200;

#[derive(Debug, Deserialize)]
struct BybitResponse<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    result: Option<T>,
}

impl<T> BybitResponse<T> {
    fn into_result(self) -> Result<T> {
        if self.ret_code != 0 {
            return Err(ExchangeError::Api {
                ret_code: self.ret_code,
                message: self.ret_msg,
            }
            .into());
        }
        self.result
            .ok_or_else(|| {
                ExchangeError::MalformedPayload {
                    reason: "missing result".to_string(),
                }
                .into()
            })
    }
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    list: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct OrderBookResult {
    #[serde(rename = "b")]
    bids: Vec<Vec<String>>,
    #[serde(rename = "a")]
    asks: Vec<Vec<String>>,
    #[serde(rename = "ts")]
    timestamp_ms: i64,
}

pub struct BybitMarketData {
    client: ClientWithMiddleware,
    base_url: String,
    order_book_permits: Semaphore,
}

impl BybitMarketData {
    pub fn new(base_url: String) -> Self {
        Self {
            client: HttpClientFactory::create_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            order_book_permits: Semaphore::new(ORDER_BOOK_MAX_IN_FLIGHT),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .send()
            .await
            .context("Bybit request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Api {
                ret_code: status.as_u16() as i64,
                message: body,
            }
            .into());
        }

        response.json().await.context("Failed to parse Bybit response")
    }
}

fn parse_level(pair: &[String]) -> Option<(Decimal, Decimal)> {
    let price = Decimal::from_str(pair.first()?).ok()?;
    let qty = Decimal::from_str(pair.get(1)?).ok()?;
    Some((price, qty))
}

fn candle_from_kline(symbol: &str, row: &[String]) -> Option<Candle> {
    if row.len() < 6 {
        return None;
    }
    let open_time_ms: i64 = row[0].parse().ok()?;
    Some(Candle {
        symbol: symbol.to_string(),
        open_time_ms,
        close_time_ms: Candle::close_time_for(open_time_ms),
        open: Decimal::from_str(&row[1]).ok()?,
        high: Decimal::from_str(&row[2]).ok()?,
        low: Decimal::from_str(&row[3]).ok()?,
        close: Decimal::from_str(&row[4]).ok()?,
        volume: Decimal::from_str(&row[5]).ok()?,
        is_closed: true,
    })
}

#[async_trait]
impl HistoryProvider for BybitMarketData {
    async fn fetch_klines(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>> {
        let minutes = ((end_ms - start_ms) / 60_000).max(0) as u64;
        let limit = (minutes + 60).min(KLINE_LIMIT_MAX);

        let response: BybitResponse<KlineResult> = self
            .get_json(
                "/v5/market/kline",
                &[
                    ("category", "linear"),
                    ("symbol", symbol),
                    ("interval", "1"),
                    ("start", &start_ms.to_string()),
                    ("end", &end_ms.to_string()),
                    ("limit", &limit.to_string()),
                ],
            )
            .await?;
        let result = response.into_result()?;

        // Bybit returns klines newest first.
        let mut candles: Vec<Candle> = result
            .list
            .iter()
            .filter_map(|row| candle_from_kline(symbol, row))
            .collect();
        candles.reverse();

        debug!(symbol, count = candles.len(), "Fetched kline window");
        Ok(candles)
    }
}

#[async_trait]
impl OrderBookProvider for BybitMarketData {
    async fn order_book_snapshot(&self, symbol: &str) -> Result<OrderBookSnapshot> {
        let _permit = self
            .order_book_permits
            .acquire()
            .await
            .context("Order-book semaphore closed")?;
        sleep(Duration::from_millis(ORDER_BOOK_PACING_MS)).await;

        let response: BybitResponse<OrderBookResult> = self
            .get_json(
                "/v5/market/orderbook",
                &[
                    ("category", "linear"),
                    ("symbol", symbol),
                    ("limit", &ORDER_BOOK_DEPTH.to_string()),
                ],
            )
            .await?;
        let result = response.into_result()?;

        Ok(OrderBookSnapshot {
            bids: result
                .bids
                .iter()
                .filter_map(|p| parse_level(p))
                .collect(),
            asks: result
                .asks
                .iter()
                .filter_map(|p| parse_level(p))
                .collect(),
            timestamp_ms: result.timestamp_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_kline_row_parsing() {
        let row: Vec<String> = [
            "1700000040000",
            "100.5",
            "101.0",
            "100.0",
            "100.8",
            "1234.5",
            "124321.2",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let candle = candle_from_kline("BTCUSDT", &row).unwrap();
        assert_eq!(candle.open_time_ms, 1_700_000_040_000);
        assert_eq!(candle.close_time_ms, 1_700_000_100_000);
        assert_eq!(candle.open, dec!(100.5));
        assert_eq!(candle.volume, dec!(1234.5));
        assert!(candle.is_closed);
    }

    #[test]
    fn test_short_kline_row_rejected() {
        let row: Vec<String> = ["1700000040000", "100.5"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(candle_from_kline("BTCUSDT", &row).is_none());
    }

    #[test]
    fn test_order_book_level_parsing() {
        let pair = vec!["100.5".to_string(), "3.25".to_string()];
        assert_eq!(parse_level(&pair), Some((dec!(100.5), dec!(3.25))));

        let bad = vec!["not-a-number".to_string(), "1".to_string()];
        assert!(parse_level(&bad).is_none());
    }

    #[test]
    fn test_api_error_is_surfaced() {
        let response: BybitResponse<KlineResult> = BybitResponse {
            ret_code: 10001,
            ret_msg: "params error".to_string(),
            result: None,
        };
        let err = response.into_result().unwrap_err();
        assert!(err.to_string().contains("10001"));
    }
}
