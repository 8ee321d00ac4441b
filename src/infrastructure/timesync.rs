//! Exchange-time oracle.
//!
//! Two corrections are tracked separately. The external offset aligns the
//! local clock with wall UTC using public time endpoints; the exchange
//! offset is then measured against `/v5/market/time` on top of the corrected
//! UTC, so exchange drift is isolated from local clock drift. Both use
//! half-RTT compensation:
//!
//! `offset = server_time - (local_before + (local_after - local_before) / 2)`
//!
//! Offsets are plain atomics; reads never suspend. When every server fails
//! the last known offsets stay in place and candle-close decisions degrade
//! to the naive local comparison.

use crate::domain::ports::Clock;
use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const EXTERNAL_SYNC_INTERVAL_SECS: u64 = 3600;
const EXCHANGE_SYNC_INTERVAL_SECS: u64 = 300;
const SYNC_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Plausible exchange-time window, roughly 2023 through 2033.
const EXCHANGE_TIME_MIN_MS: i64 = 1_700_000_000_000;
const EXCHANGE_TIME_MAX_MS: i64 = 2_000_000_000_000;

fn wall_utc_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Half-RTT compensated offset of a server time against local measurements.
fn compensated_offset(server_time_ms: i64, local_before_ms: i64, local_after_ms: i64) -> i64 {
    let midpoint = local_before_ms + (local_after_ms - local_before_ms) / 2;
    server_time_ms - midpoint
}

fn plausible_exchange_time(timestamp_ms: i64) -> bool {
    (EXCHANGE_TIME_MIN_MS..=EXCHANGE_TIME_MAX_MS).contains(&timestamp_ms)
}

/// Pull the UTC timestamp out of a time-server response. Each endpoint uses
/// its own field name.
fn extract_utc_ms(server_url: &str, body: &serde_json::Value) -> Result<i64> {
    let field = if server_url.contains("worldtimeapi.org") {
        "utc_datetime"
    } else if server_url.contains("timeapi.io") {
        "dateTime"
    } else if server_url.contains("worldclockapi.com") {
        "currentDateTime"
    } else {
        bail!("Unknown time server: {}", server_url);
    };

    let raw = body
        .get(field)
        .and_then(|v| v.as_str())
        .with_context(|| format!("Missing '{}' in time server response", field))?;

    parse_iso_utc_ms(raw)
}

fn parse_iso_utc_ms(raw: &str) -> Result<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }
    // Some endpoints return a naive timestamp that is already UTC.
    let naive = NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .with_context(|| format!("Unparsable timestamp '{}'", raw))?;
    Ok(naive.and_utc().timestamp_millis())
}

#[derive(Debug, Deserialize)]
struct BybitTimeResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: Option<BybitTimeResult>,
}

#[derive(Debug, Deserialize)]
struct BybitTimeResult {
    #[serde(rename = "timeSecond")]
    time_second: String,
    #[serde(rename = "timeNano")]
    time_nano: String,
}

/// Snapshot of the oracle's sync state for logging and status consumers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncStatus {
    pub external_synced: bool,
    pub exchange_synced: bool,
    pub external_offset_ms: i64,
    pub exchange_offset_ms: i64,
    pub status: &'static str,
}

pub struct TimeOracle {
    external_offset_ms: AtomicI64,
    exchange_offset_ms: AtomicI64,
    external_synced: AtomicBool,
    exchange_synced: AtomicBool,
    client: reqwest::Client,
    time_servers: Vec<String>,
    exchange_time_url: String,
}

impl TimeOracle {
    pub fn new(time_servers: Vec<String>, rest_base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SYNC_REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            external_offset_ms: AtomicI64::new(0),
            exchange_offset_ms: AtomicI64::new(0),
            external_synced: AtomicBool::new(false),
            exchange_synced: AtomicBool::new(false),
            client,
            time_servers,
            exchange_time_url: format!("{}/v5/market/time", rest_base_url.trim_end_matches('/')),
        }
    }

    pub fn status(&self) -> SyncStatus {
        let external_synced = self.external_synced.load(Ordering::Relaxed);
        let exchange_synced = self.exchange_synced.load(Ordering::Relaxed);
        SyncStatus {
            external_synced,
            exchange_synced,
            external_offset_ms: self.external_offset_ms.load(Ordering::Relaxed),
            exchange_offset_ms: self.exchange_offset_ms.load(Ordering::Relaxed),
            status: if external_synced || exchange_synced {
                "synced"
            } else {
                "not_synced"
            },
        }
    }

    /// Try each external time server in order until one answers.
    pub async fn sync_external(&self) -> bool {
        for server in &self.time_servers {
            match self.sync_with_server(server).await {
                Ok(offset_ms) => {
                    self.external_offset_ms.store(offset_ms, Ordering::Relaxed);
                    self.external_synced.store(true, Ordering::Relaxed);
                    info!(server, offset_ms, "External time sync succeeded");
                    return true;
                }
                Err(e) => {
                    warn!(server, "Time server sync failed: {:#}", e);
                }
            }
        }
        error!("All external time servers failed; keeping last known offset");
        false
    }

    async fn sync_with_server(&self, server_url: &str) -> Result<i64> {
        let local_before = wall_utc_ms();
        let response = self
            .client
            .get(server_url)
            .send()
            .await
            .context("Time server request failed")?;
        let local_after = wall_utc_ms();

        if !response.status().is_success() {
            bail!("Time server returned HTTP {}", response.status());
        }

        let body: serde_json::Value = response
            .json()
            .await
            .context("Time server returned invalid JSON")?;
        let server_time_ms = extract_utc_ms(server_url, &body)?;

        Ok(compensated_offset(server_time_ms, local_before, local_after))
    }

    /// Measure the exchange offset on top of the corrected UTC clock.
    pub async fn sync_exchange(&self) -> bool {
        match self.fetch_exchange_offset().await {
            Ok(offset_ms) => {
                self.exchange_offset_ms.store(offset_ms, Ordering::Relaxed);
                self.exchange_synced.store(true, Ordering::Relaxed);
                info!(offset_ms, "Exchange time sync succeeded");
                true
            }
            Err(e) => {
                self.exchange_synced.store(false, Ordering::Relaxed);
                warn!("Exchange time sync failed: {:#}", e);
                false
            }
        }
    }

    async fn fetch_exchange_offset(&self) -> Result<i64> {
        let before = self.now_utc_ms();
        let response = self
            .client
            .get(&self.exchange_time_url)
            .send()
            .await
            .context("Exchange time request failed")?;
        let after = self.now_utc_ms();

        if !response.status().is_success() {
            bail!("Exchange time endpoint returned HTTP {}", response.status());
        }

        let body: BybitTimeResponse = response
            .json()
            .await
            .context("Exchange time response is not valid JSON")?;

        if body.ret_code != 0 {
            bail!(
                "Exchange time API error (retCode {}): {}",
                body.ret_code,
                body.ret_msg
            );
        }

        let result = body.result.context("Exchange time response missing result")?;
        let seconds: i64 = result
            .time_second
            .parse()
            .context("Unparsable timeSecond")?;
        let nanos: i64 = result.time_nano.parse().context("Unparsable timeNano")?;
        let exchange_time_ms = seconds * 1000 + (nanos / 1_000_000) % 1000;

        if !plausible_exchange_time(exchange_time_ms) {
            bail!("Implausible exchange time: {}", exchange_time_ms);
        }

        Ok(compensated_offset(exchange_time_ms, before, after))
    }

    /// Initial sync plus the periodic resync loop: exchange every 5 minutes,
    /// external every hour.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let oracle = self.clone();
        tokio::spawn(async move {
            oracle.sync_external().await;
            oracle.sync_exchange().await;

            let mut last_external = wall_utc_ms();
            loop {
                tokio::time::sleep(Duration::from_secs(EXCHANGE_SYNC_INTERVAL_SECS)).await;
                oracle.sync_exchange().await;

                if wall_utc_ms() - last_external > EXTERNAL_SYNC_INTERVAL_SECS as i64 * 1000 {
                    oracle.sync_external().await;
                    last_external = wall_utc_ms();
                }
            }
        })
    }
}

impl Clock for TimeOracle {
    fn now_utc_ms(&self) -> i64 {
        wall_utc_ms() + self.external_offset_ms.load(Ordering::Relaxed)
    }

    fn now_exchange_ms(&self) -> i64 {
        self.now_utc_ms() + self.exchange_offset_ms.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_rtt_compensation() {
        // Server reports 1000ms while the request took 200ms locally,
        // centred on local time 100: offset is 1000 - 200 = 800.
        assert_eq!(compensated_offset(1000, 100, 300), 800);
        // Zero RTT degenerates to a simple difference.
        assert_eq!(compensated_offset(500, 500, 500), 0);
    }

    #[test]
    fn test_plausibility_window() {
        assert!(plausible_exchange_time(1_750_000_000_000));
        assert!(!plausible_exchange_time(1_000_000_000));
        assert!(!plausible_exchange_time(2_500_000_000_000));
    }

    #[test]
    fn test_extract_worldtimeapi_payload() {
        let body = serde_json::json!({
            "utc_datetime": "2024-01-01T00:00:00.000000+00:00"
        });
        let ms = extract_utc_ms("http://worldtimeapi.org/api/timezone/UTC", &body).unwrap();
        assert_eq!(ms, 1_704_067_200_000);
    }

    #[test]
    fn test_extract_timeapi_naive_payload() {
        let body = serde_json::json!({
            "dateTime": "2024-01-01T00:00:00.1234567"
        });
        let ms = extract_utc_ms(
            "https://timeapi.io/api/Time/current/zone?timeZone=UTC",
            &body,
        )
        .unwrap();
        assert_eq!(ms, 1_704_067_200_123);
    }

    #[test]
    fn test_extract_rejects_unknown_server() {
        let body = serde_json::json!({ "now": "2024-01-01T00:00:00Z" });
        assert!(extract_utc_ms("https://example.com/time", &body).is_err());
    }

    #[test]
    fn test_unsynced_oracle_degrades_to_local_time() {
        let oracle = TimeOracle::new(vec![], "https://api.bybit.com");
        let before = wall_utc_ms();
        let now = oracle.now_exchange_ms();
        let after = wall_utc_ms();
        assert!(now >= before && now <= after);
        assert_eq!(oracle.status().status, "not_synced");
    }

    #[test]
    fn test_candle_close_decision() {
        let oracle = TimeOracle::new(vec![], "https://api.bybit.com");
        assert!(oracle.is_candle_closed(wall_utc_ms() - 1000));
        assert!(!oracle.is_candle_closed(wall_utc_ms() + 60_000));
    }
}
