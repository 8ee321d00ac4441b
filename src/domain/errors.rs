use thiserror::Error;

/// Errors raised by the exchange connectivity layer.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Exchange API error (retCode {ret_code}): {message}")]
    Api { ret_code: i64, message: String },

    #[error("Request timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Malformed exchange payload: {reason}")]
    MalformedPayload { reason: String },
}

/// Data-integrity conditions that skip an evaluation without alerting.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Insufficient history for {symbol}: {available} closed candles, need {required}")]
    InsufficientHistory {
        symbol: String,
        available: usize,
        required: usize,
    },

    #[error("Exchange time {timestamp_ms} outside plausible range")]
    ImplausibleTime { timestamp_ms: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_error_formatting() {
        let err = ExchangeError::Api {
            ret_code: 10001,
            message: "params error".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("10001"));
        assert!(msg.contains("params error"));
    }

    #[test]
    fn test_data_error_formatting() {
        let err = DataError::InsufficientHistory {
            symbol: "BTCUSDT".to_string(),
            available: 4,
            required: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("BTCUSDT"));
        assert!(msg.contains("4"));
        assert!(msg.contains("10"));
    }
}
