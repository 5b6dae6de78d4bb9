//! Typed error taxonomy surfaced by every component of the core.
//!
//! Raw HTTP status codes and JSON error bodies never leak past the REST and
//! WebSocket transports; both classify responses into this enum before
//! returning to the caller.

use thiserror::Error;

/// The complete error surface the library promises its callers.
#[derive(Error, Debug)]
pub enum BinanceError {
    /// Parameter or validation error (HTTP 400-402, 404-408, 410-417, 419-428, 430, 431).
    #[error("malformed request ({code}): {msg}")]
    MalformedRequest { code: i64, msg: String },

    /// Authentication failure (HTTP 401).
    #[error("unauthorized ({code}): {msg}")]
    Unauthorized { code: i64, msg: String },

    /// Web application firewall block (HTTP 403).
    #[error("WAF violation")]
    WAFViolation,

    /// Cancel-replace partial success edge case (HTTP 409).
    #[error("cancel-replace partial success ({code}): {msg}")]
    CancelReplacePartialSuccess { code: i64, msg: String },

    /// Rate limit exceeded (HTTP 429). The triggering backoff has already
    /// been applied to the rate limiter by the time this is returned.
    #[error("rate limit exceeded ({code}): {msg}")]
    RateLimit { code: i64, msg: String },

    /// IP address auto-banned by the exchange (HTTP 418). Backoff applied.
    #[error("IP auto-banned")]
    IPAutoBanned,

    /// Server-side failure (HTTP 5xx). Execution status is unknown: a caller
    /// that submitted an order must reconcile via a status query rather than
    /// assume the request did not take effect.
    #[error("server error (status {status}, code {code}): {msg}")]
    ServerError {
        status: u16,
        code: i64,
        msg: String,
    },

    /// Local cancellation or shutdown, distinct from a server-reported error.
    #[error("request cancelled")]
    Cancelled,

    /// An in-flight WebSocket call was abandoned by a reconnect.
    #[error("connection lost")]
    ConnectionLost,

    /// SBE or JSON payload could not be decoded.
    #[error("decode error: {reason}")]
    Decode { reason: String },

    /// Anything not covered by the above.
    #[error("error (status {status}, code {code}): {msg}")]
    Generic { status: u16, code: i64, msg: String },
}

impl BinanceError {
    /// Whether the condition is plausibly transient and worth a caller-level retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BinanceError::RateLimit { .. }
                | BinanceError::IPAutoBanned
                | BinanceError::ServerError { .. }
                | BinanceError::ConnectionLost
        )
    }

    /// Maps an HTTP status and an opportunistically-parsed `(code, msg)` body
    /// into the typed taxonomy, per the transport's response classification
    /// table.
    pub fn from_status(status: u16, code: i64, msg: String) -> Self {
        match status {
            200..=202 => unreachable!("success statuses never become errors"),
            401 => BinanceError::Unauthorized { code, msg },
            403 => BinanceError::WAFViolation,
            409 => BinanceError::CancelReplacePartialSuccess { code, msg },
            418 => BinanceError::IPAutoBanned,
            429 => BinanceError::RateLimit { code, msg },
            400..=402 | 404..=408 | 410..=417 | 419..=428 | 430 | 431 => {
                BinanceError::MalformedRequest { code, msg }
            }
            500..=599 => BinanceError::ServerError { status, code, msg },
            other => BinanceError::Generic {
                status: other,
                code,
                msg,
            },
        }
    }
}

impl From<serde_json::Error> for BinanceError {
    fn from(err: serde_json::Error) -> Self {
        BinanceError::Decode {
            reason: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for BinanceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            BinanceError::ConnectionLost
        } else {
            BinanceError::Generic {
                status: err.status().map(|s| s.as_u16()).unwrap_or(0),
                code: 0,
                msg: err.to_string(),
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, BinanceError>;
