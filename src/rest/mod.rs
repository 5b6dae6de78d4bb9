//! Canonical query-string construction and the signed/unsigned REST pipeline.
//!
//! Endpoint wrappers are out of scope here; this module exposes the one
//! canonical `request` pipeline they are expected to call.

use crate::clock::Clock;
use crate::error::{BinanceError, Result};
use crate::ratelimit::{RateLimitReport, RateLimiter};
use crate::signer::Signer;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Canonicalizes a parameter map into the exact byte sequence both the
/// client and the server must agree on: lexicographic sort over UTF-8 keys
/// (free from a `BTreeMap`), values percent-encoded per RFC 3986, array
/// values rendered as minified JSON before encoding.
pub fn canonical_query_string(params: &BTreeMap<String, Value>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), encode_value(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn encode_value(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Array(_) => value.to_string(), // minified JSON, e.g. ["BTCUSDT","ETHUSDT"]
        other => other.to_string(),
    };
    urlencoding::encode(&raw).into_owned()
}

/// Which sliding-window counter class a REST path is charged against.
/// Order-submitting paths are `ORDERS`; everything else is `REQUEST_WEIGHT`.
pub fn class_for_path(path: &str) -> &'static str {
    if path.contains("/order") {
        "ORDERS"
    } else {
        "REQUEST_WEIGHT"
    }
}

pub struct RestTransport {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    signer: Option<Signer>,
    recv_window_ms: i64,
    clock: Arc<Clock>,
    limiter: Arc<RateLimiter>,
}

impl RestTransport {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        signer: Option<Signer>,
        recv_window_ms: i64,
        clock: Arc<Clock>,
        limiter: Arc<RateLimiter>,
        timeout: Duration,
        proxy: Option<reqwest::Proxy>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")));
        if let Some(proxy) = proxy {
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| BinanceError::Generic {
                status: 0,
                code: 0,
                msg: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key,
            signer,
            recv_window_ms,
            clock,
            limiter,
        })
    }

    pub async fn probe_server_time(&self) -> Result<i64> {
        #[derive(serde::Deserialize)]
        struct ServerTime {
            #[serde(rename = "serverTime")]
            server_time: i64,
        }
        let resp: ServerTime = self
            .request(Method::GET, "/api/v3/time", BTreeMap::new(), false)
            .await?;
        Ok(resp.server_time)
    }

    /// Builds the canonical query string, signs it if required, dispatches
    /// the request, and classifies the response into a parsed body or a
    /// typed error.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: BTreeMap<String, Value>,
        signed: bool,
    ) -> Result<T> {
        let class = class_for_path(path);
        self.limiter.charge(class).await;

        let mut query = String::new();
        if signed {
            params.insert("timestamp".to_string(), Value::from(self.clock.now_ms()));
            params.insert("recvWindow".to_string(), Value::from(self.recv_window_ms));
            let canonical = canonical_query_string(&params);
            let signer = self.signer.as_ref().ok_or_else(|| BinanceError::Generic {
                status: 0,
                code: 0,
                msg: "signed request attempted without a configured signer".to_string(),
            })?;
            let signature = signer.sign(&canonical);
            query = format!("{canonical}&signature={}", urlencoding::encode(&signature));
        } else if !params.is_empty() {
            query = canonical_query_string(&params);
        }

        let url = format!("{}{}", self.base_url, path);
        let mut builder = match method {
            Method::GET | Method::DELETE => {
                let full = if query.is_empty() {
                    url
                } else {
                    format!("{url}?{query}")
                };
                self.http.request(method, full)
            }
            _ if signed => {
                // the signed variant still puts everything in the URL
                let full = if query.is_empty() {
                    url
                } else {
                    format!("{url}?{query}")
                };
                self.http.request(method, full)
            }
            _ => self
                .http
                .request(method, url)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(query),
        };

        if let Some(api_key) = &self.api_key {
            builder = builder.header("X-MBX-APIKEY", api_key);
        }

        let response = builder.send().await?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok());
        let used_weight = response
            .headers()
            .get("x-mbx-used-weight-1m")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok());

        if let Some(weight) = used_weight {
            self.limiter
                .reconcile([RateLimitReport {
                    class: "REQUEST_WEIGHT".to_string(),
                    window: Duration::from_secs(60),
                    max: 1_200,
                    server_count: weight,
                }])
                .await;
        }

        if status.as_u16() >= 200 && status.as_u16() <= 202 {
            let body = response.bytes().await?;
            return serde_json::from_slice(&body).map_err(BinanceError::from);
        }

        if matches!(status.as_u16(), 418 | 429) {
            if let Some(retry_after) = retry_after {
                self.limiter.set_backoff(retry_after).await;
            }
        }

        let body_text = response.text().await.unwrap_or_default();
        let (code, msg) = parse_error_body(&body_text);

        if status.as_u16() >= 500 {
            tracing::warn!(
                status = status.as_u16(),
                code,
                %msg,
                "server error: execution status is unknown, caller must reconcile via a status query"
            );
        }

        Err(BinanceError::from_status(status.as_u16(), code, msg))
    }
}

fn parse_error_body(body: &str) -> (i64, String) {
    #[derive(serde::Deserialize)]
    struct ErrBody {
        code: i64,
        msg: String,
    }
    match serde_json::from_str::<ErrBody>(body) {
        Ok(e) => (e.code, e.msg),
        Err(_) => (0, body.to_string()),
    }
}
