//! WebSocket transport: one persistent connection shared by many in-flight
//! request/response calls plus an event-handler table for unsolicited
//! user-data frames.
//!
//! A reconnect-with-backoff supervisor owns the socket; requests correlate
//! to replies via one-shot channels keyed by a UUID request id, and frames
//! that don't match a pending request are dispatched to registered event
//! handlers instead. Signed requests reuse the REST transport's canonical
//! query string as the signing input, with the clock synced lazily on the
//! first one.

use crate::clock::Clock;
use crate::error::{BinanceError, Result};
use crate::ratelimit::RateLimiter;
use crate::rest::canonical_query_string;
use crate::signer::Signer;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;

pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub reply_timeout: Duration,
}

struct Shared {
    inflight: Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>,
    handlers: RwLock<HashMap<String, EventHandler>>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
}

pub struct WsTransport {
    shared: Arc<Shared>,
    config: WsConfig,
    clock: Arc<Clock>,
    limiter: Arc<RateLimiter>,
    signer: Option<Signer>,
    recv_window_ms: i64,
    shutdown_tx: watch::Sender<bool>,
}

impl WsTransport {
    pub fn new(
        config: WsConfig,
        clock: Arc<Clock>,
        limiter: Arc<RateLimiter>,
        signer: Option<Signer>,
        recv_window_ms: i64,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                inflight: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                write_tx: Mutex::new(None),
                connected: AtomicBool::new(false),
            }),
            config,
            clock,
            limiter,
            signer,
            recv_window_ms,
            shutdown_tx,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// Registers a callback for unsolicited messages whose `e` field equals
    /// `event_type`. Remains registered until explicitly removed.
    pub async fn on_event(&self, event_type: impl Into<String>, handler: EventHandler) {
        self.shared.handlers.write().await.insert(event_type.into(), handler);
    }

    pub async fn remove_handler(&self, event_type: &str) {
        self.shared.handlers.write().await.remove(event_type);
    }

    /// Opens the connection and spawns the reader/heartbeat/reconnect
    /// supervisor. `on_reconnect` re-runs clock sync plus any caller-supplied
    /// re-logon/resubscribe logic after every successful (re)connect.
    pub fn connect(
        &self,
        on_reconnect: impl Fn() -> futures_util::future::BoxFuture<'static, ()> + Send + Sync + 'static,
    ) {
        let shared = self.shared.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let on_reconnect = Arc::new(on_reconnect);

        tokio::spawn(async move {
            let mut backoff = config.reconnect.initial_backoff;
            let mut attempts: u32 = 0;

            loop {
                if *shutdown_rx.borrow() {
                    return;
                }

                match tokio_tungstenite::connect_async(&config.url).await {
                    Ok((stream, _)) => {
                        attempts = 0;
                        backoff = config.reconnect.initial_backoff;
                        shared.connected.store(true, Ordering::Release);

                        let (mut sink, mut source) = stream.split();
                        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Message>();
                        *shared.write_tx.lock().await = Some(write_tx.clone());

                        let writer_pump = tokio::spawn(async move {
                            while let Some(msg) = write_rx.recv().await {
                                if sink.send(msg).await.is_err() {
                                    break;
                                }
                            }
                        });

                        let heartbeat = {
                            let write_tx = write_tx.clone();
                            let interval = config.heartbeat_interval;
                            tokio::spawn(async move {
                                let mut tick = tokio::time::interval(interval);
                                loop {
                                    tick.tick().await;
                                    if write_tx.send(Message::Ping(Vec::new().into())).is_err() {
                                        break;
                                    }
                                }
                            })
                        };

                        (on_reconnect)().await;

                        loop {
                            tokio::select! {
                                _ = shutdown_rx.changed() => {
                                    if *shutdown_rx.borrow() {
                                        heartbeat.abort();
                                        writer_pump.abort();
                                        shared.connected.store(false, Ordering::Release);
                                        return;
                                    }
                                }
                                frame = source.next() => {
                                    match frame {
                                        Some(Ok(msg)) => handle_frame(&shared, msg).await,
                                        Some(Err(e)) => {
                                            tracing::warn!(error = %e, "websocket read error");
                                            break;
                                        }
                                        None => {
                                            tracing::warn!("websocket stream ended");
                                            break;
                                        }
                                    }
                                }
                            }
                        }

                        heartbeat.abort();
                        writer_pump.abort();
                        shared.connected.store(false, Ordering::Release);
                        fail_all_inflight(&shared, BinanceError::ConnectionLost).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "websocket connect failed");
                    }
                }

                if let Some(max) = config.reconnect.max_attempts {
                    attempts += 1;
                    if attempts >= max {
                        tracing::error!("exhausted reconnect attempts, giving up");
                        return;
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
                backoff = std::cmp::min(backoff * 2, config.reconnect.max_backoff);
            }
        });
    }

    /// Allocates a fresh request id, writes `{id, method, params}`, and
    /// parks until the matching reply arrives or `reply_timeout` elapses.
    /// Charges `REQUEST_WEIGHT` before writing. If `signed`, lazily
    /// synchronizes the clock (if it hasn't synced yet), then injects
    /// `timestamp`/`recvWindow` and a `signature` into `params` over the
    /// same canonical query string the REST transport builds.
    pub async fn send_request(&self, method: &str, params: Value, signed: bool) -> Result<Value> {
        self.limiter.charge("REQUEST_WEIGHT").await;

        let params = if signed {
            self.sign_params(params).await?
        } else {
            params
        };

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.shared.inflight.lock().await.insert(id.clone(), tx);

        let envelope = serde_json::json!({ "id": id, "method": method, "params": params });
        let frame = Message::Text(envelope.to_string().into());

        let write_tx = self.shared.write_tx.lock().await.clone();
        match write_tx {
            Some(tx) if tx.send(frame).is_ok() => {}
            _ => {
                self.shared.inflight.lock().await.remove(&id);
                return Err(BinanceError::ConnectionLost);
            }
        }

        match timeout(self.config.reply_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BinanceError::ConnectionLost), // sender dropped: reconnect abandoned us
            Err(_) => {
                self.shared.inflight.lock().await.remove(&id);
                Err(BinanceError::ConnectionLost)
            }
        }
    }

    /// Disables reconnection and closes the socket. Any parked callers are
    /// completed with `Cancelled`.
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        fail_all_inflight(&self.shared, BinanceError::Cancelled).await;
    }

    /// Injects `timestamp`/`recvWindow`, canonicalizes, signs, and places the
    /// signature back into `params`. Runs the lazy clock sync first if this
    /// is the first signed request the client has made.
    async fn sign_params(&self, params: Value) -> Result<Value> {
        if !self.clock.has_synced() {
            self.clock.sync(|| self.probe_server_time()).await;
        }

        let signer = self.signer.as_ref().ok_or_else(|| BinanceError::Generic {
            status: 0,
            code: 0,
            msg: "signed request attempted without a configured signer".to_string(),
        })?;

        let mut map: BTreeMap<String, Value> = match params {
            Value::Object(obj) => obj.into_iter().collect(),
            Value::Null => BTreeMap::new(),
            other => {
                return Err(BinanceError::Generic {
                    status: 0,
                    code: 0,
                    msg: format!("signed request params must be an object, got {other}"),
                })
            }
        };

        map.insert("timestamp".to_string(), Value::from(self.clock.now_ms()));
        map.insert("recvWindow".to_string(), Value::from(self.recv_window_ms));

        let canonical = canonical_query_string(&map);
        let signature = signer.sign(&canonical);
        map.insert("signature".to_string(), Value::from(signature));

        Ok(Value::Object(map.into_iter().collect()))
    }

    /// Round trip used only to seed the clock offset before the first signed
    /// request, via the unsigned `time` WS method.
    async fn probe_server_time(&self) -> std::result::Result<i64, BinanceError> {
        let result = self
            .send_request("time", serde_json::json!({}), false)
            .await?;
        result
            .get("serverTime")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| BinanceError::Decode {
                reason: "time reply missing serverTime".to_string(),
            })
    }
}

async fn fail_all_inflight(shared: &Shared, err_factory: BinanceError) {
    let mut inflight = shared.inflight.lock().await;
    for (_, tx) in inflight.drain() {
        let err = match &err_factory {
            BinanceError::ConnectionLost => BinanceError::ConnectionLost,
            BinanceError::Cancelled => BinanceError::Cancelled,
            _ => BinanceError::ConnectionLost,
        };
        let _ = tx.send(Err(err));
    }
}

async fn handle_frame(shared: &Shared, msg: Message) {
    match msg {
        Message::Binary(_) => {
            tracing::debug!("discarding binary frame on control channel (SBE unsupported here)");
        }
        Message::Text(text) => {
            let value: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to parse websocket text frame as JSON");
                    return;
                }
            };

            if value.get("rateLimits").is_some() {
                // Reconciliation against RateLimiter is wired by the caller
                // that owns both the limiter and this transport; exposing
                // the raw value keeps this module limiter-agnostic.
                tracing::debug!("rateLimits payload observed, caller should reconcile");
            }

            if let Some(id) = value.get("id").and_then(|v| v.as_str()) {
                let mut inflight = shared.inflight.lock().await;
                if let Some(tx) = inflight.remove(id) {
                    let result = classify_reply(&value);
                    let _ = tx.send(result);
                    return;
                }
            }

            let event = value
                .get("event")
                .cloned()
                .unwrap_or_else(|| value.clone());
            if let Some(event_type) = event.get("e").and_then(|v| v.as_str()) {
                if event_type == "eventStreamTerminated" {
                    tracing::info!("server terminated one event stream subscription");
                    return;
                }
                let handler = shared.handlers.read().await.get(event_type).cloned();
                if let Some(handler) = handler {
                    tokio::spawn(async move {
                        handler(event);
                    });
                }
            }
        }
        Message::Close(frame) => {
            tracing::info!(?frame, "websocket close frame received");
        }
        _ => {}
    }
}

fn classify_reply(value: &Value) -> Result<Value> {
    let status = value.get("status").and_then(|v| v.as_u64()).unwrap_or(200) as u16;
    if (200..=202).contains(&status) {
        return Ok(value.get("result").cloned().unwrap_or(Value::Null));
    }
    let code = value
        .pointer("/error/code")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let msg = value
        .pointer("/error/msg")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    Err(BinanceError::from_status(status, code, msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_reply_success() {
        let v = serde_json::json!({"id": "1", "status": 200, "result": {"a": 1}});
        assert!(classify_reply(&v).is_ok());
    }

    #[test]
    fn classify_reply_error() {
        let v = serde_json::json!({
            "id": "1", "status": 429,
            "error": {"code": -1003, "msg": "Too many requests"}
        });
        let err = classify_reply(&v).unwrap_err();
        assert!(matches!(err, BinanceError::RateLimit { .. }));
    }

    #[tokio::test]
    async fn sign_params_injects_timestamp_recv_window_and_signature() {
        let clock = Arc::new(Clock::new());
        clock
            .sync(|| async { Ok::<i64, std::convert::Infallible>(0) })
            .await;
        let limiter = Arc::new(RateLimiter::new(Vec::new()));
        let signer = Signer::hmac("secret-key").unwrap();
        let transport = WsTransport::new(
            WsConfig {
                url: "wss://example.invalid/ws-api/v3".to_string(),
                heartbeat_interval: Duration::from_secs(20),
                reconnect: ReconnectPolicy::default(),
                reply_timeout: Duration::from_secs(10),
            },
            clock,
            limiter,
            Some(signer),
            5_000,
        );

        let signed = transport
            .sign_params(serde_json::json!({ "symbol": "BTCUSDT" }))
            .await
            .unwrap();

        assert_eq!(signed.get("symbol").unwrap(), "BTCUSDT");
        assert_eq!(signed.get("recvWindow").unwrap(), &serde_json::json!(5_000));
        assert!(signed.get("timestamp").and_then(|v| v.as_i64()).is_some());
        let signature = signed.get("signature").and_then(|v| v.as_str()).unwrap();
        assert_eq!(signature.len(), 64); // hex-encoded HMAC-SHA256
    }

    #[tokio::test]
    async fn sign_params_without_a_configured_signer_is_an_error() {
        let clock = Arc::new(Clock::new());
        let limiter = Arc::new(RateLimiter::new(Vec::new()));
        let transport = WsTransport::new(
            WsConfig {
                url: "wss://example.invalid/ws-api/v3".to_string(),
                heartbeat_interval: Duration::from_secs(20),
                reconnect: ReconnectPolicy::default(),
                reply_timeout: Duration::from_secs(10),
            },
            clock,
            limiter,
            None,
            5_000,
        );

        let err = transport
            .sign_params(serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BinanceError::Generic { .. }));
    }

    #[tokio::test]
    async fn concurrent_requests_correlate_replies_received_out_of_order() {
        let shared = Shared {
            inflight: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            write_tx: Mutex::new(None),
            connected: AtomicBool::new(true),
        };

        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        shared.inflight.lock().await.insert("req-a".to_string(), tx_a);
        shared.inflight.lock().await.insert("req-b".to_string(), tx_b);

        let reply_b = Message::Text(
            serde_json::json!({"id": "req-b", "status": 200, "result": {"which": "B"}})
                .to_string()
                .into(),
        );
        let reply_a = Message::Text(
            serde_json::json!({"id": "req-a", "status": 200, "result": {"which": "A"}})
                .to_string()
                .into(),
        );

        handle_frame(&shared, reply_b).await;
        handle_frame(&shared, reply_a).await;

        let a = rx_a.await.unwrap().unwrap();
        let b = rx_b.await.unwrap().unwrap();
        assert_eq!(a["which"], "A");
        assert_eq!(b["which"], "B");
    }
}
