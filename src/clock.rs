//! Server clock offset tracking.
//!
//! Grounded on `BinanceClient::get_server_time` (`binance/client.rs`): the
//! probe round trip is unchanged, but the result is now published behind an
//! atomic so every signed call reads a consistent offset instead of probing
//! the server per request.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Tracks a signed millisecond offset between local wall time and the
/// exchange's server time.
///
/// `sync` is re-run at construction, after every successful WebSocket
/// reconnect, and lazily before the first signed WebSocket request. A failed
/// probe is non-fatal: the previous offset (zero if none yet) is retained.
#[derive(Debug, Default)]
pub struct Clock {
    offset_ms: AtomicI64,
    synced: std::sync::atomic::AtomicBool,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
            synced: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Local wall time plus the stored offset.
    pub fn now_ms(&self) -> i64 {
        local_ms() + self.offset_ms.load(Ordering::Acquire)
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Runs `probe_fn` (a round trip to a server-time endpoint) and publishes
    /// `offset := server_ms - local_ms_at_probe`. On failure, logs a warning
    /// and leaves the current offset untouched.
    pub async fn sync<F, Fut, E>(&self, probe_fn: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<i64, E>>,
        E: std::fmt::Display,
    {
        let local_before = local_ms();
        match probe_fn().await {
            Ok(server_ms) => {
                let offset = server_ms - local_before;
                self.offset_ms.store(offset, Ordering::Release);
                self.synced.store(true, Ordering::Release);
                tracing::debug!(offset_ms = offset, "clock synced with server");
            }
            Err(err) => {
                tracing::warn!(error = %err, "clock sync failed, retaining previous offset");
            }
        }
    }
}

fn local_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sync_publishes_offset() {
        let clock = Clock::new();
        assert!(!clock.has_synced());
        clock
            .sync(|| async { Ok::<i64, std::convert::Infallible>(local_ms() + 5_000) })
            .await;
        assert!(clock.has_synced());
        let now = clock.now_ms();
        let drift = (now - local_ms() - 5_000).abs();
        assert!(drift < 50, "drift too large: {drift}");
    }

    #[tokio::test]
    async fn failed_sync_keeps_previous_offset() {
        let clock = Clock::new();
        clock
            .sync(|| async { Ok::<i64, std::convert::Infallible>(local_ms() + 1_000) })
            .await;
        clock
            .sync(|| async { Err::<i64, _>("probe unreachable") })
            .await;
        let drift = (clock.now_ms() - local_ms() - 1_000).abs();
        assert!(drift < 50);
    }
}
