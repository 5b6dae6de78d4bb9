//! Per-class sliding-window rate limiting with reactive backoff.
//!
//! Binance's accounting is a set of named sliding windows
//! (`REQUEST_WEIGHT`, `ORDERS`, `CONNECTIONS`, ...) that the server
//! periodically corrects, so each window tracks its own
//! VecDeque-of-timestamps and can be reconciled against a server-reported
//! count identified by `(window, max)`.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// One `(class, window, max)` limit to seed the limiter with before any
/// server feedback has arrived, taken from the client's configuration record.
#[derive(Debug, Clone)]
pub struct ClassLimit {
    pub class: String,
    pub window: Duration,
    pub max: u32,
}

/// A server-reported count for one counter, as delivered on WebSocket
/// replies or REST response headers.
#[derive(Debug, Clone)]
pub struct RateLimitReport {
    pub class: String,
    pub window: Duration,
    pub max: u32,
    pub server_count: u32,
}

struct Counter {
    class: String,
    window_ms: i64,
    max: u32,
    timestamps: VecDeque<i64>,
}

impl Counter {
    fn evict(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_ms;
        while matches!(self.timestamps.front(), Some(&t) if t <= cutoff) {
            self.timestamps.pop_front();
        }
    }
}

struct Inner {
    counters: Vec<Counter>,
    backoff_until_ms: Option<i64>,
}

/// Blocks callers approaching a tracked limit and honors a reactive backoff
/// deadline set by rate-limit errors from the transport.
pub struct RateLimiter {
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(defaults: impl IntoIterator<Item = ClassLimit>) -> Self {
        let counters = defaults
            .into_iter()
            .map(|d| Counter {
                class: d.class,
                window_ms: d.window.as_millis() as i64,
                max: d.max,
                timestamps: VecDeque::new(),
            })
            .collect();
        Self {
            inner: Mutex::new(Inner {
                counters,
                backoff_until_ms: None,
            }),
        }
    }

    /// Must be called before every network attempt in `class`. Blocks the
    /// caller until every tracked window for `class` has room and any active
    /// backoff deadline has elapsed.
    pub async fn charge(&self, class: &str) {
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                let now = now_ms();

                if let Some(deadline) = inner.backoff_until_ms {
                    if now < deadline {
                        let remaining = (deadline - now).max(0) as u64;
                        Some(remaining)
                    } else {
                        inner.backoff_until_ms = None;
                        None
                    }
                } else {
                    let mut sleep_ms = None;
                    for counter in inner.counters.iter_mut().filter(|c| c.class == class) {
                        counter.evict(now);
                        if counter.timestamps.len() as u32 >= counter.max {
                            let oldest = *counter.timestamps.front().expect("len >= max > 0");
                            let need = (oldest + counter.window_ms - now).max(0) as u64;
                            sleep_ms = Some(sleep_ms.map_or(need, |s: u64| s.max(need)));
                        }
                    }
                    if let Some(ms) = sleep_ms {
                        Some(ms)
                    } else {
                        for counter in inner.counters.iter_mut().filter(|c| c.class == class) {
                            counter.timestamps.push_back(now);
                        }
                        None
                    }
                }
            };

            match wait {
                Some(ms) => tokio::time::sleep_until(Instant::now() + Duration::from_millis(ms)).await,
                None => return,
            }
        }
    }

    /// `retry_after` below 1e9 is interpreted as seconds relative to now;
    /// otherwise as absolute Unix-milliseconds. Stores the maximum of the
    /// current deadline and the new one.
    pub async fn set_backoff(&self, retry_after: i64) {
        let now = now_ms();
        let deadline = if retry_after < 1_000_000_000 {
            now + retry_after * 1000
        } else {
            retry_after
        };
        let mut inner = self.inner.lock().await;
        inner.backoff_until_ms = Some(inner.backoff_until_ms.map_or(deadline, |d| d.max(deadline)));
    }

    /// Reconciles local counters against server-reported counts. Counters
    /// are identified by `(window, max)`, not by name, so a server reporting
    /// the same window under a different class string (e.g. `REQUESTS` vs
    /// `REQUEST_WEIGHT`) updates the existing counter instead of creating a
    /// duplicate.
    pub async fn reconcile(&self, reports: impl IntoIterator<Item = RateLimitReport>) {
        let mut inner = self.inner.lock().await;
        let now = now_ms();
        for report in reports {
            let window_ms = report.window.as_millis() as i64;
            let idx = inner
                .counters
                .iter()
                .position(|c| c.window_ms == window_ms && c.max == report.max);

            let counter = match idx {
                Some(i) => &mut inner.counters[i],
                None => {
                    inner.counters.push(Counter {
                        class: report.class.clone(),
                        window_ms,
                        max: report.max,
                        timestamps: VecDeque::new(),
                    });
                    inner.counters.last_mut().expect("just pushed")
                }
            };

            counter.max = report.max;
            counter.evict(now);

            let local_count = counter.timestamps.len() as u32;
            if report.server_count > local_count {
                for _ in 0..(report.server_count - local_count) {
                    counter.timestamps.push_back(now);
                }
            } else if report.server_count == 0 && local_count > 0 {
                counter.timestamps.clear();
            }
        }
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}
