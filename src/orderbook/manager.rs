//! Order-book manager: orchestrates one symbol's L2 book against a
//! REST snapshot and a continuous diff stream.
//!
//! Buffers diff events until at least three have accumulated, fetches a
//! snapshot, reconciles it against the buffer (discarding either the
//! snapshot or the stale prefix of the buffer as needed), then applies the
//! remainder and switches to direct gap-checked application.

use crate::error::{BinanceError, Result};
use crate::orderbook::types::OrderBook;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// One diff-depth event as delivered by the exchange, independent of the
/// wire encoding (JSON or SBE) it arrived in.
#[derive(Debug, Clone)]
pub struct DiffEvent {
    pub first_update_id: i64,
    pub last_update_id: i64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub timestamp_ms: i64,
}

/// A REST depth snapshot, already parsed.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub last_update_id: i64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

fn book_from_snapshot(symbol: &str, snapshot: &Snapshot) -> OrderBook {
    let mut book = OrderBook::new(symbol.to_string());
    book.last_update_id = snapshot.last_update_id;
    for (price, qty) in &snapshot.bids {
        book.update_bid(*price, *qty);
    }
    for (price, qty) in &snapshot.asks {
        book.update_ask(*price, *qty);
    }
    book
}

/// Bids before asks within one event; order on the wire is preserved within
/// a side.
fn apply_event_unchecked(book: &mut OrderBook, event: &DiffEvent) {
    for (price, qty) in &event.bids {
        book.update_bid(*price, *qty);
    }
    for (price, qty) in &event.asks {
        book.update_ask(*price, *qty);
    }
    book.last_update_id = event.last_update_id;
    book.timestamp = event.timestamp_ms;
}

enum ManagerState {
    Buffering { buffer: VecDeque<DiffEvent> },
    Initialized { book: Box<OrderBook> },
}

/// Threshold at which a buffered-but-not-yet-initializing manager attempts
/// its first snapshot fetch.
const BUFFER_TRIGGER: usize = 3;

/// Reconstructs and maintains one symbol's L2 book. `on_diff_event` is the
/// single entry point events are fed through; callers are expected to wire
/// it as the handler for the symbol's diff-depth subscription.
pub struct OrderBookManager {
    symbol: String,
    max_depth: u32,
    state: RwLock<ManagerState>,
}

impl OrderBookManager {
    pub fn new(symbol: impl Into<String>, max_depth: u32) -> Self {
        Self {
            symbol: symbol.into(),
            max_depth,
            state: RwLock::new(ManagerState::Buffering {
                buffer: VecDeque::new(),
            }),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Returns a clone of the reconstructed book, or `None` while still
    /// buffering (not yet initialized).
    pub async fn book(&self) -> Option<OrderBook> {
        match &*self.state.read().await {
            ManagerState::Initialized { book } => Some((**book).clone()),
            ManagerState::Buffering { .. } => None,
        }
    }

    /// Discards any accumulated state and returns to the buffering state.
    /// The caller is still responsible for the underlying subscription
    /// (`stop`/`start` on the WebSocket transport); this only resets the
    /// book reconstruction state machine.
    pub async fn stop(&self) {
        *self.state.write().await = ManagerState::Buffering {
            buffer: VecDeque::new(),
        };
    }

    /// Feeds one diff event through the state machine, fetching a snapshot
    /// via `fetch_snapshot` when the bootstrap buffer is full. `fetch_snapshot`
    /// failing during bootstrap is non-fatal: the buffer is cleared per the
    /// "on init failure" rule and the manager keeps buffering fresh events.
    pub async fn on_diff_event<F, Fut>(&self, event: DiffEvent, fetch_snapshot: F)
    where
        F: FnOnce(String, u32) -> Fut,
        Fut: std::future::Future<Output = Result<Snapshot>>,
    {
        let mut state = self.state.write().await;
        match &mut *state {
            ManagerState::Buffering { buffer } => {
                buffer.push_back(event);
                if buffer.len() < BUFFER_TRIGGER {
                    return;
                }
                let u0 = buffer.front().expect("len >= BUFFER_TRIGGER > 0").first_update_id;
                match fetch_snapshot(self.symbol.clone(), self.max_depth).await {
                    Ok(snapshot) => {
                        if snapshot.last_update_id < u0 {
                            tracing::debug!(
                                symbol = %self.symbol,
                                snapshot_id = snapshot.last_update_id,
                                u0,
                                "snapshot older than earliest buffered event, discarding and continuing to buffer"
                            );
                            return;
                        }
                        let s = snapshot.last_update_id;
                        while matches!(buffer.front(), Some(e) if e.last_update_id <= s) {
                            buffer.pop_front();
                        }
                        if let Some(first) = buffer.front() {
                            if !(first.first_update_id <= s && s <= first.last_update_id) {
                                tracing::warn!(
                                    symbol = %self.symbol,
                                    snapshot_id = s,
                                    "snapshot inconsistent with remaining buffered events, restarting bootstrap"
                                );
                                buffer.clear();
                                return;
                            }
                        }
                        let mut book = book_from_snapshot(&self.symbol, &snapshot);
                        for ev in buffer.drain(..) {
                            apply_event_unchecked(&mut book, &ev);
                        }
                        tracing::info!(symbol = %self.symbol, last_applied = book.last_update_id, "order book initialized");
                        *state = ManagerState::Initialized {
                            book: Box::new(book),
                        };
                    }
                    Err(err) => {
                        tracing::warn!(symbol = %self.symbol, error = %err, "snapshot fetch failed during bootstrap, clearing buffer");
                        buffer.clear();
                    }
                }
            }
            ManagerState::Initialized { book } => {
                if event.last_update_id <= book.last_update_id {
                    return;
                }
                if event.first_update_id > book.last_update_id + 1 {
                    tracing::warn!(
                        symbol = %self.symbol,
                        expected = book.last_update_id + 1,
                        got = event.first_update_id,
                        "gap detected, restarting synchronization"
                    );
                    *state = ManagerState::Buffering {
                        buffer: VecDeque::new(),
                    };
                    return;
                }
                apply_event_unchecked(book, &event);
            }
        }
    }
}

/// Error returned by callers driving a manager directly (e.g. a REST depth
/// endpoint that parses its own snapshot shape).
#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    #[error("not yet initialized")]
    NotInitialized,
    #[error(transparent)]
    Transport(#[from] BinanceError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn event(first: i64, last: i64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> DiffEvent {
        DiffEvent {
            first_update_id: first,
            last_update_id: last,
            bids: bids.iter().map(|(p, q)| (dec(p), dec(q))).collect(),
            asks: asks.iter().map(|(p, q)| (dec(p), dec(q))).collect(),
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn bootstraps_after_three_events_with_consistent_snapshot() {
        let manager = OrderBookManager::new("BTCUSDT", 100);

        manager
            .on_diff_event(event(101, 103, &[("10", "1")], &[]), |_, _| async {
                unreachable!("fewer than 3 buffered events must not fetch a snapshot")
            })
            .await;
        manager
            .on_diff_event(event(104, 106, &[("11", "1")], &[]), |_, _| async {
                unreachable!("fewer than 3 buffered events must not fetch a snapshot")
            })
            .await;
        assert!(manager.book().await.is_none());

        manager
            .on_diff_event(event(107, 109, &[("12", "1")], &[]), |_symbol, _depth| async {
                Ok(Snapshot {
                    last_update_id: 105,
                    bids: vec![(dec("9"), dec("5"))],
                    asks: vec![(dec("20"), dec("5"))],
                })
            })
            .await;

        let book = manager.book().await.expect("initialized");
        assert_eq!(book.last_update_id, 109);
        // (101,103) is covered by S=105 and dropped; (104,106) and (107,109)
        // survive and are applied on top of the snapshot.
        assert_eq!(book.bids.get(&dec("9")), Some(&dec("5")));
        assert_eq!(book.bids.get(&dec("11")), Some(&dec("1")));
        assert_eq!(book.bids.get(&dec("12")), Some(&dec("1")));
    }

    #[tokio::test]
    async fn bootstrap_discards_events_covered_by_snapshot_and_applies_the_rest() {
        let manager = OrderBookManager::new("BTCUSDT", 100);
        manager
            .on_diff_event(event(11, 15, &[("100", "9")], &[]), |_, _| async {
                unreachable!()
            })
            .await;
        manager
            .on_diff_event(event(16, 20, &[("98", "7")], &[]), |_, _| async {
                unreachable!()
            })
            .await;
        manager
            .on_diff_event(event(21, 25, &[("97", "6")], &[]), |_symbol, _depth| async {
                Ok(Snapshot {
                    last_update_id: 18,
                    bids: vec![(dec("100"), dec("1.0")), (dec("99"), dec("2.0"))],
                    asks: vec![(dec("101"), dec("3.0")), (dec("102"), dec("4.0"))],
                })
            })
            .await;

        let book = manager.book().await.expect("initialized");
        assert_eq!(book.last_update_id, 25);
        // event (11,15) is entirely covered by S=18 and dropped before the
        // consistency check; its bid change must never reach the book.
        assert_eq!(book.bids.get(&dec("100")), Some(&dec("1.0")));
        // (16,20) and (21,25) survive the drop and are applied in order.
        assert_eq!(book.bids.get(&dec("98")), Some(&dec("7")));
        assert_eq!(book.bids.get(&dec("97")), Some(&dec("6")));
    }

    #[tokio::test]
    async fn snapshot_older_than_earliest_buffered_event_keeps_buffering() {
        let manager = OrderBookManager::new("BTCUSDT", 100);
        for id in 101..=103 {
            manager
                .on_diff_event(event(id, id, &[("10", "1")], &[]), |_, _| async {
                    Ok(Snapshot {
                        last_update_id: 50, // older than U0 = 101
                        bids: vec![],
                        asks: vec![],
                    })
                })
                .await;
        }
        assert!(manager.book().await.is_none(), "must stay in Buffering");
    }

    #[tokio::test]
    async fn inconsistent_snapshot_restarts_bootstrap() {
        let manager = OrderBookManager::new("BTCUSDT", 100);
        for id in 101..=103 {
            manager
                .on_diff_event(event(id, id, &[("10", "1")], &[]), |_, _| async {
                    // S=102 but the only remaining buffered event after the
                    // drop step is [103,103], which does not satisfy U<=S<=u.
                    Ok(Snapshot {
                        last_update_id: 102,
                        bids: vec![],
                        asks: vec![],
                    })
                })
                .await;
        }
        assert!(manager.book().await.is_none());
    }

    #[tokio::test]
    async fn snapshot_fetch_failure_clears_buffer_and_keeps_buffering() {
        let manager = OrderBookManager::new("BTCUSDT", 100);
        for id in 101..=103 {
            manager
                .on_diff_event(event(id, id, &[("10", "1")], &[]), |_, _| async {
                    Err(BinanceError::ConnectionLost)
                })
                .await;
        }
        assert!(manager.book().await.is_none());
    }

    #[tokio::test]
    async fn gap_after_initialization_restarts_synchronization() {
        let manager = OrderBookManager::new("BTCUSDT", 100);
        for id in 101..=103 {
            manager
                .on_diff_event(event(id, id, &[("10", "1")], &[]), |_, _| async {
                    Ok(Snapshot {
                        last_update_id: 103,
                        bids: vec![],
                        asks: vec![],
                    })
                })
                .await;
        }
        assert!(manager.book().await.is_some());

        // last_applied is 103; a jump to [110,110] is a gap
        manager
            .on_diff_event(event(110, 110, &[("9", "1")], &[]), |_, _| async {
                unreachable!("Initialized state must not fetch a snapshot on gap")
            })
            .await;
        assert!(manager.book().await.is_none(), "gap must restart synchronization");
    }

    #[tokio::test]
    async fn outdated_event_after_initialization_is_ignored() {
        let manager = OrderBookManager::new("BTCUSDT", 100);
        for id in 101..=103 {
            manager
                .on_diff_event(event(id, id, &[("10", "1")], &[]), |_, _| async {
                    Ok(Snapshot {
                        last_update_id: 103,
                        bids: vec![],
                        asks: vec![],
                    })
                })
                .await;
        }
        let before = manager.book().await.unwrap();
        manager
            .on_diff_event(event(50, 103, &[("999", "1")], &[]), |_, _| async {
                unreachable!()
            })
            .await;
        let after = manager.book().await.unwrap();
        assert_eq!(before.last_update_id, after.last_update_id);
        assert!(!after.bids.contains_key(&dec("999")));
    }

    #[tokio::test]
    async fn price_zero_change_is_a_no_op() {
        let manager = OrderBookManager::new("BTCUSDT", 100);
        for id in 101..=103 {
            manager
                .on_diff_event(event(id, id, &[("10", "1")], &[]), |_, _| async {
                    Ok(Snapshot {
                        last_update_id: 103,
                        bids: vec![(dec("10"), dec("1"))],
                        asks: vec![],
                    })
                })
                .await;
        }
        manager
            .on_diff_event(event(104, 104, &[("0", "5")], &[]), |_, _| async {
                unreachable!()
            })
            .await;
        let book = manager.book().await.unwrap();
        assert!(!book.bids.contains_key(&Decimal::ZERO));
    }
}
