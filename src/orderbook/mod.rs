//! Local L2 order-book reconstruction and read-only query surface.
//!
//! Architecture: an `OrderBookManager` per symbol reconstructs the book from
//! a REST snapshot plus a continuous WebSocket diff stream; `types` and
//! `metrics` expose read-only queries (spread, microprice, walls,
//! VWAP-based slippage, compact L2 depth) over the same `BTreeMap` state,
//! nothing more — this is plumbing, not an analytics engine.

pub mod manager;
pub mod metrics;
pub mod types;

pub use manager::{DiffEvent, ManagerError, OrderBookManager, Snapshot};
pub use types::{
    HealthStatus, OrderBook, OrderBookDepth, OrderBookHealth, OrderBookMetrics, SlippageEstimate,
    SlippageEstimates, Wall, WallSide, Walls,
};
