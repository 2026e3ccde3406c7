//! # Transfer ingestion and window pipeline
//!
//! Data flow:
//!
//! ```text
//! provider pool ──eth_getLogs──▶ ingestion ──▶ transfer_events
//!                                   │                │
//!                             replay guard      roll-up (closed windows only)
//!                                                    │
//!                                             aggregate_windows ──▶ approval
//! ```
//!
//! - `windows`: pure window math, time is always a parameter
//! - `replay_guard`: exactly-once claiming of block ranges, failed-range queue
//! - `aggregates`: finalized per-token windows
//! - `ingestion`: RPC → decoded events, bisecting oversized ranges
//! - `db`: the SQLite store all of the above share

pub mod aggregates;
pub mod cache;
pub mod db;
pub mod ingestion;
pub mod replay_guard;
pub mod types;
pub mod windows;

pub use db::{SqliteStore, StoreError};
pub use types::{AggregateWindow, FlowDirection, TrackedToken, TransferEvent};
pub use windows::{WindowBounds, WindowSize};
