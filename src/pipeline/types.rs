//! Core data structures shared by ingestion, roll-up and approval

use super::windows::{WindowBounds, WindowSize};
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

/// Token tracked on a chain, as configured by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedToken {
    /// Lower-case 0x-prefixed contract address
    pub address: String,
    pub symbol: String,
}

impl TrackedToken {
    pub fn new(address: &str, symbol: &str) -> Self {
        Self {
            address: address.to_lowercase(),
            symbol: symbol.to_string(),
        }
    }
}

/// Direction of a transfer relative to the watched address set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowDirection {
    In,
    Out,
    None,
}

impl FlowDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowDirection::In => "IN",
            FlowDirection::Out => "OUT",
            FlowDirection::None => "NONE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IN" => Some(FlowDirection::In),
            "OUT" => Some(FlowDirection::Out),
            "NONE" => Some(FlowDirection::None),
            _ => None,
        }
    }
}

/// Decoded ERC-20 Transfer log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub chain: String,
    pub token_address: String,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    /// Block timestamp, epoch milliseconds
    pub block_timestamp: i64,
    pub sender: String,
    pub receiver: String,
    #[serde(with = "decimal_u256")]
    pub amount: U256,
    pub direction: FlowDirection,
}

/// Finalized per-token rollup of one fixed window.
///
/// Amounts are uint256 arithmetic, never floating point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateWindow {
    pub token_address: String,
    pub window: WindowSize,
    pub window_start: i64,
    pub window_end: i64,
    pub event_count: u64,
    #[serde(with = "decimal_u256")]
    pub inflow_amount: U256,
    #[serde(with = "decimal_u256")]
    pub outflow_amount: U256,
    pub unique_senders: u64,
    pub unique_receivers: u64,
}

impl AggregateWindow {
    pub fn empty(token_address: &str, window: WindowSize, bounds: WindowBounds) -> Self {
        Self {
            token_address: token_address.to_string(),
            window,
            window_start: bounds.start,
            window_end: bounds.end,
            event_count: 0,
            inflow_amount: U256::ZERO,
            outflow_amount: U256::ZERO,
            unique_senders: 0,
            unique_receivers: 0,
        }
    }

    pub fn bounds(&self) -> WindowBounds {
        WindowBounds {
            start: self.window_start,
            end: self.window_end,
        }
    }

    /// Combined sender + receiver count
    pub fn actor_count(&self) -> u64 {
        self.unique_senders + self.unique_receivers
    }
}

/// Parse a decimal uint256 string as stored in SQLite and the read API.
pub fn parse_amount(s: &str) -> Option<U256> {
    U256::from_str_radix(s.trim(), 10).ok()
}

/// Lossy conversion for ratio arithmetic; saturates at `u64::MAX`.
pub fn amount_to_u64_saturating(value: U256) -> u64 {
    if value > U256::from(u64::MAX) {
        u64::MAX
    } else {
        value.as_limbs()[0]
    }
}

/// uint256 amounts travel as decimal strings (the `U256` default is hex).
pub mod decimal_u256 {
    use alloy_primitives::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_amount(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid decimal amount: {}", raw)))
    }
}
