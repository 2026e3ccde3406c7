//! Wire types for the handful of eth_* methods the pipeline uses

use super::errors::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub addresses: Vec<String>,
    pub topic0: Option<String>,
    pub from_block: u64,
    pub to_block: u64,
}

impl LogFilter {
    pub fn to_params(&self) -> Value {
        let mut filter = json!({
            "fromBlock": to_hex(self.from_block),
            "toBlock": to_hex(self.to_block),
            "address": self.addresses,
        });
        if let Some(topic) = &self.topic0 {
            filter["topics"] = json!([topic]);
        }
        json!([filter])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: u64,
    pub transaction_hash: String,
    pub log_index: u64,
    pub removed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    data: String,
    block_number: Option<String>,
    transaction_hash: Option<String>,
    log_index: Option<String>,
    #[serde(default)]
    removed: bool,
}

impl TryFrom<RawLog> for RpcLog {
    type Error = RpcError;

    fn try_from(raw: RawLog) -> Result<Self, Self::Error> {
        let missing = |field: &str| RpcError::InvalidResponse(format!("log without {}", field));
        Ok(RpcLog {
            address: raw.address.to_lowercase(),
            topics: raw.topics.into_iter().map(|t| t.to_lowercase()).collect(),
            data: raw.data,
            block_number: parse_hex_u64(raw.block_number.as_deref().ok_or_else(|| missing("blockNumber"))?)?,
            transaction_hash: raw
                .transaction_hash
                .ok_or_else(|| missing("transactionHash"))?
                .to_lowercase(),
            log_index: parse_hex_u64(raw.log_index.as_deref().ok_or_else(|| missing("logIndex"))?)?,
            removed: raw.removed,
        })
    }
}

pub fn parse_logs(value: Value) -> Result<Vec<RpcLog>, RpcError> {
    let raw: Vec<RawLog> = serde_json::from_value(value)
        .map_err(|e| RpcError::InvalidResponse(format!("malformed logs: {}", e)))?;
    raw.into_iter().map(RpcLog::try_from).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcBlock {
    pub number: u64,
    pub hash: String,
    /// Seconds since the epoch, as reported by the node
    pub timestamp: u64,
}

pub fn parse_block(value: Value) -> Result<Option<RpcBlock>, RpcError> {
    if value.is_null() {
        return Ok(None);
    }
    let field = |name: &str| {
        value
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::InvalidResponse(format!("block without {}", name)))
    };
    Ok(Some(RpcBlock {
        number: parse_hex_u64(field("number")?)?,
        hash: field("hash")?.to_lowercase(),
        timestamp: parse_hex_u64(field("timestamp")?)?,
    }))
}

pub fn to_hex(n: u64) -> String {
    format!("{:#x}", n)
}

pub fn parse_hex_u64(s: &str) -> Result<u64, RpcError> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|_| RpcError::InvalidResponse(format!("not a hex quantity: {}", s)))
}
