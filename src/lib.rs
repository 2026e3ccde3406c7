//! flowgate: ERC-20 transfer ingestion with an approval gate
//!
//! Transfers are pulled from JSON-RPC providers, rolled up into fixed UTC
//! windows per token and judged by a rule engine before anything downstream
//! may trust them. Operational health is surfaced as deduplicated alerts.

pub mod alerts;
pub mod approval;
pub mod config;
pub mod pipeline;
pub mod rpc;
