//! Alert records and the signals the evaluator emits

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    ChainLag,
    SyncStalled,
    RpcErrorRate,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::ChainLag => "chain_lag",
            AlertCategory::SyncStalled => "sync_stalled",
            AlertCategory::RpcErrorRate => "rpc_error_rate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chain_lag" => Some(AlertCategory::ChainLag),
            "sync_stalled" => Some(AlertCategory::SyncStalled),
            "rpc_error_rate" => Some(AlertCategory::RpcErrorRate),
            _ => None,
        }
    }
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WARNING" => Some(Severity::Warning),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Active,
    Resolved,
    Acknowledged,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "ACTIVE",
            AlertStatus::Resolved => "RESOLVED",
            AlertStatus::Acknowledged => "ACKNOWLEDGED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(AlertStatus::Active),
            "RESOLVED" => Some(AlertStatus::Resolved),
            "ACKNOWLEDGED" => Some(AlertStatus::Acknowledged),
            _ => None,
        }
    }
}

/// What an alert is about. Two alerts with the same key are the same alert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertKey {
    pub category: AlertCategory,
    pub chain: String,
    pub metric: String,
}

impl AlertKey {
    pub fn new(category: AlertCategory, chain: &str, metric: &str) -> Self {
        Self {
            category,
            chain: chain.to_string(),
            metric: metric.to_string(),
        }
    }

    /// `category:chain:metric`
    pub fn fingerprint(&self) -> String {
        format!("{}:{}:{}", self.category, self.chain, self.metric)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertSignal {
    Trigger {
        key: AlertKey,
        severity: Severity,
        message: String,
        value: Option<f64>,
    },
    Clear(AlertKey),
}

impl AlertSignal {
    pub fn key(&self) -> &AlertKey {
        match self {
            AlertSignal::Trigger { key, .. } => key,
            AlertSignal::Clear(key) => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAlert {
    pub alert_id: String,
    pub category: AlertCategory,
    pub chain: String,
    pub metric: String,
    pub fingerprint: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub message: String,
    pub value: Option<f64>,
    pub occurrence_count: u64,
    pub first_occurrence_at: i64,
    pub last_occurrence_at: i64,
    pub resolved_at: Option<i64>,
    pub acknowledged_at: Option<i64>,
}
