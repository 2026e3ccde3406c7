//! Combines rule hits into a trust score and verdict
//!
//! Score = 100 − Σ penalties, floored at 0. Bands are configuration:
//!
//! | score            | verdict      |
//! |------------------|--------------|
//! | ≥ approved_min   | APPROVED     |
//! | ≥ quarantine_min | QUARANTINED  |
//! | otherwise        | REJECTED     |
//!
//! Every rule runs on every window so the stored verdict carries all reasons.

use super::rules::{metrics_hash, RuleHit, RULES};
use crate::pipeline::types::AggregateWindow;
use crate::pipeline::windows::WindowSize;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_SCORE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Approved,
    Quarantined,
    Rejected,
}

impl VerdictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictStatus::Approved => "APPROVED",
            VerdictStatus::Quarantined => "QUARANTINED",
            VerdictStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPROVED" => Some(VerdictStatus::Approved),
            "QUARANTINED" => Some(VerdictStatus::Quarantined),
            "REJECTED" => Some(VerdictStatus::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreBands {
    pub approved_min: u32,
    pub quarantine_min: u32,
}

impl Default for ScoreBands {
    fn default() -> Self {
        Self {
            approved_min: 70,
            quarantine_min: 41,
        }
    }
}

impl ScoreBands {
    pub fn classify(&self, score: u32) -> VerdictStatus {
        if score >= self.approved_min {
            VerdictStatus::Approved
        } else if score >= self.quarantine_min {
            VerdictStatus::Quarantined
        } else {
            VerdictStatus::Rejected
        }
    }
}

/// Outcome of evaluating one window against its predecessor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub status: VerdictStatus,
    pub score: u32,
    pub hits: Vec<RuleHit>,
    pub metrics_hash: String,
}

/// Persisted trust verdict for one aggregate window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub token_address: String,
    pub token_symbol: Option<String>,
    pub window: WindowSize,
    pub window_start: i64,
    pub status: VerdictStatus,
    pub score: u32,
    pub hits: Vec<RuleHit>,
    pub metrics_hash: String,
    pub evaluated_at: i64,
}

impl Verdict {
    pub fn new(window: &AggregateWindow, symbol: Option<&str>, evaluation: Evaluation, evaluated_at: i64) -> Self {
        Self {
            token_address: window.token_address.clone(),
            token_symbol: symbol.map(str::to_string),
            window: window.window,
            window_start: window.window_start,
            status: evaluation.status,
            score: evaluation.score,
            hits: evaluation.hits,
            metrics_hash: evaluation.metrics_hash,
            evaluated_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    bands: ScoreBands,
}

impl RuleEngine {
    pub fn new(bands: ScoreBands) -> Self {
        Self { bands }
    }

    pub fn bands(&self) -> ScoreBands {
        self.bands
    }

    pub fn evaluate(&self, current: &AggregateWindow, previous: Option<&AggregateWindow>) -> Evaluation {
        let hits: Vec<RuleHit> = RULES
            .iter()
            .filter_map(|(_, rule)| rule(current, previous))
            .collect();

        let penalty: u32 = hits.iter().map(|h| h.penalty).sum();
        let score = MAX_SCORE.saturating_sub(penalty);

        Evaluation {
            status: self.bands.classify(score),
            score,
            hits,
            metrics_hash: metrics_hash(current),
        }
    }
}
