//! Approval rules
//!
//! Each rule is a pure function of `(current, previous)` windows returning an
//! optional [`RuleHit`]. Rules never decide a verdict; they only report a
//! penalty and a human-readable reason. No clock reads, no hidden state.

use crate::pipeline::types::{amount_to_u64_saturating, AggregateWindow};
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CONTINUITY: &str = "continuity";
pub const DUPLICATION: &str = "duplication";
pub const ANOMALY_SPIKE: &str = "anomaly_spike";

pub const GAP_PENALTY: u32 = 60;
pub const DELAY_PENALTY: u32 = 15;
pub const IDENTICAL_PENALTY: u32 = 35;
pub const NEAR_IDENTICAL_PENALTY: u32 = 20;
pub const SPIKE_BASE_PENALTY: u32 = 15;
pub const SPIKE_MAX_PENALTY: u32 = 35;

/// Event or volume multiple that counts as a spike
pub const SPIKE_RATIO: f64 = 10.0;
/// Actor growth below this multiple makes a spike suspicious
pub const SPIKE_ACTOR_GROWTH: f64 = 1.5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleHit {
    pub rule: String,
    pub penalty: u32,
    pub reason: String,
}

impl RuleHit {
    fn new(rule: &str, penalty: u32, reason: String) -> Self {
        Self {
            rule: rule.to_string(),
            penalty,
            reason,
        }
    }
}

pub type Rule = fn(&AggregateWindow, Option<&AggregateWindow>) -> Option<RuleHit>;

/// Every rule, in evaluation order
pub const RULES: [(&str, Rule); 3] = [
    (CONTINUITY, continuity),
    (DUPLICATION, duplication),
    (ANOMALY_SPIKE, anomaly_spike),
];

/// Missing windows between `previous` and `current`.
///
/// The first window in a series is exempt.
pub fn continuity(current: &AggregateWindow, previous: Option<&AggregateWindow>) -> Option<RuleHit> {
    let previous = previous?;
    let duration = current.window.duration_ms();
    let gap = (current.window_start - previous.window_end).div_euclid(duration);

    match gap {
        g if g > 1 => Some(RuleHit::new(
            CONTINUITY,
            GAP_PENALTY,
            format!("gap of {} windows, expected continuous sequence", g),
        )),
        1 => Some(RuleHit::new(
            CONTINUITY,
            DELAY_PENALTY,
            "gap of 1 window, possible data delay".to_string(),
        )),
        _ => None,
    }
}

/// sha256 over `event_count|inflow|outflow|senders|receivers`, hex encoded.
pub fn metrics_hash(window: &AggregateWindow) -> String {
    let tuple = format!(
        "{}|{}|{}|{}|{}",
        window.event_count,
        window.inflow_amount,
        window.outflow_amount,
        window.unique_senders,
        window.unique_receivers
    );
    hex::encode(Sha256::digest(tuple.as_bytes()))
}

/// Identical metric tuples, or near-identical volume with a different count.
pub fn duplication(current: &AggregateWindow, previous: Option<&AggregateWindow>) -> Option<RuleHit> {
    let previous = previous?;

    if current.event_count > 0 && metrics_hash(current) == metrics_hash(previous) {
        return Some(RuleHit::new(
            DUPLICATION,
            IDENTICAL_PENALTY,
            "identical metrics, possible duplication".to_string(),
        ));
    }

    // |cur - prev| / prev < 0.1%, in integers: |cur - prev| × 1000 < prev
    let (cur, prev) = (current.inflow_amount, previous.inflow_amount);
    if prev > U256::ZERO && current.event_count != previous.event_count {
        let diff = if cur > prev { cur - prev } else { prev - cur };
        if diff.saturating_mul(U256::from(1000u64)) < prev {
            return Some(RuleHit::new(
                DUPLICATION,
                NEAR_IDENTICAL_PENALTY,
                format!(
                    "volume nearly identical but event count differs ({} vs {})",
                    current.event_count, previous.event_count
                ),
            ));
        }
    }

    None
}

/// Event or inflow volume up ≥10× without matching growth in actors.
pub fn anomaly_spike(current: &AggregateWindow, previous: Option<&AggregateWindow>) -> Option<RuleHit> {
    let previous = previous?;
    if previous.event_count == 0 {
        return None;
    }

    let event_ratio = current.event_count as f64 / previous.event_count as f64;
    let volume_ratio = if previous.inflow_amount > U256::ZERO {
        amount_to_u64_saturating(current.inflow_amount / previous.inflow_amount) as f64
    } else {
        0.0
    };
    let ratio = event_ratio.max(volume_ratio);
    if ratio < SPIKE_RATIO {
        return None;
    }

    let previous_actors = previous.actor_count();
    if previous_actors == 0 {
        return None;
    }
    let growth = current.actor_count() as f64 / previous_actors as f64;
    if growth >= SPIKE_ACTOR_GROWTH {
        return None;
    }

    let steps = (ratio / SPIKE_RATIO).floor() as u32;
    let penalty = SPIKE_BASE_PENALTY
        .saturating_add(steps.saturating_mul(5))
        .min(SPIKE_MAX_PENALTY);

    Some(RuleHit::new(
        ANOMALY_SPIKE,
        penalty,
        format!(
            "event/volume spike of {:.1}x without proportional actor growth ({:.3}x), possible manipulation",
            ratio, growth
        ),
    ))
}
