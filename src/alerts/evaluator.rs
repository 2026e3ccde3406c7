//! Turns ingestion health and provider stats into alert signals
//!
//! Pure: the same snapshot and `now_ms` always yield the same signals. Every
//! condition that is measurable and healthy emits a `Clear` so the store can
//! auto-resolve what was raised earlier.

use super::types::{AlertCategory, AlertKey, AlertSignal, Severity};
use crate::pipeline::ingestion::IngestionHealth;
use crate::rpc::pool::ProviderState;

pub const METRIC_BLOCK_LAG: &str = "block_lag";
pub const METRIC_LAST_PROGRESS: &str = "last_progress";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    /// Blocks behind head before `chain_lag` fires
    pub lag_blocks: u64,
    /// Time without cursor progress before `sync_stalled` fires
    pub stall_ms: i64,
    /// Provider error ratio before `rpc_error_rate` fires
    pub error_rate: f64,
    /// Calls a provider needs before its error rate is judged
    pub min_calls: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            lag_blocks: 50,
            stall_ms: 600_000,
            error_rate: 0.25,
            min_calls: 20,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlertEvaluator {
    thresholds: AlertThresholds,
}

impl AlertEvaluator {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> AlertThresholds {
        self.thresholds
    }

    pub fn evaluate(&self, health: &IngestionHealth, providers: &[ProviderState], now_ms: i64) -> Vec<AlertSignal> {
        let mut signals = Vec::new();
        signals.extend(self.chain_lag(health));
        signals.extend(self.sync_stalled(health, now_ms));
        signals.extend(providers.iter().filter_map(|p| self.rpc_error_rate(&health.chain, p)));
        signals
    }

    fn chain_lag(&self, health: &IngestionHealth) -> Option<AlertSignal> {
        let lag = health.block_lag()?;
        let key = AlertKey::new(AlertCategory::ChainLag, &health.chain, METRIC_BLOCK_LAG);

        if lag <= self.thresholds.lag_blocks {
            return Some(AlertSignal::Clear(key));
        }

        let severity = if lag > self.thresholds.lag_blocks.saturating_mul(4) {
            Severity::Critical
        } else {
            Severity::Warning
        };
        Some(AlertSignal::Trigger {
            key,
            severity,
            message: format!(
                "{} ingestion is {} blocks behind head (threshold {})",
                health.chain, lag, self.thresholds.lag_blocks
            ),
            value: Some(lag as f64),
        })
    }

    fn sync_stalled(&self, health: &IngestionHealth, now_ms: i64) -> Option<AlertSignal> {
        let last = health.last_progress_at?;
        let key = AlertKey::new(AlertCategory::SyncStalled, &health.chain, METRIC_LAST_PROGRESS);
        let idle_ms = now_ms - last;

        if idle_ms <= self.thresholds.stall_ms {
            return Some(AlertSignal::Clear(key));
        }

        let mut message = format!("{} ingestion has not advanced for {}s", health.chain, idle_ms / 1000);
        if let Some(err) = &health.last_error {
            message.push_str(&format!(" (last error: {})", err));
        }
        Some(AlertSignal::Trigger {
            key,
            severity: Severity::Critical,
            message,
            value: Some(idle_ms as f64),
        })
    }

    fn rpc_error_rate(&self, chain: &str, provider: &ProviderState) -> Option<AlertSignal> {
        let key = AlertKey::new(AlertCategory::RpcErrorRate, chain, &provider.name);
        if provider.total_calls < self.thresholds.min_calls {
            return None;
        }

        let rate = provider.error_rate();
        if rate <= self.thresholds.error_rate {
            return Some(AlertSignal::Clear(key));
        }

        let severity = if rate >= (self.thresholds.error_rate * 2.0).min(1.0) {
            Severity::Critical
        } else {
            Severity::Warning
        };
        Some(AlertSignal::Trigger {
            key,
            severity,
            message: format!(
                "provider {} error rate {:.1}% over {} calls (health {})",
                provider.name,
                rate * 100.0,
                provider.total_calls,
                provider.health
            ),
            value: Some(rate),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(head: u64, last: u64, progress_at: i64) -> IngestionHealth {
        IngestionHealth {
            chain: "ethereum".to_string(),
            head_block: Some(head),
            last_ingested_block: Some(last),
            last_progress_at: Some(progress_at),
            ..Default::default()
        }
    }

    fn provider(name: &str, calls: u64, errors: u64) -> ProviderState {
        ProviderState {
            name: name.to_string(),
            endpoint: format!("http://{}", name),
            health: 100,
            avg_latency_ms: 0.0,
            total_calls: calls,
            total_errors: errors,
            consecutive_errors: 0,
            last_error: None,
        }
    }

    fn triggered(signals: &[AlertSignal]) -> Vec<(String, Severity)> {
        signals
            .iter()
            .filter_map(|s| match s {
                AlertSignal::Trigger { key, severity, .. } => Some((key.fingerprint(), *severity)),
                AlertSignal::Clear(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_healthy_snapshot_clears_everything() {
        let evaluator = AlertEvaluator::default();
        let signals = evaluator.evaluate(&health(1_000, 990, 0), &[provider("primary", 100, 1)], 1_000);

        assert_eq!(signals.len(), 3);
        assert!(signals.iter().all(|s| matches!(s, AlertSignal::Clear(_))));
    }

    #[test]
    fn test_lag_severity() {
        let evaluator = AlertEvaluator::default();

        let signals = evaluator.evaluate(&health(1_000, 900, 0), &[], 0);
        assert_eq!(triggered(&signals), vec![("chain_lag:ethereum:block_lag".to_string(), Severity::Warning)]);

        let signals = evaluator.evaluate(&health(1_000, 700, 0), &[], 0);
        assert_eq!(triggered(&signals)[0].1, Severity::Critical);
    }

    #[test]
    fn test_stall_includes_last_error() {
        let evaluator = AlertEvaluator::default();
        let mut h = health(100, 100, 0);
        h.last_error = Some("all providers exhausted".to_string());

        let signals = evaluator.evaluate(&h, &[], 600_001);
        match &signals[1] {
            AlertSignal::Trigger { key, message, severity, .. } => {
                assert_eq!(key.category, AlertCategory::SyncStalled);
                assert_eq!(*severity, Severity::Critical);
                assert!(message.contains("all providers exhausted"));
            }
            other => panic!("expected trigger, got {:?}", other),
        }
    }

    #[test]
    fn test_error_rate_needs_enough_calls() {
        let evaluator = AlertEvaluator::default();
        let h = IngestionHealth {
            chain: "ethereum".to_string(),
            ..Default::default()
        };

        // Not enough calls to judge
        assert!(evaluator.evaluate(&h, &[provider("a", 10, 10)], 0).is_empty());

        let signals = evaluator.evaluate(&h, &[provider("a", 40, 12), provider("b", 40, 30)], 0);
        assert_eq!(
            triggered(&signals),
            vec![
                ("rpc_error_rate:ethereum:a".to_string(), Severity::Warning),
                ("rpc_error_rate:ethereum:b".to_string(), Severity::Critical),
            ]
        );
    }

    #[test]
    fn test_unknown_state_emits_nothing() {
        let evaluator = AlertEvaluator::default();
        let h = IngestionHealth {
            chain: "ethereum".to_string(),
            ..Default::default()
        };
        assert!(evaluator.evaluate(&h, &[], 0).is_empty());
    }
}
