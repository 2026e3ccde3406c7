//! Read API over the approval gate
//!
//! Everything here is a side-effect-free read except `run_for_token`,
//! `start_worker` and `stop_worker`.

use super::engine::{Verdict, VerdictStatus};
use super::store::{VerdictCounts, VerdictStore};
use super::worker::{ApprovalWorker, WorkerStatus};
use super::ApprovalError;
use crate::pipeline::aggregates::AggregateStore;
use crate::pipeline::types::AggregateWindow;
use crate::pipeline::windows::WindowSize;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalStats {
    pub counts: VerdictCounts,
    /// approved / total, 0.0 when nothing has been evaluated
    pub approval_rate: f64,
    pub worker: WorkerStatus,
}

/// A finalized window together with its verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalFact {
    pub window: AggregateWindow,
    pub verdict: Verdict,
}

pub struct ApprovalApi {
    worker: Arc<ApprovalWorker>,
    aggregates: Arc<dyn AggregateStore>,
    verdicts: Arc<dyn VerdictStore>,
}

impl ApprovalApi {
    pub fn new(
        worker: Arc<ApprovalWorker>,
        aggregates: Arc<dyn AggregateStore>,
        verdicts: Arc<dyn VerdictStore>,
    ) -> Self {
        Self {
            worker,
            aggregates,
            verdicts,
        }
    }

    pub async fn stats(&self) -> Result<ApprovalStats, ApprovalError> {
        let counts = self.verdicts.counts().await?;
        let approval_rate = match counts.total() {
            0 => 0.0,
            total => counts.approved as f64 / total as f64,
        };

        Ok(ApprovalStats {
            counts,
            approval_rate,
            worker: self.worker.status(),
        })
    }

    /// Approved windows only: the data downstream consumers may trust.
    pub async fn approved_facts(
        &self,
        token_address: &str,
        size: WindowSize,
        limit: usize,
    ) -> Result<Vec<ApprovalFact>, ApprovalError> {
        self.facts(token_address, size, Some(VerdictStatus::Approved), limit).await
    }

    /// Every evaluated window, quarantined and rejected included.
    pub async fn all_facts(
        &self,
        token_address: &str,
        size: WindowSize,
        limit: usize,
    ) -> Result<Vec<ApprovalFact>, ApprovalError> {
        self.facts(token_address, size, None, limit).await
    }

    async fn facts(
        &self,
        token_address: &str,
        size: WindowSize,
        status: Option<VerdictStatus>,
        limit: usize,
    ) -> Result<Vec<ApprovalFact>, ApprovalError> {
        let token_address = token_address.to_lowercase();
        let verdicts = self.verdicts.list_verdicts(&token_address, size, status, limit).await?;

        let mut facts = Vec::with_capacity(verdicts.len());
        for verdict in verdicts {
            match self.aggregates.get_window(&token_address, size, verdict.window_start).await? {
                Some(window) => facts.push(ApprovalFact { window, verdict }),
                None => log::warn!(
                    "⚠️  Verdict without window: {} {} @{}",
                    token_address,
                    size,
                    verdict.window_start
                ),
            }
        }
        Ok(facts)
    }

    /// Evaluate everything due for one token and window size right now.
    pub async fn run_for_token(
        &self,
        token_address: &str,
        symbol: Option<&str>,
        size: WindowSize,
    ) -> Result<Vec<Verdict>, ApprovalError> {
        let token_address = token_address.to_lowercase();
        let tracked = self.worker.tokens().iter().find(|t| t.address == token_address);

        if tracked.is_none() && self.aggregates.latest_windows(&token_address, size, 1).await?.is_empty() {
            return Err(ApprovalError::UnknownToken(token_address));
        }

        let symbol = symbol.or(tracked.map(|t| t.symbol.as_str()));
        self.worker
            .process_token(&token_address, symbol, size, chrono::Utc::now().timestamp_millis())
            .await
    }

    pub async fn start_worker(&self, interval: Duration) -> bool {
        self.worker.start(interval).await
    }

    pub async fn stop_worker(&self) -> bool {
        self.worker.stop().await
    }

    pub fn worker_status(&self) -> WorkerStatus {
        self.worker.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::engine::{RuleEngine, ScoreBands};
    use crate::pipeline::db::test_support::temp_store;
    use crate::pipeline::db::SqliteStore;
    use crate::pipeline::types::TrackedToken;
    use crate::pipeline::windows::WindowBounds;
    use alloy_primitives::U256;

    const HOUR: i64 = 3_600_000;
    const TOKEN: &str = "0xabc";

    fn window(token: &str, hour: i64, events: u64) -> AggregateWindow {
        let mut w = AggregateWindow::empty(
            token,
            WindowSize::Hour1,
            WindowBounds {
                start: hour * HOUR,
                end: (hour + 1) * HOUR,
            },
        );
        w.event_count = events;
        w.inflow_amount = U256::from(events * 7 + hour as u64);
        w.unique_senders = 2;
        w.unique_receivers = 2;
        w
    }

    fn api(store: &SqliteStore) -> ApprovalApi {
        let aggregates: Arc<dyn AggregateStore> = Arc::new(store.clone());
        let verdicts: Arc<dyn VerdictStore> = Arc::new(store.clone());
        let worker = Arc::new(ApprovalWorker::new(
            aggregates.clone(),
            verdicts.clone(),
            RuleEngine::new(ScoreBands::default()),
            vec![TrackedToken::new(TOKEN, "ABC")],
            vec![WindowSize::Hour1],
        ));
        ApprovalApi::new(worker, aggregates, verdicts)
    }

    #[tokio::test]
    async fn test_facts_and_stats() {
        let (_tmp, store) = temp_store();
        for hour in [0, 1, 5] {
            store.insert_window(&window(TOKEN, hour, 20), 0).await.unwrap();
        }
        let api = api(&store);

        let stats = api.stats().await.unwrap();
        assert_eq!(stats.counts.total(), 0);
        assert_eq!(stats.approval_rate, 0.0);

        let verdicts = api.run_for_token("0xABC", None, WindowSize::Hour1).await.unwrap();
        assert_eq!(verdicts.len(), 3);
        assert_eq!(verdicts[0].token_symbol.as_deref(), Some("ABC"));

        let approved = api.approved_facts(TOKEN, WindowSize::Hour1, 10).await.unwrap();
        assert_eq!(approved.len(), 2);
        assert!(approved.iter().all(|f| f.verdict.status == VerdictStatus::Approved));
        assert_eq!(approved[0].window.window_start, HOUR);

        let all = api.all_facts(TOKEN, WindowSize::Hour1, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].verdict.status, VerdictStatus::Rejected);
        assert!(all[0].verdict.hits[0].reason.contains("gap of 3 windows"));

        let stats = api.stats().await.unwrap();
        assert_eq!(stats.counts.approved, 2);
        assert!((stats.approval_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_run_for_unknown_token() {
        let (_tmp, store) = temp_store();
        let api = api(&store);

        let err = api.run_for_token("0xdead", None, WindowSize::Hour1).await.unwrap_err();
        assert!(matches!(err, ApprovalError::UnknownToken(ref a) if a == "0xdead"));

        // Untracked but with stored windows is allowed
        store.insert_window(&window("0xdead", 0, 3), 0).await.unwrap();
        let verdicts = api.run_for_token("0xdead", Some("DEAD"), WindowSize::Hour1).await.unwrap();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].token_symbol.as_deref(), Some("DEAD"));
    }

    #[tokio::test]
    async fn test_worker_controls() {
        let (_tmp, store) = temp_store();
        let api = api(&store);

        assert!(!api.worker_status().running);
        assert!(api.start_worker(Duration::from_secs(3600)).await);
        assert_eq!(api.worker_status().interval_ms, Some(3_600_000));
        assert!(api.stop_worker().await);
        assert!(!api.worker_status().running);
    }
}
