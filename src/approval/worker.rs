//! Approval worker
//!
//! Walks every finalized window past the per-(token, window size) cursor in
//! order, evaluates it against its immediate predecessor, stores the verdict
//! and advances the cursor.
//!
//! Concurrency:
//! - distinct (token, size) pairs run in parallel on a `JoinSet`
//! - one async mutex per pair serializes a scheduled run and a manual
//!   `process_token` on the same pair, so previous/current ordering holds
//! - the background driver is a tokio task stopped through a `watch` channel

use super::engine::{RuleEngine, Verdict, VerdictStatus};
use super::store::VerdictStore;
use super::ApprovalError;
use crate::pipeline::aggregates::AggregateStore;
use crate::pipeline::types::TrackedToken;
use crate::pipeline::windows::WindowSize;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Windows fetched per store round trip
const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub pairs: u32,
    pub evaluated: u32,
    pub approved: u32,
    pub quarantined: u32,
    pub rejected: u32,
    pub errors: u32,
    pub started_at: i64,
}

impl RunSummary {
    fn record(&mut self, verdicts: &[Verdict]) {
        for verdict in verdicts {
            self.evaluated += 1;
            match verdict.status {
                VerdictStatus::Approved => self.approved += 1,
                VerdictStatus::Quarantined => self.quarantined += 1,
                VerdictStatus::Rejected => self.rejected += 1,
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub interval_ms: Option<u64>,
    pub runs_completed: u64,
    pub last_run: Option<RunSummary>,
    pub last_error: Option<String>,
}

type PairKey = (String, WindowSize);

pub struct ApprovalWorker {
    aggregates: Arc<dyn AggregateStore>,
    verdicts: Arc<dyn VerdictStore>,
    engine: RuleEngine,
    tokens: Vec<TrackedToken>,
    sizes: Vec<WindowSize>,
    batch_size: usize,
    pair_locks: Mutex<HashMap<PairKey, Arc<tokio::sync::Mutex<()>>>>,
    status: Mutex<WorkerStatus>,
    driver: tokio::sync::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl ApprovalWorker {
    pub fn new(
        aggregates: Arc<dyn AggregateStore>,
        verdicts: Arc<dyn VerdictStore>,
        engine: RuleEngine,
        tokens: Vec<TrackedToken>,
        sizes: Vec<WindowSize>,
    ) -> Self {
        Self {
            aggregates,
            verdicts,
            engine,
            tokens,
            sizes,
            batch_size: DEFAULT_BATCH_SIZE,
            pair_locks: Mutex::new(HashMap::new()),
            status: Mutex::new(WorkerStatus::default()),
            driver: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn tokens(&self) -> &[TrackedToken] {
        &self.tokens
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update_status(&self, f: impl FnOnce(&mut WorkerStatus)) {
        f(&mut self.status.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn pair_lock(&self, token_address: &str, size: WindowSize) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.pair_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry((token_address.to_string(), size))
            .or_default()
            .clone()
    }

    /// Evaluate every window of one (token, size) pair that is past its cursor.
    pub async fn process_token(
        &self,
        token_address: &str,
        symbol: Option<&str>,
        size: WindowSize,
        now_ms: i64,
    ) -> Result<Vec<Verdict>, ApprovalError> {
        let lock = self.pair_lock(token_address, size);
        let _pair = lock.lock().await;

        let mut cursor = self.verdicts.approval_cursor(token_address, size).await?;
        let mut previous = match cursor {
            Some(start) => self.aggregates.window_before(token_address, size, start + 1).await?,
            None => None,
        };

        let mut verdicts = Vec::new();
        loop {
            let pending = self
                .aggregates
                .windows_after(token_address, size, cursor, self.batch_size)
                .await?;
            let exhausted = pending.len() < self.batch_size;

            for window in pending {
                let evaluation = self.engine.evaluate(&window, previous.as_ref());
                let verdict = Verdict::new(&window, symbol, evaluation, now_ms);

                self.verdicts.save_verdict(&verdict).await?;
                self.verdicts
                    .set_approval_cursor(token_address, size, window.window_start, now_ms)
                    .await?;

                if verdict.status == VerdictStatus::Approved {
                    log::debug!("✅ {} {} @{}: {}", token_address, size, window.window_start, verdict.score);
                } else {
                    let reasons: Vec<&str> = verdict.hits.iter().map(|h| h.reason.as_str()).collect();
                    log::info!(
                        "🚩 {} {} @{}: {} (score {}) {}",
                        symbol.unwrap_or(token_address),
                        size,
                        window.window_start,
                        verdict.status,
                        verdict.score,
                        reasons.join("; ")
                    );
                }

                cursor = Some(window.window_start);
                previous = Some(window);
                verdicts.push(verdict);
            }

            if exhausted {
                break;
            }
        }

        Ok(verdicts)
    }

    /// One pass over every tracked token × window size.
    pub async fn run_once(self: &Arc<Self>, now_ms: i64) -> RunSummary {
        let mut summary = RunSummary {
            started_at: now_ms,
            ..Default::default()
        };
        let mut tasks = JoinSet::new();

        for token in &self.tokens {
            for size in &self.sizes {
                let worker = Arc::clone(self);
                let token = token.clone();
                let size = *size;
                tasks.spawn(async move {
                    let result = worker
                        .process_token(&token.address, Some(&token.symbol), size, now_ms)
                        .await;
                    (token.symbol, size, result)
                });
                summary.pairs += 1;
            }
        }

        let mut last_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, _, Ok(verdicts))) => summary.record(&verdicts),
                Ok((symbol, size, Err(e))) => {
                    log::error!("❌ Approval failed for {} {}: {}", symbol, size, e);
                    summary.errors += 1;
                    last_error = Some(e.to_string());
                }
                Err(e) => {
                    log::error!("❌ Approval task panicked: {}", e);
                    summary.errors += 1;
                    last_error = Some(e.to_string());
                }
            }
        }

        if summary.evaluated > 0 || summary.errors > 0 {
            log::info!(
                "📊 Approval run: {} evaluated ({} approved, {} quarantined, {} rejected), {} error(s)",
                summary.evaluated,
                summary.approved,
                summary.quarantined,
                summary.rejected,
                summary.errors
            );
        }

        let finished = summary.clone();
        self.update_status(|s| {
            s.runs_completed += 1;
            s.last_run = Some(finished);
            if last_error.is_some() {
                s.last_error = last_error;
            }
        });

        summary
    }

    /// Start the background driver. `false` if it is already running.
    pub async fn start(self: &Arc<Self>, interval: Duration) -> bool {
        let mut driver = self.driver.lock().await;
        if driver.is_some() {
            return false;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        worker.run_once(chrono::Utc::now().timestamp_millis()).await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            log::info!("⏹️  Approval worker stopped");
        });

        *driver = Some((stop_tx, handle));
        self.update_status(|s| {
            s.running = true;
            s.interval_ms = Some(interval.as_millis() as u64);
        });
        log::info!("▶️  Approval worker started (every {}ms)", interval.as_millis());
        true
    }

    /// Stop the background driver after its current run. `false` if not running.
    pub async fn stop(&self) -> bool {
        let Some((stop_tx, handle)) = self.driver.lock().await.take() else {
            return false;
        };

        // Receiver gone means the task already exited
        let _ = stop_tx.send(true);
        if let Err(e) = handle.await {
            log::warn!("⚠️  Approval worker task ended abnormally: {}", e);
        }

        self.update_status(|s| {
            s.running = false;
            s.interval_ms = None;
        });
        true
    }
}
