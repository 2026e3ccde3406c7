//! Ingestion path: block ranges → Transfer logs → stored events → windows
//!
//! Every range goes through the replay guard before any RPC call is made:
//! - claimed ranges are fetched, decoded and stored, then marked `DONE`
//! - a "too many results" answer marks the range `PARTIAL` and both halves are
//!   claimed as new ranges (down to a single block)
//! - any other failure marks it `FAILED` and queues it for backoff retries
//!
//! `poll` walks the chain from its cursor to the confirmation-buffered head and
//! then rolls up the windows that are closed for every tracked token.

use super::aggregates::AggregateStore;
use super::cache::TtlCache;
use super::db::{SqliteStore, StoreError};
use super::replay_guard::{ClaimOutcome, RangeKey, RangeStatus, ReplayGuard};
use super::types::{FlowDirection, TrackedToken, TransferEvent};
use super::windows::{self, WindowSize};
use crate::rpc::errors::RpcError;
use crate::rpc::pool::ProviderPool;
use crate::rpc::types::{LogFilter, RpcLog, TRANSFER_TOPIC};
use alloy_primitives::U256;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("range {0} still exceeds the provider result limit at single-block width")]
    RangeTooNarrow(RangeKey),
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub chain: String,
    pub worker_id: String,
    pub confirmations: u64,
    pub block_time_ms: u64,
    /// Widest range claimed in one go
    pub max_block_span: u64,
    /// Where to begin when the chain has no cursor yet; defaults to one span below the safe head
    pub start_block: Option<u64>,
    pub stale_claim_ms: i64,
    pub head_cache_ttl_ms: i64,
    /// Ranges claimed per poll, bounds how long one poll can run
    pub max_ranges_per_poll: usize,
    pub retry_batch: usize,
    pub window_sizes: Vec<WindowSize>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chain: "ethereum".to_string(),
            worker_id: format!("ingest-{}", std::process::id()),
            confirmations: 12,
            block_time_ms: 12_000,
            max_block_span: 2_000,
            start_block: None,
            stale_claim_ms: 900_000,
            head_cache_ttl_ms: 6_000,
            max_ranges_per_poll: 50,
            retry_batch: 10,
            window_sizes: WindowSize::all().to_vec(),
        }
    }
}

/// Tallies for one `ingest_range` / `poll` / `retry_failed` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub ranges_done: u32,
    pub ranges_split: u32,
    pub ranges_failed: u32,
    pub ranges_skipped: u32,
    pub events_found: u64,
    pub events_ingested: u64,
    pub windows_rolled: u32,
}

impl IngestReport {
    fn merge(&mut self, other: &IngestReport) {
        self.ranges_done += other.ranges_done;
        self.ranges_split += other.ranges_split;
        self.ranges_failed += other.ranges_failed;
        self.ranges_skipped += other.ranges_skipped;
        self.events_found += other.events_found;
        self.events_ingested += other.events_ingested;
        self.windows_rolled += other.windows_rolled;
    }
}

/// What the alert layer needs to know about ingestion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestionHealth {
    pub chain: String,
    pub head_block: Option<u64>,
    pub last_ingested_block: Option<u64>,
    pub last_progress_at: Option<i64>,
    pub last_error: Option<String>,
    pub ranges_failed_total: u64,
    pub head_cache_hits: u64,
    pub head_cache_misses: u64,
}

impl IngestionHealth {
    pub fn block_lag(&self) -> Option<u64> {
        match (self.head_block, self.last_ingested_block) {
            (Some(head), Some(last)) => Some(head.saturating_sub(last)),
            _ => None,
        }
    }
}

pub struct Ingestor {
    pool: Arc<ProviderPool>,
    guard: Arc<dyn ReplayGuard>,
    aggregates: Arc<dyn AggregateStore>,
    events: SqliteStore,
    tokens: Vec<TrackedToken>,
    watch: HashSet<String>,
    config: IngestConfig,
    head_cache: TtlCache<u64>,
    health: Mutex<IngestionHealth>,
}

impl Ingestor {
    pub fn new(
        pool: Arc<ProviderPool>,
        store: SqliteStore,
        tokens: Vec<TrackedToken>,
        watch_addresses: &[String],
        config: IngestConfig,
    ) -> Self {
        let health = IngestionHealth {
            chain: config.chain.clone(),
            ..Default::default()
        };
        Self {
            pool,
            guard: Arc::new(store.clone()),
            aggregates: Arc::new(store.clone()),
            events: store,
            tokens,
            watch: watch_addresses.iter().map(|a| a.to_lowercase()).collect(),
            head_cache: TtlCache::new(config.head_cache_ttl_ms),
            config,
            health: Mutex::new(health),
        }
    }

    pub fn chain(&self) -> &str {
        &self.config.chain
    }

    pub fn health(&self) -> IngestionHealth {
        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner).clone();
        (health.head_cache_hits, health.head_cache_misses) = self.head_cache.stats();
        health
    }

    fn update_health(&self, f: impl FnOnce(&mut IngestionHealth)) {
        f(&mut self.health.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Direction relative to the watched set. With nothing watched, every
    /// transfer is gross inflow except burns, which are outflow.
    pub fn flow_direction(&self, sender: &str, receiver: &str) -> FlowDirection {
        if self.watch.is_empty() {
            if receiver == ZERO_ADDRESS {
                FlowDirection::Out
            } else {
                FlowDirection::In
            }
        } else if self.watch.contains(receiver) {
            FlowDirection::In
        } else if self.watch.contains(sender) {
            FlowDirection::Out
        } else {
            FlowDirection::None
        }
    }

    /// Ingest `range` exactly once, splitting it while the provider says it
    /// is too large. Store failures abort; RPC failures are recorded on the
    /// guard and reported.
    pub async fn ingest_range(&self, range: RangeKey, now_ms: i64) -> Result<IngestReport, IngestError> {
        let mut report = IngestReport::default();
        let mut pending = vec![range];

        while let Some(range) = pending.pop() {
            let claim = self
                .guard
                .claim(&range, &self.config.worker_id, now_ms, self.config.stale_claim_ms)
                .await?;

            match claim {
                ClaimOutcome::Claimed { .. } => {}
                ClaimOutcome::Partial => {
                    if let Some((left, right)) = range.bisect() {
                        pending.push(right);
                        pending.push(left);
                    }
                    continue;
                }
                ClaimOutcome::AlreadyDone | ClaimOutcome::InProgress => {
                    log::debug!("⏭️  Skipping {} ({:?})", range, claim);
                    report.ranges_skipped += 1;
                    continue;
                }
            }

            match self.fetch_range(&range).await {
                Ok((found, events)) => {
                    let ingested = self.events.insert_transfer_events(&events)? as u64;
                    report.events_found += found;
                    report.events_ingested += ingested;
                    if self.guard.complete(&range, found, ingested, now_ms).await? {
                        log::debug!("✅ {}: {} logs, {} new events", range, found, ingested);
                        report.ranges_done += 1;
                    } else {
                        // Claim was swept meanwhile; the retry queue owns the range now
                        report.ranges_skipped += 1;
                    }
                }
                Err(IngestError::Rpc(e)) if e.is_too_many_results() => match range.bisect() {
                    Some((left, right)) => {
                        log::info!("✂️  {} too large ({}), splitting", range, e);
                        self.guard.mark_partial(&range, &e.to_string(), now_ms).await?;
                        report.ranges_split += 1;
                        pending.push(right);
                        pending.push(left);
                    }
                    None => {
                        let reason = IngestError::RangeTooNarrow(range.clone()).to_string();
                        self.record_failure(&range, &reason, now_ms).await?;
                        report.ranges_failed += 1;
                    }
                },
                Err(IngestError::Store(e)) => return Err(IngestError::Store(e)),
                Err(e) => {
                    self.record_failure(&range, &e.to_string(), now_ms).await?;
                    report.ranges_failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn record_failure(&self, range: &RangeKey, reason: &str, now_ms: i64) -> Result<(), IngestError> {
        self.guard.fail(range, reason, now_ms).await?;
        self.update_health(|h| {
            h.last_error = Some(reason.to_string());
            h.ranges_failed_total += 1;
        });
        Ok(())
    }

    /// Logs for every tracked token in `range`, decoded; also returns the raw
    /// log count.
    async fn fetch_range(&self, range: &RangeKey) -> Result<(u64, Vec<TransferEvent>), IngestError> {
        let filter = LogFilter {
            addresses: self.tokens.iter().map(|t| t.address.clone()).collect(),
            topic0: Some(TRANSFER_TOPIC.to_string()),
            from_block: range.from_block,
            to_block: range.to_block,
        };

        let logs: Vec<RpcLog> = self
            .pool
            .get_logs(&filter)
            .await?
            .into_iter()
            .filter(|log| !log.removed)
            .collect();

        let mut timestamps: HashMap<u64, i64> = HashMap::new();
        let mut events = Vec::with_capacity(logs.len());

        for log in &logs {
            let Some((sender, receiver, amount)) = decode_transfer(log) else {
                log::debug!("Skipping non-ERC-20 Transfer log {}:{}", log.transaction_hash, log.log_index);
                continue;
            };

            let block_timestamp = match timestamps.get(&log.block_number) {
                Some(ts) => *ts,
                None => {
                    let ts = self.block_timestamp_ms(log.block_number).await?;
                    timestamps.insert(log.block_number, ts);
                    ts
                }
            };

            events.push(TransferEvent {
                chain: range.chain.clone(),
                token_address: log.address.clone(),
                tx_hash: log.transaction_hash.clone(),
                log_index: log.log_index,
                block_number: log.block_number,
                block_timestamp,
                direction: self.flow_direction(&sender, &receiver),
                sender,
                receiver,
                amount,
            });
        }

        Ok((logs.len() as u64, events))
    }

    async fn block_timestamp_ms(&self, number: u64) -> Result<i64, IngestError> {
        match self.pool.get_block(number).await? {
            Some(block) => Ok(block.timestamp as i64 * 1000),
            None => {
                // Provider is behind the head we cached; re-read it next time
                self.head_cache.invalidate();
                Err(RpcError::InvalidResponse(format!("block {} not found", number)).into())
            }
        }
    }

    /// Anchor every token's first roll-up at the first window that begins at
    /// or after `start_block`.
    async fn anchor_windows(&self, start_block: u64, now_ms: i64) -> Result<(), IngestError> {
        let data_start = self.block_timestamp_ms(start_block).await?;
        for token in &self.tokens {
            for size in &self.config.window_sizes {
                self.aggregates.anchor_roll_up(&token.address, *size, data_start, now_ms).await?;
            }
        }
        log::info!("⚓ {} ingestion starts at block {} ({})", self.config.chain, start_block, data_start);
        Ok(())
    }

    async fn chain_head(&self, now_ms: i64) -> Result<u64, IngestError> {
        if let Some(head) = self.head_cache.get(now_ms) {
            return Ok(head);
        }
        let head = self.pool.get_block_number().await?;
        self.head_cache.put(head, now_ms);
        Ok(head)
    }

    /// One ingestion cycle: sweep stale claims, walk the chain up to the safe
    /// head, then finalize closed windows.
    pub async fn poll(&self, now_ms: i64) -> Result<IngestReport, IngestError> {
        let chain = self.config.chain.clone();
        self.guard
            .sweep_stale(&chain, self.config.stale_claim_ms, now_ms)
            .await?;

        let head = match self.chain_head(now_ms).await {
            Ok(head) => head,
            Err(e) => {
                self.update_health(|h| h.last_error = Some(e.to_string()));
                return Err(e);
            }
        };
        let safe_block = head.saturating_sub(self.config.confirmations);
        self.update_health(|h| h.head_block = Some(head));

        let span = self.config.max_block_span.max(1);
        let mut next = match self.events.chain_cursor(&chain)? {
            Some(cursor) => {
                self.update_health(|h| {
                    h.last_ingested_block = Some(cursor.last_block);
                    h.last_progress_at.get_or_insert(cursor.last_progress_at);
                });
                cursor.last_block + 1
            }
            None => {
                let start = self
                    .config
                    .start_block
                    .unwrap_or_else(|| safe_block.saturating_sub(span - 1));
                if start <= safe_block {
                    if let Err(e) = self.anchor_windows(start, now_ms).await {
                        self.update_health(|h| h.last_error = Some(e.to_string()));
                        return Err(e);
                    }
                }
                start
            }
        };
        // Nothing ingested yet: stalls count from the first poll
        self.update_health(|h| {
            h.last_progress_at.get_or_insert(now_ms);
        });

        let mut report = IngestReport::default();
        let mut claimed = 0;

        while next <= safe_block && claimed < self.config.max_ranges_per_poll {
            // Re-use a range an interrupted poll claimed before its cursor moved
            let to = match self.guard.widest_range_from(&chain, next).await? {
                Some(existing) if existing.to_block <= safe_block => existing.to_block,
                _ => next.saturating_add(span - 1).min(safe_block),
            };
            let range_report = self.ingest_range(RangeKey::new(&chain, next, to), now_ms).await?;
            report.merge(&range_report);

            // Failed ranges live on in the retry queue; the cursor moves past
            // them but only stored data counts as progress
            let progress_at = if range_report.ranges_done > 0 {
                now_ms
            } else {
                self.health().last_progress_at.unwrap_or(now_ms)
            };
            self.events.advance_chain_cursor(&chain, to, progress_at)?;
            self.update_health(|h| {
                h.last_ingested_block = Some(to);
                h.last_progress_at = Some(progress_at);
            });

            next = to + 1;
            claimed += 1;
        }

        report.windows_rolled += self.roll_up_windows(now_ms).await?;

        if report.ranges_done + report.ranges_failed > 0 {
            log::info!(
                "⛓️  {} poll: head {} (safe {}), {} range(s) done, {} failed, {} split, {} new events, {} window(s)",
                chain,
                head,
                safe_block,
                report.ranges_done,
                report.ranges_failed,
                report.ranges_split,
                report.events_ingested,
                report.windows_rolled
            );
        }

        Ok(report)
    }

    /// Roll up windows that are closed both in wall time and in ingested data.
    ///
    /// Data coverage ends at the block before the oldest range that is still
    /// open (failed or in flight), or at the chain cursor.
    async fn roll_up_windows(&self, now_ms: i64) -> Result<u32, IngestError> {
        let Some(cursor) = self.events.chain_cursor(&self.config.chain)? else {
            return Ok(0);
        };

        let covered_block = match self.guard.lowest_open_block(&self.config.chain).await? {
            // Nothing before block 0 can be covered
            Some(0) => return Ok(0),
            Some(open) if open <= cursor.last_block => open - 1,
            _ => cursor.last_block,
        };

        let covered_until = match self.block_timestamp_ms(covered_block).await {
            Ok(ts) => ts,
            Err(e) => {
                log::warn!("⚠️  Could not read timestamp of block {}: {}", covered_block, e);
                return Ok(0);
            }
        };

        let safe = windows::safe_time(now_ms, self.config.confirmations, self.config.block_time_ms).min(covered_until);

        let mut rolled = 0;
        for token in &self.tokens {
            for size in &self.config.window_sizes {
                rolled += self.aggregates.roll_up(&token.address, *size, safe, now_ms).await?.len() as u32;
            }
        }
        Ok(rolled)
    }

    /// Replay failed ranges whose backoff has elapsed.
    pub async fn retry_failed(&self, now_ms: i64) -> Result<IngestReport, IngestError> {
        let due = self
            .guard
            .due_failed_ranges(&self.config.chain, now_ms, self.config.retry_batch)
            .await?;

        let mut report = IngestReport::default();
        for failed in due {
            log::info!("🔁 Retrying {} (attempt #{})", failed.key, failed.retry_count + 1);
            report.merge(&self.ingest_range(failed.key.clone(), now_ms).await?);

            let settled = matches!(
                self.guard.get_range(&failed.key).await?.map(|r| r.status),
                Some(RangeStatus::Done) | Some(RangeStatus::Partial)
            );
            if settled {
                self.guard.resolve_failed_range(&failed.key, now_ms).await?;
            }
        }

        if report.ranges_done + report.ranges_failed > 0 {
            report.windows_rolled += self.roll_up_windows(now_ms).await?;
        }
        Ok(report)
    }
}

/// `(sender, receiver, amount)` of an ERC-20 Transfer log.
///
/// ERC-721 Transfers carry the token id as a fourth topic and are rejected.
pub fn decode_transfer(log: &RpcLog) -> Option<(String, String, U256)> {
    if log.topics.len() != 3 || log.topics[0] != TRANSFER_TOPIC {
        return None;
    }
    let sender = topic_to_address(&log.topics[1])?;
    let receiver = topic_to_address(&log.topics[2])?;

    let data = hex::decode(log.data.trim_start_matches("0x")).ok()?;
    if data.is_empty() || data.len() > 32 {
        return None;
    }
    let amount = U256::try_from_be_slice(&data)?;

    Some((sender, receiver, amount))
}

/// Last 20 bytes of a 32-byte topic as a lower-case address.
fn topic_to_address(topic: &str) -> Option<String> {
    let bytes = hex::decode(topic.trim_start_matches("0x")).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    Some(format!("0x{}", hex::encode(&bytes[12..])))
}
