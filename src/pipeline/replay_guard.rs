//! Replay guard: exactly-once ledger over block ranges
//!
//! State machine per `(chain, from_block, to_block)`:
//!
//! ```text
//! claim ──► IN_PROGRESS ──► DONE      (terminal, never reprocessed)
//!                      ├──► FAILED    (re-claimable, queued in failed_ranges)
//!                      └──► PARTIAL   (split; caller claims the halves)
//! ```
//!
//! Claims are optimistic: an `INSERT` against the table's UNIQUE key, or a
//! guarded `UPDATE ... WHERE status = ...` for re-claims. Whichever writer
//! changes the row owns the range; everyone else sees the existing status.
//! No locks are held between claim and completion.

use super::db::{SqliteStore, StoreError};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

const FAILED_RANGE_BASE_DELAY_MS: i64 = 60_000;
const FAILED_RANGE_MAX_DELAY_MS: i64 = 60 * 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RangeStatus {
    InProgress,
    Done,
    Failed,
    Partial,
}

impl RangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RangeStatus::InProgress => "IN_PROGRESS",
            RangeStatus::Done => "DONE",
            RangeStatus::Failed => "FAILED",
            RangeStatus::Partial => "PARTIAL",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "IN_PROGRESS" => Ok(RangeStatus::InProgress),
            "DONE" => Ok(RangeStatus::Done),
            "FAILED" => Ok(RangeStatus::Failed),
            "PARTIAL" => Ok(RangeStatus::Partial),
            other => Err(StoreError::Corrupt {
                column: "replay_guard_entries.status",
                value: other.to_string(),
            }),
        }
    }
}

/// Unique key of a block range (bounds inclusive)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RangeKey {
    pub chain: String,
    pub from_block: u64,
    pub to_block: u64,
}

impl RangeKey {
    pub fn new(chain: &str, from_block: u64, to_block: u64) -> Self {
        Self {
            chain: chain.to_string(),
            from_block,
            to_block,
        }
    }

    pub fn width(&self) -> u64 {
        self.to_block - self.from_block + 1
    }

    /// Split into two non-empty halves; `None` for a single block.
    pub fn bisect(&self) -> Option<(RangeKey, RangeKey)> {
        if self.from_block >= self.to_block {
            return None;
        }
        let mid = self.from_block + (self.to_block - self.from_block) / 2;
        Some((
            RangeKey::new(&self.chain, self.from_block, mid),
            RangeKey::new(&self.chain, mid + 1, self.to_block),
        ))
    }
}

impl std::fmt::Display for RangeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}..={}]", self.chain, self.from_block, self.to_block)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockRange {
    pub key: RangeKey,
    pub status: RangeStatus,
    pub events_found: u64,
    pub events_ingested: u64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub retry_count: u32,
    pub worker_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRange {
    pub key: RangeKey,
    pub reason: String,
    pub retry_count: u32,
    pub next_retry_at: i64,
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Caller owns the range; `retry_count` > 0 when re-claiming a failed or stale one
    Claimed { retry_count: u32 },
    AlreadyDone,
    /// Another worker holds a live claim
    InProgress,
    /// Range was split; claim the halves instead
    Partial,
}

/// `min(2^attempts × 60s, 1h)`
pub fn failed_range_backoff_ms(attempts: u32) -> i64 {
    2i64.checked_pow(attempts)
        .and_then(|factor| factor.checked_mul(FAILED_RANGE_BASE_DELAY_MS))
        .map_or(FAILED_RANGE_MAX_DELAY_MS, |delay| delay.min(FAILED_RANGE_MAX_DELAY_MS))
}

#[async_trait]
pub trait ReplayGuard: Send + Sync {
    /// Atomically claim `range`. An `IN_PROGRESS` claim older than
    /// `stale_after_ms` is treated as abandoned and taken over.
    async fn claim(
        &self,
        range: &RangeKey,
        worker_id: &str,
        now_ms: i64,
        stale_after_ms: i64,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Mark the caller's `IN_PROGRESS` claim `DONE`. `false` when the claim
    /// is gone (swept as stale, or taken over) and the range was left as is.
    async fn complete(
        &self,
        range: &RangeKey,
        events_found: u64,
        events_ingested: u64,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    /// Mark `FAILED` and (re)queue the range with exponential backoff.
    async fn fail(&self, range: &RangeKey, reason: &str, now_ms: i64) -> Result<FailedRange, StoreError>;

    async fn mark_partial(&self, range: &RangeKey, reason: &str, now_ms: i64) -> Result<(), StoreError>;

    async fn get_range(&self, range: &RangeKey) -> Result<Option<BlockRange>, StoreError>;

    /// Widest range on `chain` starting at `from_block`, whatever its status.
    /// Halves of a split range are narrower than their parent.
    async fn widest_range_from(&self, chain: &str, from_block: u64) -> Result<Option<RangeKey>, StoreError>;

    async fn is_done(&self, range: &RangeKey) -> Result<bool, StoreError> {
        Ok(matches!(
            self.get_range(range).await?,
            Some(BlockRange {
                status: RangeStatus::Done,
                ..
            })
        ))
    }

    /// Fail every `IN_PROGRESS` claim on `chain` older than `stale_after_ms`.
    async fn sweep_stale(&self, chain: &str, stale_after_ms: i64, now_ms: i64) -> Result<Vec<RangeKey>, StoreError>;

    async fn due_failed_ranges(&self, chain: &str, now_ms: i64, limit: usize) -> Result<Vec<FailedRange>, StoreError>;

    async fn resolve_failed_range(&self, range: &RangeKey, now_ms: i64) -> Result<(), StoreError>;

    /// Lowest block of any range on `chain` not yet settled (queued for
    /// retry or still in flight). Data past it may be incomplete.
    async fn lowest_open_block(&self, chain: &str) -> Result<Option<u64>, StoreError>;
}

/// Status comes back as raw text; `load_range` validates it.
fn row_to_block_range(row: &rusqlite::Row<'_>) -> rusqlite::Result<(BlockRange, String)> {
    let status: String = row.get(3)?;
    Ok((
        BlockRange {
            key: RangeKey {
                chain: row.get(0)?,
                from_block: row.get::<_, i64>(1)? as u64,
                to_block: row.get::<_, i64>(2)? as u64,
            },
            status: RangeStatus::InProgress,
            events_found: row.get::<_, i64>(4)? as u64,
            events_ingested: row.get::<_, i64>(5)? as u64,
            started_at: row.get(6)?,
            finished_at: row.get(7)?,
            retry_count: row.get::<_, i64>(8)? as u32,
            worker_id: row.get(9)?,
            error: row.get(10)?,
        },
        status,
    ))
}

const RANGE_COLUMNS: &str = "chain, from_block, to_block, status, events_found, events_ingested, \
                             started_at, finished_at, retry_count, worker_id, error";

impl SqliteStore {
    fn load_range(conn: &rusqlite::Connection, range: &RangeKey) -> Result<Option<BlockRange>, StoreError> {
        let sql = format!(
            "SELECT {} FROM replay_guard_entries WHERE chain = ?1 AND from_block = ?2 AND to_block = ?3",
            RANGE_COLUMNS
        );
        let found = conn
            .query_row(
                &sql,
                params![range.chain, range.from_block as i64, range.to_block as i64],
                row_to_block_range,
            )
            .optional()?;

        match found {
            Some((mut entry, status)) => {
                entry.status = RangeStatus::parse(&status)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn fail_locked(
        conn: &mut rusqlite::Connection,
        range: &RangeKey,
        reason: &str,
        now_ms: i64,
    ) -> Result<FailedRange, StoreError> {
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            UPDATE replay_guard_entries
            SET status = 'FAILED', error = ?4, finished_at = ?5
            WHERE chain = ?1 AND from_block = ?2 AND to_block = ?3 AND status <> 'DONE'
            "#,
            params![range.chain, range.from_block as i64, range.to_block as i64, reason, now_ms],
        )?;

        let previous: Option<i64> = tx
            .query_row(
                "SELECT retry_count FROM failed_ranges WHERE chain = ?1 AND from_block = ?2 AND to_block = ?3",
                params![range.chain, range.from_block as i64, range.to_block as i64],
                |row| row.get(0),
            )
            .optional()?;

        let retry_count = previous.map_or(0, |n| n as u32 + 1);
        let next_retry_at = now_ms + failed_range_backoff_ms(retry_count);

        tx.execute(
            r#"
            INSERT INTO failed_ranges (
                chain, from_block, to_block, reason, retry_count, next_retry_at,
                resolved, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)
            ON CONFLICT(chain, from_block, to_block) DO UPDATE SET
                reason = excluded.reason,
                retry_count = excluded.retry_count,
                next_retry_at = excluded.next_retry_at,
                resolved = 0,
                updated_at = excluded.updated_at
            "#,
            params![
                range.chain,
                range.from_block as i64,
                range.to_block as i64,
                reason,
                retry_count as i64,
                next_retry_at,
                now_ms,
            ],
        )?;

        tx.commit()?;

        Ok(FailedRange {
            key: range.clone(),
            reason: reason.to_string(),
            retry_count,
            next_retry_at,
            resolved: false,
        })
    }
}

#[async_trait]
impl ReplayGuard for SqliteStore {
    async fn claim(
        &self,
        range: &RangeKey,
        worker_id: &str,
        now_ms: i64,
        stale_after_ms: i64,
    ) -> Result<ClaimOutcome, StoreError> {
        let conn = self.conn();
        let from = range.from_block as i64;
        let to = range.to_block as i64;

        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO replay_guard_entries (
                chain, from_block, to_block, status, started_at, worker_id
            ) VALUES (?1, ?2, ?3, 'IN_PROGRESS', ?4, ?5)
            "#,
            params![range.chain, from, to, now_ms, worker_id],
        )?;
        if inserted == 1 {
            return Ok(ClaimOutcome::Claimed { retry_count: 0 });
        }

        // Re-claim a failed range, or one whose worker went silent
        let reclaimed = conn.execute(
            r#"
            UPDATE replay_guard_entries
            SET status = 'IN_PROGRESS', retry_count = retry_count + 1, started_at = ?4,
                finished_at = NULL, worker_id = ?5, error = NULL
            WHERE chain = ?1 AND from_block = ?2 AND to_block = ?3
              AND (status = 'FAILED' OR (status = 'IN_PROGRESS' AND started_at <= ?6))
            "#,
            params![range.chain, from, to, now_ms, worker_id, now_ms - stale_after_ms],
        )?;

        let existing = Self::load_range(&conn, range)?;
        match existing {
            Some(entry) if reclaimed == 1 => {
                log::info!("♻️  Re-claimed {} (retry #{})", range, entry.retry_count);
                Ok(ClaimOutcome::Claimed {
                    retry_count: entry.retry_count,
                })
            }
            Some(entry) => Ok(match entry.status {
                RangeStatus::Done => ClaimOutcome::AlreadyDone,
                RangeStatus::Partial => ClaimOutcome::Partial,
                RangeStatus::InProgress | RangeStatus::Failed => ClaimOutcome::InProgress,
            }),
            None => Err(StoreError::Corrupt {
                column: "replay_guard_entries",
                value: format!("{} vanished during claim", range),
            }),
        }
    }

    async fn complete(
        &self,
        range: &RangeKey,
        events_found: u64,
        events_ingested: u64,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let updated = self.conn().execute(
            r#"
            UPDATE replay_guard_entries
            SET status = 'DONE', events_found = ?4, events_ingested = ?5, finished_at = ?6, error = NULL
            WHERE chain = ?1 AND from_block = ?2 AND to_block = ?3 AND status = 'IN_PROGRESS'
            "#,
            params![
                range.chain,
                range.from_block as i64,
                range.to_block as i64,
                events_found as i64,
                events_ingested as i64,
                now_ms,
            ],
        )?;

        if updated == 0 {
            log::warn!("⚠️  complete({}) found no IN_PROGRESS claim", range);
        }
        Ok(updated == 1)
    }

    async fn fail(&self, range: &RangeKey, reason: &str, now_ms: i64) -> Result<FailedRange, StoreError> {
        let mut conn = self.conn();
        let failed = Self::fail_locked(&mut conn, range, reason, now_ms)?;
        log::warn!(
            "❌ Range {} failed (retry #{} at {}): {}",
            range,
            failed.retry_count,
            failed.next_retry_at,
            reason
        );
        Ok(failed)
    }

    async fn mark_partial(&self, range: &RangeKey, reason: &str, now_ms: i64) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            UPDATE replay_guard_entries
            SET status = 'PARTIAL', error = ?4, finished_at = ?5
            WHERE chain = ?1 AND from_block = ?2 AND to_block = ?3 AND status = 'IN_PROGRESS'
            "#,
            params![range.chain, range.from_block as i64, range.to_block as i64, reason, now_ms],
        )?;
        Ok(())
    }

    async fn get_range(&self, range: &RangeKey) -> Result<Option<BlockRange>, StoreError> {
        Self::load_range(&self.conn(), range)
    }

    async fn widest_range_from(&self, chain: &str, from_block: u64) -> Result<Option<RangeKey>, StoreError> {
        let to_block: Option<i64> = self.conn().query_row(
            "SELECT MAX(to_block) FROM replay_guard_entries WHERE chain = ?1 AND from_block = ?2",
            params![chain, from_block as i64],
            |row| row.get(0),
        )?;
        Ok(to_block.map(|to| RangeKey::new(chain, from_block, to as u64)))
    }

    async fn sweep_stale(&self, chain: &str, stale_after_ms: i64, now_ms: i64) -> Result<Vec<RangeKey>, StoreError> {
        let mut conn = self.conn();
        let stale: Vec<RangeKey> = {
            let mut stmt = conn.prepare(
                r#"
                SELECT from_block, to_block FROM replay_guard_entries
                WHERE chain = ?1 AND status = 'IN_PROGRESS' AND started_at <= ?2
                ORDER BY from_block
                "#,
            )?;
            let rows = stmt.query_map(params![chain, now_ms - stale_after_ms], |row| {
                Ok(RangeKey::new(chain, row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        for range in &stale {
            Self::fail_locked(&mut conn, range, "stale claim: worker stopped reporting", now_ms)?;
        }

        if !stale.is_empty() {
            log::warn!("🧹 Swept {} stale claim(s) on {}", stale.len(), chain);
        }
        Ok(stale)
    }

    async fn due_failed_ranges(&self, chain: &str, now_ms: i64, limit: usize) -> Result<Vec<FailedRange>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT from_block, to_block, reason, retry_count, next_retry_at
            FROM failed_ranges
            WHERE chain = ?1 AND resolved = 0 AND next_retry_at <= ?2
            ORDER BY next_retry_at, from_block
            LIMIT ?3
            "#,
        )?;

        let rows = stmt.query_map(params![chain, now_ms, limit as i64], |row| {
            Ok(FailedRange {
                key: RangeKey::new(chain, row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64),
                reason: row.get(2)?,
                retry_count: row.get::<_, i64>(3)? as u32,
                next_retry_at: row.get(4)?,
                resolved: false,
            })
        })?;

        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn resolve_failed_range(&self, range: &RangeKey, now_ms: i64) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            UPDATE failed_ranges SET resolved = 1, updated_at = ?4
            WHERE chain = ?1 AND from_block = ?2 AND to_block = ?3
            "#,
            params![range.chain, range.from_block as i64, range.to_block as i64, now_ms],
        )?;
        Ok(())
    }

    async fn lowest_open_block(&self, chain: &str) -> Result<Option<u64>, StoreError> {
        let lowest: Option<i64> = self.conn().query_row(
            r#"
            SELECT MIN(from_block) FROM (
                SELECT from_block FROM failed_ranges WHERE chain = ?1 AND resolved = 0
                UNION ALL
                SELECT from_block FROM replay_guard_entries
                WHERE chain = ?1 AND status IN ('IN_PROGRESS', 'FAILED')
            )
            "#,
            params![chain],
            |row| row.get(0),
        )?;
        Ok(lowest.map(|b| b as u64))
    }
}
