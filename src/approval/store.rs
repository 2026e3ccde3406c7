//! Verdict persistence and per-(token, window) evaluation cursors

use super::engine::{Verdict, VerdictStatus};
use super::rules::RuleHit;
use crate::pipeline::db::{SqliteStore, StoreError};
use crate::pipeline::windows::WindowSize;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerdictCounts {
    pub approved: u64,
    pub quarantined: u64,
    pub rejected: u64,
}

impl VerdictCounts {
    pub fn total(&self) -> u64 {
        self.approved + self.quarantined + self.rejected
    }
}

#[async_trait]
pub trait VerdictStore: Send + Sync {
    /// Insert or replace the verdict for a window; re-evaluation overwrites.
    async fn save_verdict(&self, verdict: &Verdict) -> Result<(), StoreError>;

    async fn get_verdict(
        &self,
        token_address: &str,
        size: WindowSize,
        window_start: i64,
    ) -> Result<Option<Verdict>, StoreError>;

    /// Newest first; `status = None` lists every verdict.
    async fn list_verdicts(
        &self,
        token_address: &str,
        size: WindowSize,
        status: Option<VerdictStatus>,
        limit: usize,
    ) -> Result<Vec<Verdict>, StoreError>;

    async fn counts(&self) -> Result<VerdictCounts, StoreError>;

    /// Start of the last window evaluated for `(token, size)`.
    async fn approval_cursor(&self, token_address: &str, size: WindowSize) -> Result<Option<i64>, StoreError>;

    async fn set_approval_cursor(
        &self,
        token_address: &str,
        size: WindowSize,
        window_start: i64,
        now_ms: i64,
    ) -> Result<(), StoreError>;
}

const VERDICT_COLUMNS: &str =
    "token_address, token_symbol, window_size, window_start, status, score, hits_json, metrics_hash, evaluated_at";

type RawVerdict = (String, Option<String>, String, i64, String, i64, String, String, i64);

fn read_raw_verdict(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawVerdict> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn decode_verdict(raw: RawVerdict) -> Result<Verdict, StoreError> {
    let (token_address, token_symbol, size, window_start, status, score, hits_json, metrics_hash, evaluated_at) = raw;
    let hits: Vec<RuleHit> = serde_json::from_str(&hits_json)?;

    Ok(Verdict {
        window: size.parse().map_err(|_| StoreError::Corrupt {
            column: "approval_verdicts.window_size",
            value: size.clone(),
        })?,
        status: VerdictStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
            column: "approval_verdicts.status",
            value: status.clone(),
        })?,
        token_address,
        token_symbol,
        window_start,
        score: score as u32,
        hits,
        metrics_hash,
        evaluated_at,
    })
}

impl SqliteStore {
    fn query_verdicts(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Verdict>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let raws: Vec<RawVerdict> = stmt
            .query_map(params, read_raw_verdict)?
            .collect::<Result<_, _>>()?;
        raws.into_iter().map(decode_verdict).collect()
    }
}

#[async_trait]
impl VerdictStore for SqliteStore {
    async fn save_verdict(&self, verdict: &Verdict) -> Result<(), StoreError> {
        let hits_json = serde_json::to_string(&verdict.hits)?;
        self.conn().execute(
            r#"
            INSERT INTO approval_verdicts (
                token_address, token_symbol, window_size, window_start, status,
                score, hits_json, metrics_hash, evaluated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(token_address, window_size, window_start) DO UPDATE SET
                token_symbol = COALESCE(excluded.token_symbol, approval_verdicts.token_symbol),
                status = excluded.status,
                score = excluded.score,
                hits_json = excluded.hits_json,
                metrics_hash = excluded.metrics_hash,
                evaluated_at = excluded.evaluated_at
            "#,
            params![
                verdict.token_address,
                verdict.token_symbol,
                verdict.window.as_str(),
                verdict.window_start,
                verdict.status.as_str(),
                verdict.score as i64,
                hits_json,
                verdict.metrics_hash,
                verdict.evaluated_at,
            ],
        )?;
        Ok(())
    }

    async fn get_verdict(
        &self,
        token_address: &str,
        size: WindowSize,
        window_start: i64,
    ) -> Result<Option<Verdict>, StoreError> {
        let sql = format!(
            "SELECT {} FROM approval_verdicts WHERE token_address = ?1 AND window_size = ?2 AND window_start = ?3",
            VERDICT_COLUMNS
        );
        let mut verdicts = self.query_verdicts(&sql, params![token_address, size.as_str(), window_start])?;
        Ok(verdicts.pop())
    }

    async fn list_verdicts(
        &self,
        token_address: &str,
        size: WindowSize,
        status: Option<VerdictStatus>,
        limit: usize,
    ) -> Result<Vec<Verdict>, StoreError> {
        let sql = format!(
            "SELECT {} FROM approval_verdicts
             WHERE token_address = ?1 AND window_size = ?2 AND (?3 IS NULL OR status = ?3)
             ORDER BY window_start DESC LIMIT ?4",
            VERDICT_COLUMNS
        );
        self.query_verdicts(
            &sql,
            params![token_address, size.as_str(), status.map(|s| s.as_str()), limit as i64],
        )
    }

    async fn counts(&self) -> Result<VerdictCounts, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM approval_verdicts GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = VerdictCounts::default();
        for row in rows {
            let (status, n) = row?;
            match VerdictStatus::parse(&status) {
                Some(VerdictStatus::Approved) => counts.approved = n as u64,
                Some(VerdictStatus::Quarantined) => counts.quarantined = n as u64,
                Some(VerdictStatus::Rejected) => counts.rejected = n as u64,
                None => log::warn!("⚠️  Unknown verdict status in store: {}", status),
            }
        }
        Ok(counts)
    }

    async fn approval_cursor(&self, token_address: &str, size: WindowSize) -> Result<Option<i64>, StoreError> {
        let cursor = self
            .conn()
            .query_row(
                "SELECT last_window_start FROM approval_cursors WHERE token_address = ?1 AND window_size = ?2",
                params![token_address, size.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor)
    }

    async fn set_approval_cursor(
        &self,
        token_address: &str,
        size: WindowSize,
        window_start: i64,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO approval_cursors (token_address, window_size, last_window_start, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(token_address, window_size) DO UPDATE SET
                last_window_start = MAX(approval_cursors.last_window_start, excluded.last_window_start),
                updated_at = excluded.updated_at
            "#,
            params![token_address, size.as_str(), window_start, now_ms],
        )?;
        Ok(())
    }
}
