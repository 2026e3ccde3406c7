//! Aggregate window store and roll-up
//!
//! A window is rolled up once its end is at or before the caller's safe time.
//! Rows are written with `INSERT OR IGNORE` and never updated afterwards, so a
//! finalized window is immutable. Windows without any transfer are not
//! written at all; downstream the continuity rule sees them as gaps.

use super::db::{SqliteStore, StoreError};
use super::types::{parse_amount, AggregateWindow, FlowDirection, TransferEvent};
use super::windows::{closed_windows_between, floor_to_window_start, WindowBounds, WindowSize};
use alloy_primitives::U256;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::collections::HashSet;

/// Fold a window's transfers into its aggregate.
pub fn aggregate_events(
    token_address: &str,
    size: WindowSize,
    bounds: WindowBounds,
    events: &[TransferEvent],
) -> AggregateWindow {
    let mut window = AggregateWindow::empty(token_address, size, bounds);
    let mut senders = HashSet::new();
    let mut receivers = HashSet::new();

    for event in events.iter().filter(|e| bounds.contains(e.block_timestamp)) {
        window.event_count += 1;
        match event.direction {
            FlowDirection::In => {
                window.inflow_amount = window.inflow_amount.saturating_add(event.amount)
            }
            FlowDirection::Out => {
                window.outflow_amount = window.outflow_amount.saturating_add(event.amount)
            }
            FlowDirection::None => {}
        }
        senders.insert(event.sender.as_str());
        receivers.insert(event.receiver.as_str());
    }

    window.unique_senders = senders.len() as u64;
    window.unique_receivers = receivers.len() as u64;
    window
}

#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Finalize every window of `size` closed at `safe_time` since the last
    /// roll-up. Returns the windows written.
    async fn roll_up(
        &self,
        token_address: &str,
        size: WindowSize,
        safe_time: i64,
        now_ms: i64,
    ) -> Result<Vec<AggregateWindow>, StoreError>;

    /// Start the first roll-up of `size` at the first window beginning at or
    /// after `data_start`, so a window that ingestion entered midway is never
    /// finalized. No effect once a cursor exists. `true` if it was set.
    async fn anchor_roll_up(
        &self,
        token_address: &str,
        size: WindowSize,
        data_start: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    /// Insert a finalized window. `false` if that window already exists.
    async fn insert_window(&self, window: &AggregateWindow, now_ms: i64) -> Result<bool, StoreError>;

    async fn get_window(
        &self,
        token_address: &str,
        size: WindowSize,
        window_start: i64,
    ) -> Result<Option<AggregateWindow>, StoreError>;

    /// Windows starting strictly after `after_start` (all when `None`), oldest first.
    async fn windows_after(
        &self,
        token_address: &str,
        size: WindowSize,
        after_start: Option<i64>,
        limit: usize,
    ) -> Result<Vec<AggregateWindow>, StoreError>;

    /// Most recent window starting before `window_start`.
    async fn window_before(
        &self,
        token_address: &str,
        size: WindowSize,
        window_start: i64,
    ) -> Result<Option<AggregateWindow>, StoreError>;

    /// The `n` most recent windows, newest first.
    async fn latest_windows(
        &self,
        token_address: &str,
        size: WindowSize,
        n: usize,
    ) -> Result<Vec<AggregateWindow>, StoreError>;
}

const WINDOW_COLUMNS: &str = "token_address, window_size, window_start, window_end, event_count, \
                              inflow_amount, outflow_amount, unique_senders, unique_receivers";

type RawWindow = (String, String, i64, i64, i64, String, String, i64, i64);

fn read_raw_window(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawWindow> {
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

fn decode_window(raw: RawWindow) -> Result<AggregateWindow, StoreError> {
    let (token_address, size, window_start, window_end, event_count, inflow, outflow, senders, receivers) = raw;
    let corrupt = |column: &'static str, value: &str| StoreError::Corrupt {
        column,
        value: value.to_string(),
    };

    Ok(AggregateWindow {
        window: size
            .parse()
            .map_err(|_| corrupt("aggregate_windows.window_size", &size))?,
        token_address,
        window_start,
        window_end,
        event_count: event_count as u64,
        inflow_amount: parse_amount(&inflow).ok_or_else(|| corrupt("aggregate_windows.inflow_amount", &inflow))?,
        outflow_amount: parse_amount(&outflow)
            .ok_or_else(|| corrupt("aggregate_windows.outflow_amount", &outflow))?,
        unique_senders: senders as u64,
        unique_receivers: receivers as u64,
    })
}

impl SqliteStore {
    fn query_windows(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<AggregateWindow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let raws: Vec<RawWindow> = stmt
            .query_map(params, read_raw_window)?
            .collect::<Result<_, _>>()?;
        raws.into_iter().map(decode_window).collect()
    }

    fn aggregate_cursor(&self, token_address: &str, size: WindowSize) -> Result<Option<i64>, StoreError> {
        let cursor = self
            .conn()
            .query_row(
                "SELECT last_window_start FROM aggregate_cursors WHERE token_address = ?1 AND window_size = ?2",
                params![token_address, size.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor)
    }

    fn set_aggregate_cursor(
        &self,
        token_address: &str,
        size: WindowSize,
        last_window_start: i64,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO aggregate_cursors (token_address, window_size, last_window_start, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(token_address, window_size) DO UPDATE SET
                last_window_start = excluded.last_window_start,
                updated_at = excluded.updated_at
            "#,
            params![token_address, size.as_str(), last_window_start, now_ms],
        )?;
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for SqliteStore {
    async fn roll_up(
        &self,
        token_address: &str,
        size: WindowSize,
        safe_time: i64,
        now_ms: i64,
    ) -> Result<Vec<AggregateWindow>, StoreError> {
        let cursor = match self.aggregate_cursor(token_address, size)? {
            Some(start) => start,
            // No anchor: start at the window holding the oldest event
            None => match self.first_event_timestamp(token_address)? {
                Some(ts) => floor_to_window_start(ts, size) - size.duration_ms(),
                None => return Ok(Vec::new()),
            },
        };

        let closed = closed_windows_between(cursor, safe_time, size);
        let Some(last) = closed.last().copied() else {
            return Ok(Vec::new());
        };

        let mut written = Vec::new();
        for bounds in closed {
            let events = self.transfer_events_between(token_address, bounds.start, bounds.end)?;
            if events.is_empty() {
                continue;
            }
            let window = aggregate_events(token_address, size, bounds, &events);
            if self.insert_window(&window, now_ms).await? {
                written.push(window);
            }
        }

        self.set_aggregate_cursor(token_address, size, last.start, now_ms)?;

        if !written.is_empty() {
            log::info!(
                "📦 Rolled up {} {} window(s) for {} (through {})",
                written.len(),
                size,
                token_address,
                last.end
            );
        }
        Ok(written)
    }

    async fn anchor_roll_up(
        &self,
        token_address: &str,
        size: WindowSize,
        data_start: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let floor = floor_to_window_start(data_start, size);
        let first_full = if floor == data_start {
            floor
        } else {
            floor + size.duration_ms()
        };

        let inserted = self.conn().execute(
            r#"
            INSERT OR IGNORE INTO aggregate_cursors (token_address, window_size, last_window_start, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![token_address, size.as_str(), first_full - size.duration_ms(), now_ms],
        )?;
        Ok(inserted == 1)
    }

    async fn insert_window(&self, window: &AggregateWindow, now_ms: i64) -> Result<bool, StoreError> {
        let inserted = self.conn().execute(
            r#"
            INSERT OR IGNORE INTO aggregate_windows (
                token_address, window_size, window_start, window_end, event_count,
                inflow_amount, outflow_amount, unique_senders, unique_receivers, finalized_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                window.token_address,
                window.window.as_str(),
                window.window_start,
                window.window_end,
                window.event_count as i64,
                window.inflow_amount.to_string(),
                window.outflow_amount.to_string(),
                window.unique_senders as i64,
                window.unique_receivers as i64,
                now_ms,
            ],
        )?;
        Ok(inserted == 1)
    }

    async fn get_window(
        &self,
        token_address: &str,
        size: WindowSize,
        window_start: i64,
    ) -> Result<Option<AggregateWindow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM aggregate_windows WHERE token_address = ?1 AND window_size = ?2 AND window_start = ?3",
            WINDOW_COLUMNS
        );
        let mut windows = self.query_windows(&sql, params![token_address, size.as_str(), window_start])?;
        Ok(windows.pop())
    }

    async fn windows_after(
        &self,
        token_address: &str,
        size: WindowSize,
        after_start: Option<i64>,
        limit: usize,
    ) -> Result<Vec<AggregateWindow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM aggregate_windows
             WHERE token_address = ?1 AND window_size = ?2 AND window_start > ?3
             ORDER BY window_start ASC LIMIT ?4",
            WINDOW_COLUMNS
        );
        self.query_windows(
            &sql,
            params![token_address, size.as_str(), after_start.unwrap_or(i64::MIN), limit as i64],
        )
    }

    async fn window_before(
        &self,
        token_address: &str,
        size: WindowSize,
        window_start: i64,
    ) -> Result<Option<AggregateWindow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM aggregate_windows
             WHERE token_address = ?1 AND window_size = ?2 AND window_start < ?3
             ORDER BY window_start DESC LIMIT 1",
            WINDOW_COLUMNS
        );
        let mut windows = self.query_windows(&sql, params![token_address, size.as_str(), window_start])?;
        Ok(windows.pop())
    }

    async fn latest_windows(
        &self,
        token_address: &str,
        size: WindowSize,
        n: usize,
    ) -> Result<Vec<AggregateWindow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM aggregate_windows
             WHERE token_address = ?1 AND window_size = ?2
             ORDER BY window_start DESC LIMIT ?3",
            WINDOW_COLUMNS
        );
        self.query_windows(&sql, params![token_address, size.as_str(), n as i64])
    }
}
