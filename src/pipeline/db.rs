//! SQLite persistence shared by every store trait
//!
//! One `Arc<Mutex<Connection>>` backs the replay guard, the aggregate store,
//! the verdict store and the alert store. The schema lives in `/sql/` and is
//! applied by [`run_schema_migrations`].
//!
//! All timestamps written here are epoch milliseconds supplied by the caller;
//! nothing in the store reads the clock.

use super::types::{FlowDirection, TransferEvent};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema directory not found: {0}")]
    SchemaDirMissing(String),

    /// A stored value could not be decoded back into its type
    #[error("corrupt value in {column}: {value}")]
    Corrupt { column: &'static str, value: String },
}

/// Run schema migrations from SQL files
///
/// Reads every `.sql` file in `schema_dir` in file-name order (`00_`, `01_`,
/// ...) and executes it. Files must use `IF NOT EXISTS` so re-running is a
/// no-op.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), StoreError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(StoreError::SchemaDirMissing(schema_dir.to_string()));
    }

    // PRAGMA journal_mode returns a row, so pragma_update rather than execute
    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        log::info!("   ├─ Executing: {}", filename);
        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;
    }

    log::info!("✅ All schema migrations completed successfully");

    Ok(())
}

/// Per-chain ingestion progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainCursor {
    pub last_block: u64,
    pub last_progress_at: i64,
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and apply the schema.
    pub fn open(db_path: &str, schema_dir: &str) -> Result<Self, StoreError> {
        let mut conn = Connection::open(db_path)?;
        run_schema_migrations(&mut conn, schema_dir)?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap a connection whose schema is already in place.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Statements are short and never span an await, so a poisoned lock only
    /// means another thread panicked mid-statement; SQLite rolled it back.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert decoded transfers, ignoring ones already stored.
    ///
    /// Returns how many rows were actually new. Runs in one transaction.
    pub fn insert_transfer_events(&self, events: &[TransferEvent]) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;

        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT OR IGNORE INTO transfer_events (
                    chain, token_address, tx_hash, log_index, block_number,
                    block_timestamp, sender, receiver, amount, direction
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )?;

            for event in events {
                inserted += stmt.execute(params![
                    event.chain,
                    event.token_address,
                    event.tx_hash,
                    event.log_index as i64,
                    event.block_number as i64,
                    event.block_timestamp,
                    event.sender,
                    event.receiver,
                    event.amount.to_string(),
                    event.direction.as_str(),
                ])?;
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// Transfers of `token` with `start <= block_timestamp < end`.
    pub fn transfer_events_between(
        &self,
        token_address: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<TransferEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT chain, token_address, tx_hash, log_index, block_number,
                   block_timestamp, sender, receiver, amount, direction
            FROM transfer_events
            WHERE token_address = ?1 AND block_timestamp >= ?2 AND block_timestamp < ?3
            ORDER BY block_number, log_index
            "#,
        )?;

        let rows = stmt.query_map(params![token_address, start, end], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (chain, token_address, tx_hash, log_index, block_number, block_timestamp, sender, receiver, amount, direction) =
                row?;
            events.push(TransferEvent {
                chain,
                token_address,
                tx_hash,
                log_index: log_index as u64,
                block_number: block_number as u64,
                block_timestamp,
                sender,
                receiver,
                amount: super::types::parse_amount(&amount).ok_or(StoreError::Corrupt {
                    column: "transfer_events.amount",
                    value: amount.clone(),
                })?,
                direction: FlowDirection::parse(&direction).ok_or(StoreError::Corrupt {
                    column: "transfer_events.direction",
                    value: direction.clone(),
                })?,
            });
        }

        Ok(events)
    }

    /// Earliest stored transfer timestamp for `token`, if any.
    pub fn first_event_timestamp(&self, token_address: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.conn();
        let ts: Option<i64> = conn.query_row(
            "SELECT MIN(block_timestamp) FROM transfer_events WHERE token_address = ?1",
            params![token_address],
            |row| row.get(0),
        )?;
        Ok(ts)
    }

    pub fn chain_cursor(&self, chain: &str) -> Result<Option<ChainCursor>, StoreError> {
        let conn = self.conn();
        let cursor = conn
            .query_row(
                "SELECT last_block, last_progress_at FROM ingest_cursors WHERE chain = ?1",
                params![chain],
                |row| {
                    Ok(ChainCursor {
                        last_block: row.get::<_, i64>(0)? as u64,
                        last_progress_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(cursor)
    }

    /// Move the chain cursor forward; never moves it backwards.
    /// `progress_at` is when data was last stored, not when the cursor moved.
    pub fn advance_chain_cursor(&self, chain: &str, block: u64, progress_at: i64) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO ingest_cursors (chain, last_block, last_progress_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(chain) DO UPDATE SET
                last_block = MAX(last_block, excluded.last_block),
                last_progress_at = excluded.last_progress_at
            WHERE excluded.last_block > ingest_cursors.last_block
            "#,
            params![chain, block as i64, progress_at],
        )?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::temp_store;
    use super::*;
    use alloy_primitives::U256;

    fn event(tx: &str, log_index: u64, ts: i64, amount: u64) -> TransferEvent {
        TransferEvent {
            chain: "ethereum".to_string(),
            token_address: "0xtoken".to_string(),
            tx_hash: tx.to_string(),
            log_index,
            block_number: 100,
            block_timestamp: ts,
            sender: "0xa".to_string(),
            receiver: "0xb".to_string(),
            amount: U256::from(amount),
            direction: FlowDirection::In,
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        // Test: Running the schema twice must not fail
        let (temp_file, _store) = temp_store();
        let mut conn = Connection::open(temp_file.path()).unwrap();
        run_schema_migrations(&mut conn, "sql").unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('replay_guard_entries', 'failed_ranges', 'aggregate_windows',
                  'approval_verdicts', 'system_alerts', 'transfer_events')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);
    }

    #[test]
    fn test_missing_schema_dir() {
        let mut conn = Connection::open_in_memory().unwrap();
        let result = run_schema_migrations(&mut conn, "no/such/dir");
        assert!(matches!(result, Err(StoreError::SchemaDirMissing(_))));
    }

    #[test]
    fn test_duplicate_transfers_ignored() {
        let (_tmp, store) = temp_store();

        let batch = vec![event("0x1", 0, 1_000, 5), event("0x1", 1, 1_000, 7)];
        assert_eq!(store.insert_transfer_events(&batch).unwrap(), 2);
        // Same logs again (e.g. a re-ingested range) add nothing
        assert_eq!(store.insert_transfer_events(&batch).unwrap(), 0);

        let events = store.transfer_events_between("0xtoken", 0, 2_000).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].amount, U256::from(7u64));
        assert_eq!(store.first_event_timestamp("0xtoken").unwrap(), Some(1_000));
        assert_eq!(store.first_event_timestamp("0xother").unwrap(), None);
    }

    #[test]
    fn test_chain_cursor_only_moves_forward() {
        let (_tmp, store) = temp_store();
        assert!(store.chain_cursor("ethereum").unwrap().is_none());

        store.advance_chain_cursor("ethereum", 200, 10).unwrap();
        store.advance_chain_cursor("ethereum", 150, 20).unwrap();

        let cursor = store.chain_cursor("ethereum").unwrap().unwrap();
        assert_eq!(cursor.last_block, 200);
        assert_eq!(cursor.last_progress_at, 10);
    }
}
