//! Per-table resume checkpoints.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::errors::StoreError;

/// Name of the checkpoint table; record tables may not use it.
pub const CHECKPOINT_TABLE: &str = "ingest_checkpoints";

pub struct CheckpointStore;

impl CheckpointStore {
    pub fn ensure_table(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS ingest_checkpoints (
                table_name TEXT PRIMARY KEY,
                last_committed_page INTEGER NOT NULL,
                committed_at TEXT NOT NULL
            )
            "#,
            [],
        )?;
        Ok(())
    }

    pub fn last_committed_page(conn: &Connection, table: &str) -> Result<Option<u32>, StoreError> {
        let page = conn
            .query_row(
                "SELECT last_committed_page FROM ingest_checkpoints WHERE table_name = ?1",
                [table],
                |row| row.get::<_, u32>(0),
            )
            .optional()?;
        Ok(page)
    }

    /// Advance the checkpoint for `table` to `page` as part of `tx`.
    ///
    /// Never moves backwards: an older page leaves the stored value alone.
    pub fn record_commit(tx: &Transaction<'_>, table: &str, page: u32) -> Result<(), StoreError> {
        tx.execute(
            r#"
            INSERT INTO ingest_checkpoints (table_name, last_committed_page, committed_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(table_name) DO UPDATE SET
                last_committed_page = MAX(last_committed_page, excluded.last_committed_page),
                committed_at = excluded.committed_at
            "#,
            params![table, page, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}
