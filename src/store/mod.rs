//! Durable SQLite storage for records and checkpoints.
//!
//! A [`Store`] owns the run's only database connection. Page commits go
//! through [`Store::commit_page`], which writes the batch and advances the
//! checkpoint in one transaction.
//!
//! # Tables
//!
//! ```text
//! <table>              one row per entrant, columns derived from the schema
//! ingest_checkpoints   table_name -> last_committed_page
//! ```

pub mod checkpoint;
pub mod records;

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::errors::StoreError;
use crate::models::WriteBatch;
use crate::schema::ExtractionSchema;
use crate::utils::ensure_parent_dir;

pub use checkpoint::CheckpointStore;
pub use records::{InsertSummary, RecordStore};

#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database file at `path`.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        ensure_parent_dir(path.as_ref())?;
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        info!("Opened results database");
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        CheckpointStore::ensure_table(&conn)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Start a transaction. Dropping it without committing rolls back.
    #[cfg(test)]
    pub fn transaction(&mut self) -> Result<rusqlite::Transaction<'_>, StoreError> {
        Ok(self.conn.transaction()?)
    }

    pub fn ensure_table(&self, schema: &ExtractionSchema, table: &str) -> Result<(), StoreError> {
        RecordStore::ensure_table(&self.conn, schema, table)
    }

    pub fn last_committed_page(&self, table: &str) -> Result<Option<u32>, StoreError> {
        CheckpointStore::last_committed_page(&self.conn, table)
    }

    /// Rows currently stored in `table`.
    pub fn row_count(&self, table: &str) -> Result<u64, StoreError> {
        RecordStore::count(&self.conn, table)
    }

    /// Persist a page's batch and advance the checkpoint to `batch.page`,
    /// atomically. On error nothing from the batch is kept.
    pub fn commit_page(
        &mut self,
        schema: &ExtractionSchema,
        table: &str,
        batch: &WriteBatch,
    ) -> Result<InsertSummary, StoreError> {
        if batch.is_empty() {
            debug!(page = batch.page, table, "Committing empty batch; checkpoint only");
        }
        let tx = self.conn.transaction()?;
        let summary = RecordStore::insert_batch(&tx, schema, table, &batch.records)?;
        CheckpointStore::record_commit(&tx, table, batch.page)?;
        tx.commit()?;
        Ok(summary)
    }
}
