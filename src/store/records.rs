//! Entrant record table.
//!
//! One row per [`EntrantRecord`], keyed by bib. The table layout follows the
//! edition schema: fixed entrant columns, then a `split_<marker>` /
//! `split_<marker>_diff` text pair per distance marker, then provenance.
//!
//! # Key collisions
//!
//! The source occasionally hands the same bib to two different entrants.
//! Before each insert the key is resolved against what is already stored:
//!
//! 1. Candidates are tried in order: `bib`, `bib + suffix`, `bib + suffix + suffix`, ...
//! 2. A free candidate is used for the insert.
//! 3. A candidate holding the *same* entrant means the record is already
//!    stored and nothing is written, so re-ingesting a page converges.
//! 4. A candidate holding a different entrant moves on to the next candidate.
//!
//! Records are resolved in listing order, so the mutated key an entrant ends
//! up with is reproducible across runs.

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params_from_iter};
use tracing::{debug, info};

use crate::errors::StoreError;
use crate::models::{EntrantRecord, Split};
use crate::schema::{ExtractionSchema, is_sql_identifier};

/// How many times a colliding bib may be mutated before giving up.
pub const MAX_KEY_MUTATIONS: usize = 8;

const LEADING_COLUMNS: &[&str] = &[
    "bib_id",
    "name",
    "country",
    "club",
    "category",
    "gender",
    "elite",
    "place_gender",
    "place_category",
    "place_overall",
];

const TRAILING_COLUMNS: &[&str] = &["edition", "year", "source_url"];

/// Where a record ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyResolution {
    /// Insert under this key.
    Insert(String),
    /// An identical record already lives under this key.
    AlreadyStored(String),
}

/// Counts from one [`RecordStore::insert_batch`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertSummary {
    pub inserted: usize,
    pub unchanged: usize,
    pub rekeyed: usize,
    /// Final key of every record, in batch order.
    pub keys: Vec<String>,
}

pub struct RecordStore;

impl RecordStore {
    fn checked(table: &str) -> Result<&str, StoreError> {
        if is_sql_identifier(table) {
            Ok(table)
        } else {
            Err(StoreError::InvalidIdentifier(table.to_string()))
        }
    }

    /// Column names in table order.
    pub fn columns(schema: &ExtractionSchema) -> Vec<String> {
        let mut columns: Vec<String> = LEADING_COLUMNS.iter().map(|c| c.to_string()).collect();
        for marker in &schema.markers {
            columns.push(marker.time_column());
            columns.push(marker.diff_column());
        }
        columns.extend(TRAILING_COLUMNS.iter().map(|c| c.to_string()));
        columns
    }

    /// Create the record table if it does not exist yet.
    pub fn ensure_table(
        conn: &Connection,
        schema: &ExtractionSchema,
        table: &str,
    ) -> Result<(), StoreError> {
        let table = Self::checked(table)?;
        let mut defs = vec![
            "bib_id TEXT PRIMARY KEY".to_string(),
            "name TEXT".to_string(),
            "country TEXT NOT NULL".to_string(),
            "club TEXT".to_string(),
            "category TEXT".to_string(),
            "gender TEXT NOT NULL".to_string(),
            "elite INTEGER NOT NULL".to_string(),
            "place_gender INTEGER".to_string(),
            "place_category INTEGER".to_string(),
            "place_overall INTEGER".to_string(),
        ];
        for marker in &schema.markers {
            defs.push(format!("{} TEXT", marker.time_column()));
            defs.push(format!("{} TEXT", marker.diff_column()));
        }
        defs.push("edition TEXT NOT NULL".to_string());
        defs.push("year INTEGER NOT NULL".to_string());
        defs.push("source_url TEXT NOT NULL".to_string());

        conn.execute(
            &format!("CREATE TABLE IF NOT EXISTS {table} (\n    {}\n)", defs.join(",\n    ")),
            [],
        )?;
        debug!(table, columns = defs.len(), "Record table ready");
        Ok(())
    }

    pub fn count(conn: &Connection, table: &str) -> Result<u64, StoreError> {
        let table = Self::checked(table)?;
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
        Ok(n as u64)
    }

    /// All stored keys, sorted.
    #[cfg(test)]
    pub fn keys(conn: &Connection, table: &str) -> Result<Vec<String>, StoreError> {
        let table = Self::checked(table)?;
        let mut stmt = conn.prepare(&format!("SELECT bib_id FROM {table} ORDER BY bib_id"))?;
        let keys = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn get(
        conn: &Connection,
        schema: &ExtractionSchema,
        table: &str,
        key: &str,
    ) -> Result<Option<EntrantRecord>, StoreError> {
        let table = Self::checked(table)?;
        let sql = format!(
            "SELECT {} FROM {table} WHERE bib_id = ?1",
            Self::columns(schema).join(", ")
        );
        let record = conn
            .query_row(&sql, [key], |row| Self::from_row(schema, row))
            .optional()?;
        Ok(record)
    }

    fn from_row(schema: &ExtractionSchema, row: &Row<'_>) -> rusqlite::Result<EntrantRecord> {
        let mut idx = LEADING_COLUMNS.len();
        let mut splits = Vec::with_capacity(schema.markers.len());
        for marker in &schema.markers {
            splits.push(Split {
                marker: marker.marker.clone(),
                time: row.get(idx)?,
                diff: row.get(idx + 1)?,
            });
            idx += 2;
        }

        Ok(EntrantRecord {
            bib_id: row.get(0)?,
            name: row.get(1)?,
            country: row.get(2)?,
            club: row.get(3)?,
            category: row.get(4)?,
            gender: row.get(5)?,
            elite: row.get(6)?,
            place_gender: row.get(7)?,
            place_category: row.get(8)?,
            place_overall: row.get(9)?,
            splits,
            edition: row.get(idx)?,
            year: row.get(idx + 1)?,
            source_url: row.get(idx + 2)?,
        })
    }

    fn to_values(schema: &ExtractionSchema, key: &str, record: &EntrantRecord) -> Vec<Value> {
        let text = |v: &Option<String>| v.clone().map(Value::Text).unwrap_or(Value::Null);
        let int = |v: Option<i64>| v.map(Value::Integer).unwrap_or(Value::Null);

        let mut values = vec![
            Value::Text(key.to_string()),
            text(&record.name),
            Value::Text(record.country.clone()),
            text(&record.club),
            text(&record.category),
            Value::Text(record.gender.clone()),
            Value::Integer(record.elite as i64),
            int(record.place_gender),
            int(record.place_category),
            int(record.place_overall),
        ];
        for marker in &schema.markers {
            match record.split(&marker.marker) {
                Some(split) => {
                    values.push(text(&split.time));
                    values.push(text(&split.diff));
                }
                None => values.extend([Value::Null, Value::Null]),
            }
        }
        values.push(Value::Text(record.edition.clone()));
        values.push(Value::Integer(record.year as i64));
        values.push(Value::Text(record.source_url.clone()));
        values
    }

    /// Pick the key a record should be stored under.
    pub fn resolve_key(
        conn: &Connection,
        schema: &ExtractionSchema,
        table: &str,
        record: &EntrantRecord,
    ) -> Result<KeyResolution, StoreError> {
        let mut candidate = record.bib_id.clone();
        for _ in 0..=MAX_KEY_MUTATIONS {
            match Self::get(conn, schema, table, &candidate)? {
                None => return Ok(KeyResolution::Insert(candidate)),
                Some(existing) if existing.same_entrant(record) => {
                    return Ok(KeyResolution::AlreadyStored(candidate));
                }
                Some(_) => candidate.push_str(&schema.collision_suffix),
            }
        }
        Err(StoreError::CollisionExhausted {
            bib: record.bib_id.clone(),
            attempts: MAX_KEY_MUTATIONS,
        })
    }

    /// Insert one record inside `tx`, resolving its key first.
    pub fn insert_record(
        tx: &Transaction<'_>,
        schema: &ExtractionSchema,
        table: &str,
        record: &EntrantRecord,
    ) -> Result<KeyResolution, StoreError> {
        let table = Self::checked(table)?;
        let resolution = Self::resolve_key(tx, schema, table, record)?;
        if let KeyResolution::Insert(key) = &resolution {
            let columns = Self::columns(schema);
            let placeholders = (1..=columns.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "INSERT INTO {table} ({}) VALUES ({placeholders})",
                columns.join(", ")
            );
            tx.execute(&sql, params_from_iter(Self::to_values(schema, key, record)))?;
            if key != &record.bib_id {
                info!(bib = %record.bib_id, key = %key, url = %record.source_url, "Bib collision; stored under mutated key");
            }
        }
        Ok(resolution)
    }

    /// Insert a page's records inside `tx`. Any error leaves it to the caller
    /// to drop the transaction, which discards every row of the batch.
    pub fn insert_batch(
        tx: &Transaction<'_>,
        schema: &ExtractionSchema,
        table: &str,
        records: &[EntrantRecord],
    ) -> Result<InsertSummary, StoreError> {
        let mut summary = InsertSummary::default();
        for record in records {
            let key = match Self::insert_record(tx, schema, table, record)? {
                KeyResolution::Insert(key) => {
                    summary.inserted += 1;
                    if key != record.bib_id {
                        summary.rekeyed += 1;
                    }
                    key
                }
                KeyResolution::AlreadyStored(key) => {
                    summary.unchanged += 1;
                    key
                }
            };
            summary.keys.push(key);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::record;
    use crate::schema::tests::test_schema;
    use crate::store::Store;

    fn store() -> (Store, ExtractionSchema) {
        let schema = test_schema();
        let store = Store::open_in_memory().unwrap();
        store.ensure_table(&schema, "results").unwrap();
        (store, schema)
    }

    #[test]
    fn test_round_trip_keeps_nulls() {
        let (mut store, schema) = store();
        let original = record("12345", "Jane Doe (USA)");
        {
            let tx = store.transaction().unwrap();
            RecordStore::insert_batch(&tx, &schema, "results", &[original.clone()]).unwrap();
            tx.commit().unwrap();
        }

        let stored = RecordStore::get(store.connection(), &schema, "results", "12345")
            .unwrap()
            .unwrap();
        assert_eq!(stored, original);
        assert_eq!(stored.club, None);
        assert_eq!(stored.split("10K").unwrap(), &Split::empty("10K"));
    }

    #[test]
    fn test_collision_mutates_key_with_suffix() {
        let (mut store, schema) = store();
        let a = record("500", "Jane Doe");
        let b = record("500", "John Roe");
        let c = record("500", "Ann Lee");

        let tx = store.transaction().unwrap();
        let summary = RecordStore::insert_batch(&tx, &schema, "results", &[a, b, c]).unwrap();
        tx.commit().unwrap();

        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.rekeyed, 2);
        assert_eq!(
            summary.keys,
            vec!["500", "500999999", "500999999999999"]
        );
    }

    #[test]
    fn test_reinserting_same_entrants_converges() {
        let (mut store, schema) = store();
        let batch = vec![record("500", "Jane Doe"), record("500", "John Roe")];

        for _ in 0..2 {
            let tx = store.transaction().unwrap();
            RecordStore::insert_batch(&tx, &schema, "results", &batch).unwrap();
            tx.commit().unwrap();
        }

        let tx = store.transaction().unwrap();
        let summary = RecordStore::insert_batch(&tx, &schema, "results", &batch).unwrap();
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.unchanged, 2);
        drop(tx);
        assert_eq!(RecordStore::count(store.connection(), "results").unwrap(), 2);
    }

    #[test]
    fn test_collision_mutation_is_bounded() {
        let (mut store, mut schema) = store();
        schema.collision_suffix = "x".to_string();
        let tx = store.transaction().unwrap();
        for i in 0..=MAX_KEY_MUTATIONS {
            RecordStore::insert_record(&tx, &schema, "results", &record("9", &format!("Runner {i}")))
                .unwrap();
        }
        let err = RecordStore::insert_record(&tx, &schema, "results", &record("9", "One Too Many"))
            .unwrap_err();
        assert!(matches!(err, StoreError::CollisionExhausted { .. }));
    }

    #[test]
    fn test_rejects_unsafe_table_names() {
        let (store, schema) = store();
        assert!(matches!(
            RecordStore::ensure_table(store.connection(), &schema, "x; DROP TABLE results"),
            Err(StoreError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_columns_follow_schema_markers() {
        let schema = test_schema();
        let columns = RecordStore::columns(&schema);
        assert_eq!(columns[0], "bib_id");
        assert!(columns.contains(&"split_Half_diff".to_string()));
        assert_eq!(columns.last().unwrap(), "source_url");
        assert_eq!(columns.len(), 10 + 2 * schema.markers.len() + 3);
    }
}
