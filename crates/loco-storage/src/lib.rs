use chrono::{DateTime, SecondsFormat, Utc};
use loco_core::{ContentDigest, DatasetName, MeasurementRecord};
use rusqlite::{
    ffi, params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior,
};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const LOCO_SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MEASUREMENT_COLUMNS: &str = "var_name, var_value, time_string, time_ms, extra_json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLedgerEntry {
    pub file_name: String,
    pub content_hash: ContentDigest,
    pub record_count: u64,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered(FileLedgerEntry),
    AlreadyPresent,
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub created_table: bool,
    pub staged_rows: usize,
    pub inserted_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed {
        entry: FileLedgerEntry,
        merge: MergeReport,
    },
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsultationEntry {
    pub id: i64,
    pub query_type: String,
    pub parameters: String,
    pub recorded_at: DateTime<Utc>,
}

impl ConsultationEntry {
    pub fn preview(&self, max_chars: usize) -> String {
        let mut chars = self.parameters.chars();
        let head = chars.by_ref().take(max_chars).collect::<String>();
        if chars.next().is_some() {
            format!("{head}...")
        } else {
            head
        }
    }
}

/// Handle on the SQLite file. Every operation opens its own connection and
/// transaction and closes both before returning.
#[derive(Debug, Clone)]
pub struct LocoStore {
    path: PathBuf,
}

impl LocoStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let store = Self { path };
        store.bootstrap_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StorageError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.connect()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Creates every fixed relation and index that is missing. Safe on every start.
    pub fn bootstrap_schema(&self) -> Result<(), StorageError> {
        let mut conn = self.connect()?;
        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > LOCO_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: LOCO_SCHEMA_VERSION,
            });
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(include_str!("../migrations/0001_loco_schema.sql"))?;
        tx.execute_batch(&format!("PRAGMA user_version = {LOCO_SCHEMA_VERSION}"))?;
        tx.commit()?;
        Ok(())
    }

    /// Records a file identity. Uniqueness of the digest is left to the UNIQUE
    /// constraint, so a concurrent duplicate surfaces as `AlreadyPresent`.
    pub fn register_file(
        &self,
        file_name: &str,
        content_hash: &ContentDigest,
        record_count: u64,
    ) -> RegisterOutcome {
        let attempt = || -> Result<RegisterOutcome, StorageError> {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(entry) =
                insert_ledger_entry(&tx, file_name, content_hash, record_count, Utc::now())?
            else {
                return Ok(RegisterOutcome::AlreadyPresent);
            };
            tx.commit()?;
            Ok(RegisterOutcome::Registered(entry))
        };

        attempt().unwrap_or_else(|err| RegisterOutcome::Failed(err.to_string()))
    }

    /// Set-union of `records` into the dataset's measurement table under the
    /// natural key (var_name, time_string, var_value), in one transaction.
    pub fn merge_insert(
        &self,
        dataset: &DatasetName,
        records: &[MeasurementRecord],
    ) -> Result<MergeReport, StorageError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let report = merge_records(&tx, dataset, records)?;
        tx.commit()?;
        Ok(report)
    }

    /// Registers the file and merges its records atomically: either both the
    /// ledger row and the new measurements land, or neither does.
    pub fn commit_file(
        &self,
        dataset: &DatasetName,
        file_name: &str,
        content_hash: &ContentDigest,
        record_count: u64,
        records: &[MeasurementRecord],
    ) -> Result<CommitOutcome, StorageError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(entry) =
            insert_ledger_entry(&tx, file_name, content_hash, record_count, Utc::now())?
        else {
            return Ok(CommitOutcome::AlreadyPresent);
        };
        let merge = merge_records(&tx, dataset, records)?;
        tx.commit()?;
        Ok(CommitOutcome::Committed { entry, merge })
    }

    pub fn ledger_entry(
        &self,
        content_hash: &ContentDigest,
    ) -> Result<Option<FileLedgerEntry>, StorageError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "
                SELECT file_name, content_hash, record_count, ingested_at
                FROM file_ledger
                WHERE content_hash = ?1
                ",
                [content_hash.as_str()],
                ledger_entry_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn ledger_entries(&self) -> Result<Vec<FileLedgerEntry>, StorageError> {
        let conn = self.connect()?;
        let mut statement = conn.prepare(
            "
            SELECT file_name, content_hash, record_count, ingested_at
            FROM file_ledger
            ORDER BY id ASC
            ",
        )?;
        let rows = statement.query_map([], ledger_entry_from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn ledger_count(&self) -> Result<i64, StorageError> {
        let conn = self.connect()?;
        let count = conn.query_row("SELECT COUNT(*) FROM file_ledger", [], |row| row.get(0))?;
        Ok(count)
    }

    /// All rows of a dataset in insertion order; a dataset never loaded is empty.
    pub fn measurements(
        &self,
        dataset: &DatasetName,
    ) -> Result<Vec<MeasurementRecord>, StorageError> {
        self.query_measurements(dataset, None)
    }

    pub fn first_measurements(
        &self,
        dataset: &DatasetName,
        limit: usize,
    ) -> Result<Vec<MeasurementRecord>, StorageError> {
        self.query_measurements(dataset, Some(limit))
    }

    fn query_measurements(
        &self,
        dataset: &DatasetName,
        limit: Option<usize>,
    ) -> Result<Vec<MeasurementRecord>, StorageError> {
        let conn = self.connect()?;
        let table = dataset.table_name();
        if !table_exists_in(&conn, &table)? {
            return Ok(Vec::new());
        }

        let limit = limit.map_or(-1_i64, |limit| i64::try_from(limit).unwrap_or(i64::MAX));
        let mut statement = conn.prepare(&format!(
            "SELECT {MEASUREMENT_COLUMNS} FROM {table} ORDER BY row_id ASC LIMIT ?1"
        ))?;
        let rows = statement.query_map([limit], measurement_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn variable_names(&self, dataset: &DatasetName) -> Result<Vec<String>, StorageError> {
        let conn = self.connect()?;
        let table = dataset.table_name();
        if !table_exists_in(&conn, &table)? {
            return Ok(Vec::new());
        }

        let mut statement = conn.prepare(&format!(
            "SELECT DISTINCT var_name FROM {table} ORDER BY var_name ASC"
        ))?;
        let rows = statement.query_map([], |row| row.get::<_, String>(0))?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    pub fn measurement_count(&self, dataset: &DatasetName) -> Result<i64, StorageError> {
        let conn = self.connect()?;
        let table = dataset.table_name();
        if !table_exists_in(&conn, &table)? {
            return Ok(0);
        }
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    pub fn append_consultation(
        &self,
        query_type: &str,
        parameters: &str,
        recorded_at: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let conn = self.connect()?;
        conn.execute(
            "
            INSERT INTO consultation_log (query_type, parameters, recorded_at)
            VALUES (?1, ?2, ?3)
            ",
            params![query_type, parameters, format_timestamp(recorded_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn recent_consultations(
        &self,
        limit: usize,
    ) -> Result<Vec<ConsultationEntry>, StorageError> {
        let conn = self.connect()?;
        let mut statement = conn.prepare(
            "
            SELECT id, query_type, parameters, recorded_at
            FROM consultation_log
            ORDER BY recorded_at DESC, id DESC
            LIMIT ?1
            ",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = statement.query_map([limit], |row| {
            let recorded_at = parse_timestamp(row.get::<_, String>(3)?).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;
            Ok(ConsultationEntry {
                id: row.get(0)?,
                query_type: row.get(1)?,
                parameters: row.get(2)?,
                recorded_at,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let conn = self.connect()?;
        table_exists_in(&conn, table_name)
    }
}

fn insert_ledger_entry(
    tx: &Transaction<'_>,
    file_name: &str,
    content_hash: &ContentDigest,
    record_count: u64,
    ingested_at: DateTime<Utc>,
) -> Result<Option<FileLedgerEntry>, StorageError> {
    let result = tx.execute(
        "
        INSERT INTO file_ledger (file_name, content_hash, record_count, ingested_at)
        VALUES (?1, ?2, ?3, ?4)
        ",
        params![
            file_name,
            content_hash.as_str(),
            i64::try_from(record_count).unwrap_or(i64::MAX),
            format_timestamp(ingested_at),
        ],
    );

    match result {
        Ok(_) => Ok(Some(FileLedgerEntry {
            file_name: file_name.to_string(),
            content_hash: content_hash.clone(),
            record_count,
            ingested_at,
        })),
        Err(rusqlite::Error::SqliteFailure(err, _)) if is_unique_violation(&err) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn is_unique_violation(err: &ffi::Error) -> bool {
    err.code == ErrorCode::ConstraintViolation
        && (err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
            || err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
}

fn merge_records(
    tx: &Transaction<'_>,
    dataset: &DatasetName,
    records: &[MeasurementRecord],
) -> Result<MergeReport, StorageError> {
    let table = dataset.table_name();
    let records = distinct_records(records);

    if !table_exists_in(tx, &table)? {
        tx.execute_batch(&measurement_table_ddl(&table))?;
        let inserted_rows = insert_measurements(tx, &table, &records)?;
        return Ok(MergeReport {
            created_table: true,
            staged_rows: 0,
            inserted_rows,
        });
    }

    let staging = dataset.staging_table_name();
    tx.execute_batch(&format!(
        "
        DROP TABLE IF EXISTS temp.{staging};
        CREATE TEMP TABLE {staging} (
            seq INTEGER PRIMARY KEY,
            var_name TEXT NOT NULL,
            var_value REAL NOT NULL,
            time_string TEXT NOT NULL,
            time_ms INTEGER NOT NULL,
            extra_json TEXT
        );
        "
    ))?;
    let staged_rows = insert_measurements(tx, &format!("temp.{staging}"), &records)?;

    let inserted_rows = tx.execute(
        &format!(
            "
            INSERT INTO {table} ({MEASUREMENT_COLUMNS})
            SELECT s.var_name, s.var_value, s.time_string, s.time_ms, s.extra_json
            FROM temp.{staging} AS s
            WHERE NOT EXISTS (
                SELECT 1 FROM {table} AS t
                WHERE t.var_name = s.var_name
                  AND t.time_string = s.time_string
                  AND t.var_value = s.var_value
            )
            ORDER BY s.seq ASC
            "
        ),
        [],
    )?;
    tx.execute_batch(&format!("DROP TABLE temp.{staging};"))?;

    Ok(MergeReport {
        created_table: false,
        staged_rows,
        inserted_rows,
    })
}

/// First occurrence of each natural key, in input order.
fn distinct_records(records: &[MeasurementRecord]) -> Vec<&MeasurementRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .iter()
        .filter(|record| seen.insert(record.natural_key()))
        .collect()
}

fn insert_measurements(
    tx: &Transaction<'_>,
    table: &str,
    records: &[&MeasurementRecord],
) -> Result<usize, StorageError> {
    let mut statement = tx.prepare(&format!(
        "INSERT INTO {table} ({MEASUREMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"
    ))?;

    let mut inserted = 0_usize;
    for record in records {
        let extra_json = if record.extra.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&record.extra)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?,
            )
        };
        inserted += statement.execute(params![
            record.variable_name,
            record.value,
            record.time_string,
            record.time_ms,
            extra_json,
        ])?;
    }
    Ok(inserted)
}

fn measurement_table_ddl(table: &str) -> String {
    format!(
        "
        CREATE TABLE IF NOT EXISTS {table} (
            row_id INTEGER PRIMARY KEY AUTOINCREMENT,
            var_name TEXT NOT NULL,
            var_value REAL NOT NULL,
            time_string TEXT NOT NULL,
            time_ms INTEGER NOT NULL,
            extra_json TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_natural_key
            ON {table}(var_name, time_string, var_value);
        CREATE INDEX IF NOT EXISTS idx_{table}_series
            ON {table}(var_name, time_ms);
        "
    )
}

fn table_exists_in(conn: &Connection, table_name: &str) -> Result<bool, StorageError> {
    let exists = conn
        .query_row(
            "
            SELECT 1
            FROM sqlite_master
            WHERE type='table' AND name = ?1
            LIMIT 1
            ",
            [table_name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(exists.is_some())
}

fn measurement_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MeasurementRecord> {
    let extra = match row.get::<_, Option<String>>(4)? {
        Some(extra_json) => serde_json::from_str::<BTreeMap<String, String>>(&extra_json)
            .map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?,
        None => BTreeMap::new(),
    };

    Ok(MeasurementRecord {
        variable_name: row.get(0)?,
        value: row.get(1)?,
        time_string: row.get(2)?,
        time_ms: row.get(3)?,
        extra,
    })
}

fn ledger_entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileLedgerEntry> {
    let ingested_at = parse_timestamp(row.get::<_, String>(3)?).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(FileLedgerEntry {
        file_name: row.get(0)?,
        content_hash: ContentDigest::from_hex(row.get::<_, String>(1)?),
        record_count: row.get::<_, i64>(2)?.max(0) as u64,
        ingested_at,
    })
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
