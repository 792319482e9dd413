use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub mod anomaly;
pub mod encoding;
pub mod hash;
pub mod parse;
pub mod stats;

pub use anomaly::{detect_percent_changes, percent_change, AnomalyRecord, AnomalyScan, ScanStatus};
pub use encoding::{detect_encoding, DetectedEncoding, DetectionSource};
pub use hash::{
    compute_hash, hash_reader, read_hashed, sha256_hex, ContentDigest, HASH_CHUNK_BYTES,
};
pub use parse::{
    normalize_numeric, normalize_table, parse_log_bytes, parse_rows, read_measurement_file,
    read_measurements, ParseError, ParseOptions, ParsedLog, RawRow, RawTable,
};
pub use stats::{summarize_variable, VariableSummary};

/// `TimeString` layout written by the locomotive data loggers, e.g. `04.12.2024 08:56:26`.
pub const TIME_STRING_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub variable_name: String,
    pub value: f64,
    pub time_ms: i64,
    pub time_string: String,
    /// Columns outside the fixed schema, kept verbatim for downstream consumers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl MeasurementRecord {
    pub fn new(
        variable_name: impl Into<String>,
        value: f64,
        time_ms: i64,
        time_string: impl Into<String>,
    ) -> Self {
        Self {
            variable_name: variable_name.into(),
            value,
            time_ms,
            time_string: time_string.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(&self.variable_name, &self.time_string, self.value)
    }

    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        parse_time_string(&self.time_string)
    }
}

/// Row identity used for deduplication: (variable_name, time_string, value).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub variable_name: String,
    pub time_string: String,
    value_bits: u64,
}

impl NaturalKey {
    pub fn new(variable_name: &str, time_string: &str, value: f64) -> Self {
        // SQLite compares 0.0 and -0.0 as equal; keep the in-memory key consistent with it.
        let value = if value == 0.0 { 0.0 } else { value };
        Self {
            variable_name: variable_name.to_string(),
            time_string: time_string.to_string(),
            value_bits: value.to_bits(),
        }
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.value_bits)
    }
}

pub fn parse_time_string(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), TIME_STRING_FORMAT).ok()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatasetNameError {
    #[error("dataset name is empty after normalization: {0:?}")]
    Empty(String),
}

/// Logical dataset (one locomotive) and the SQL identifier derived from it.
///
/// The identifier only ever contains `[a-z0-9_]`, so it is safe to splice into
/// DDL and DML where SQLite does not accept bound parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetName {
    label: String,
    ident: String,
}

impl DatasetName {
    pub fn new(raw: &str) -> Result<Self, DatasetNameError> {
        let label = raw.trim().to_string();
        let mut ident = String::with_capacity(label.len());
        for ch in label.chars() {
            if ch.is_ascii_alphanumeric() {
                ident.push(ch.to_ascii_lowercase());
            } else if !ident.ends_with('_') {
                ident.push('_');
            }
        }
        let ident = ident.trim_matches('_').to_string();
        if ident.is_empty() {
            return Err(DatasetNameError::Empty(raw.to_string()));
        }
        Ok(Self { label, ident })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn table_name(&self) -> String {
        format!("m_{}", self.ident)
    }

    pub fn staging_table_name(&self) -> String {
        format!("staging_{}", self.ident)
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}
