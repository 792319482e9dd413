use crate::encoding::{decode, detect_encoding};
use crate::MeasurementRecord;
use encoding_rs::{Encoding, UTF_8};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

pub const COLUMN_VAR_NAME: &str = "VarName";
pub const COLUMN_VAR_VALUE: &str = "VarValue";
pub const COLUMN_TIME_STRING: &str = "TimeString";
pub const COLUMN_TIME_MS: &str = "Time_ms";
pub const REQUIRED_COLUMNS: [&str; 4] = [
    COLUMN_VAR_NAME,
    COLUMN_VAR_VALUE,
    COLUMN_TIME_STRING,
    COLUMN_TIME_MS,
];
pub const DEFAULT_SAMPLE_BYTES: usize = 10_000;

const DELIMITER: u8 = b';';
const QUOTE: u8 = b'"';

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("header row is missing required columns: {}", missing.join(", "))]
    MissingColumns { missing: Vec<&'static str> },
    #[error("csv error: {0}")]
    Csv(String),
}

#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub sample_bytes: usize,
    pub default_encoding: &'static Encoding,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            sample_bytes: DEFAULT_SAMPLE_BYTES,
            default_encoding: UTF_8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub line: u64,
    pub fields: Vec<String>,
}

impl RawRow {
    fn field(&self, index: usize) -> Option<&str> {
        self.fields
            .get(index)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
    pub skipped_lines: usize,
}

impl RawTable {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLog {
    pub encoding: &'static str,
    pub records: Vec<MeasurementRecord>,
    /// Lines the tokenizer could not split into a well-formed row.
    pub skipped_lines: usize,
    /// Well-formed rows dropped for a missing name, value or timestamp.
    pub dropped_rows: usize,
}

/// Comma or dot decimal separator; anything unparsable or non-finite is missing.
pub fn normalize_numeric(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

/// Splits decoded text into header and rows. Rows wider than the header are
/// malformed and skipped; shorter rows are kept and read as missing cells.
pub fn parse_rows(text: &str) -> Result<RawTable, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(DELIMITER)
        .quote(QUOTE)
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|err| ParseError::Csv(err.to_string()))?
        .iter()
        .map(clean_header)
        .collect::<Vec<String>>();

    let mut table = RawTable {
        headers,
        ..RawTable::default()
    };

    for result in reader.records() {
        let record = match result {
            Ok(record) => record,
            Err(_) => {
                table.skipped_lines += 1;
                continue;
            }
        };

        if record.len() > table.headers.len() {
            table.skipped_lines += 1;
            continue;
        }

        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }

        table.rows.push(RawRow {
            line: record.position().map_or(0, |position| position.line()),
            fields: record.iter().map(|field| field.trim().to_string()).collect(),
        });
    }

    Ok(table)
}

/// Validates the fixed schema and turns raw rows into measurement records.
pub fn normalize_table(table: RawTable) -> Result<(Vec<MeasurementRecord>, usize), ParseError> {
    let missing = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|column| table.column(column).is_none())
        .collect::<Vec<&'static str>>();
    if !missing.is_empty() {
        return Err(ParseError::MissingColumns { missing });
    }

    let name_index = table.column(COLUMN_VAR_NAME).unwrap_or_default();
    let value_index = table.column(COLUMN_VAR_VALUE).unwrap_or_default();
    let time_string_index = table.column(COLUMN_TIME_STRING).unwrap_or_default();
    let time_ms_index = table.column(COLUMN_TIME_MS).unwrap_or_default();
    let fixed = [name_index, value_index, time_string_index, time_ms_index];

    let mut records = Vec::with_capacity(table.rows.len());
    let mut dropped = 0_usize;

    for row in &table.rows {
        let Some(variable_name) = row.field(name_index) else {
            dropped += 1;
            continue;
        };
        let Some(value) = row.field(value_index).and_then(normalize_numeric) else {
            dropped += 1;
            continue;
        };
        let Some(time_ms) = row
            .field(time_ms_index)
            .and_then(normalize_numeric)
            .and_then(millis_from_f64)
        else {
            dropped += 1;
            continue;
        };

        let extra = table
            .headers
            .iter()
            .enumerate()
            .filter(|(index, header)| !fixed.contains(index) && !header.is_empty())
            .filter_map(|(index, header)| {
                row.field(index)
                    .map(|value| (header.clone(), value.to_string()))
            })
            .collect::<BTreeMap<String, String>>();

        records.push(MeasurementRecord {
            variable_name: variable_name.to_string(),
            value,
            time_ms,
            time_string: row.field(time_string_index).unwrap_or_default().to_string(),
            extra,
        });
    }

    Ok((records, dropped))
}

pub fn parse_log_bytes(bytes: &[u8], options: &ParseOptions) -> Result<ParsedLog, ParseError> {
    let sample = &bytes[..bytes.len().min(options.sample_bytes)];
    let detected = detect_encoding(sample, sample.len() == bytes.len(), options.default_encoding);
    let text = decode(bytes, detected.encoding);

    let table = parse_rows(&text)?;
    let skipped_lines = table.skipped_lines;
    let (records, dropped_rows) = normalize_table(table)?;

    Ok(ParsedLog {
        encoding: detected.label(),
        records,
        skipped_lines,
        dropped_rows,
    })
}

pub fn read_measurements<R: Read>(
    mut reader: R,
    options: &ParseOptions,
) -> Result<ParsedLog, ParseError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    parse_log_bytes(&bytes, options)
}

pub fn read_measurement_file(
    path: impl AsRef<Path>,
    options: &ParseOptions,
) -> Result<ParsedLog, ParseError> {
    let file = File::open(path)?;
    read_measurements(file, options)
}

fn clean_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .trim()
        .trim_matches('"')
        .trim()
        .to_string()
}

fn millis_from_f64(value: f64) -> Option<i64> {
    let rounded = value.round();
    if rounded >= i64::MIN as f64 && rounded < i64::MAX as f64 {
        Some(rounded as i64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "\"VarName\";\"TimeString\";\"VarValue\";\"Validity\";\"Time_ms\"\n";

    fn log(lines: &[&str]) -> String {
        let mut text = HEADER.to_string();
        for line in lines {
            text.push_str(line);
            text.push('\n');
        }
        text
    }

    #[test]
    fn normalize_numeric_accepts_comma_and_dot_decimals() {
        assert_eq!(normalize_numeric("12,5"), Some(12.5));
        assert_eq!(normalize_numeric(" 12.5 "), Some(12.5));
        assert_eq!(normalize_numeric("-3"), Some(-3.0));
        assert_eq!(normalize_numeric(""), None);
        assert_eq!(normalize_numeric("abc"), None);
        assert_eq!(normalize_numeric("1.234,5"), None);
        assert_eq!(normalize_numeric("NaN"), None);
        assert_eq!(normalize_numeric("inf"), None);
    }

    #[test]
    fn parses_quoted_semicolon_rows_into_records() {
        let text = log(&[
            "\"RPM - 7KF00\";\"04.12.2024 08:56:26\";\"12,5\";1;45630371527,7778",
            "\"RPM - 7KF00\";\"04.12.2024 08:56:27\";\"25,0\";1;45630371528,7778",
        ]);
        let parsed = parse_log_bytes(text.as_bytes(), &ParseOptions::default()).expect("parse");

        assert_eq!(parsed.encoding, "UTF-8");
        assert_eq!(parsed.records.len(), 2);
        let first = &parsed.records[0];
        assert_eq!(first.variable_name, "RPM - 7KF00");
        assert_eq!(first.value, 12.5);
        assert_eq!(first.time_string, "04.12.2024 08:56:26");
        assert_eq!(first.time_ms, 45_630_371_528);
        assert_eq!(first.extra.get("Validity").map(String::as_str), Some("1"));
        assert_eq!(parsed.records[1].value, 25.0);
    }

    #[test]
    fn rows_missing_name_or_value_are_dropped_before_counting() {
        let text = log(&[
            "\"RPM\";\"04.12.2024 08:56:26\";\"12,5\";1;1000",
            "\"RPM\";\"04.12.2024 08:56:27\";\"\";1;2000",
            "\"\";\"04.12.2024 08:56:28\";\"3,0\";1;3000",
            "\"RPM\";\"04.12.2024 08:56:29\";\"n/a\";1;4000",
            "\"RPM\";\"04.12.2024 08:56:30\";\"4,0\";1;",
        ]);
        let parsed = parse_log_bytes(text.as_bytes(), &ParseOptions::default()).expect("parse");

        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.dropped_rows, 4);
        assert!(parsed
            .records
            .iter()
            .all(|record| !record.variable_name.is_empty() && record.value.is_finite()));
    }

    #[test]
    fn overlong_lines_are_skipped_without_failing_the_file() {
        let text = log(&[
            "\"RPM\";\"04.12.2024 08:56:26\";\"1,0\";1;1000",
            "\"RPM\";\"04.12.2024 08:56:27\";\"2,0\";1;2000;surplus;cells",
            "\"RPM\";\"04.12.2024 08:56:28\";\"3,0\";1;3000",
        ]);
        let table = parse_rows(&text).expect("parse rows");
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.skipped_lines, 1);
        assert_eq!(table.rows[1].line, 4);
    }

    #[test]
    fn missing_required_columns_fail_the_file() {
        let text = "\"VarName\";\"VarValue\"\n\"RPM\";\"1,0\"\n";
        let err = parse_log_bytes(text.as_bytes(), &ParseOptions::default())
            .expect_err("missing columns");
        match err {
            ParseError::MissingColumns { missing } => {
                assert_eq!(missing, vec![COLUMN_TIME_STRING, COLUMN_TIME_MS]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bom_prefixed_header_is_recognized() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(log(&["\"RPM\";\"t\";\"1\";1;10"]).as_bytes());
        let parsed = parse_log_bytes(&bytes, &ParseOptions::default()).expect("parse");
        assert_eq!(parsed.records.len(), 1);
    }

    #[test]
    fn reader_input_is_accepted() {
        let text = log(&["\"RPM\";\"t\";\"7,25\";1;10"]);
        let parsed =
            read_measurements(text.as_bytes(), &ParseOptions::default()).expect("parse reader");
        assert_eq!(parsed.records[0].value, 7.25);
    }
}
