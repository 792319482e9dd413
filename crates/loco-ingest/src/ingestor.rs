use crate::IngestError;
use loco_core::{
    parse_log_bytes, read_hashed, ContentDigest, DatasetName, MeasurementRecord, NaturalKey,
    ParseError, ParseOptions, ParsedLog,
};
use loco_storage::{CommitOutcome, LocoStore};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct IngestionOptions {
    pub parse: ParseOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedFile {
    pub file_name: String,
    pub content_hash: ContentDigest,
    pub encoding: &'static str,
    /// Valid rows in the file, before deduplication against other rows.
    pub record_count: usize,
    pub inserted_rows: usize,
    pub skipped_lines: usize,
    pub dropped_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Registered(LoadedFile),
    AlreadyPresent {
        file_name: String,
        content_hash: ContentDigest,
    },
    IoFailure {
        path: PathBuf,
        reason: String,
    },
    ParseFailure {
        file_name: String,
        reason: String,
    },
    StoreFailure {
        file_name: String,
        reason: String,
    },
}

impl FileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOutcome::Registered(_) => "registered",
            FileOutcome::AlreadyPresent { .. } => "already_present",
            FileOutcome::IoFailure { .. } => "io_failure",
            FileOutcome::ParseFailure { .. } => "parse_failure",
            FileOutcome::StoreFailure { .. } => "store_failure",
        }
    }

    pub fn file_name(&self) -> String {
        match self {
            FileOutcome::Registered(loaded) => loaded.file_name.clone(),
            FileOutcome::AlreadyPresent { file_name, .. }
            | FileOutcome::ParseFailure { file_name, .. }
            | FileOutcome::StoreFailure { file_name, .. } => file_name.clone(),
            FileOutcome::IoFailure { path, .. } => display_name(path),
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, FileOutcome::Registered(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestionReport {
    pub outcomes: Vec<FileOutcome>,
    /// Rows that were absent from the dataset before this run.
    pub newly_loaded_rows: usize,
}

impl IngestionReport {
    pub fn registered_files(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.is_registered())
            .count()
    }

    pub fn count(&self, status: &str) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.as_str() == status)
            .count()
    }
}

struct PreparedFile {
    file_name: String,
    digest: ContentDigest,
    parsed: ParsedLog,
}

/// Loads sensor logs into a dataset: fingerprint, parse, then register and
/// merge each file in one store transaction.
pub struct Ingestor {
    options: IngestionOptions,
}

impl Ingestor {
    pub fn new(options: IngestionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &IngestionOptions {
        &self.options
    }

    pub fn ingest_file(
        &self,
        store: &LocoStore,
        dataset: &DatasetName,
        path: impl AsRef<Path>,
    ) -> FileOutcome {
        let mut claimed = HashSet::new();
        let path = path.as_ref();
        match self.prepare_path(path) {
            Ok(prepared) => self.commit(store, dataset, prepared, &mut claimed),
            Err(err) => classify_prepare_error(path, err),
        }
    }

    pub fn ingest_reader<R: Read>(
        &self,
        store: &LocoStore,
        dataset: &DatasetName,
        file_name: &str,
        reader: R,
    ) -> FileOutcome {
        let mut claimed = HashSet::new();
        match self.prepare(file_name.to_string(), reader) {
            Ok(prepared) => self.commit(store, dataset, prepared, &mut claimed),
            Err(err) => classify_prepare_error(Path::new(file_name), err),
        }
    }

    /// Loads several files into one dataset. Rows already contributed by an
    /// earlier file of the batch are not offered again; every file is still
    /// registered on its own, and one file's failure never stops the rest.
    pub fn ingest_batch<P: AsRef<Path>>(
        &self,
        store: &LocoStore,
        dataset: &DatasetName,
        paths: &[P],
    ) -> IngestionReport {
        let mut claimed = HashSet::new();
        let mut report = IngestionReport::default();

        for path in paths {
            let path = path.as_ref();
            let outcome = match self.prepare_path(path) {
                Ok(prepared) => self.commit(store, dataset, prepared, &mut claimed),
                Err(err) => classify_prepare_error(path, err),
            };
            if let FileOutcome::Registered(loaded) = &outcome {
                report.newly_loaded_rows += loaded.inserted_rows;
            }
            report.outcomes.push(outcome);
        }

        info!(
            event = "batch_ingested",
            dataset = %dataset,
            files = report.outcomes.len(),
            registered = report.registered_files(),
            newly_loaded_rows = report.newly_loaded_rows,
        );
        report
    }

    fn prepare_path(&self, path: &Path) -> Result<PreparedFile, IngestError> {
        let file = File::open(path)?;
        self.prepare(display_name(path), file)
    }

    /// Hashes and parses one read of the input, so the registered digest
    /// identifies exactly the bytes whose rows are stored.
    fn prepare<R: Read>(&self, file_name: String, reader: R) -> Result<PreparedFile, IngestError> {
        let (bytes, digest) = read_hashed(reader)?;
        let parsed = ensure_records(parse_log_bytes(&bytes, &self.options.parse)?)?;
        Ok(PreparedFile {
            file_name,
            digest,
            parsed,
        })
    }

    fn commit(
        &self,
        store: &LocoStore,
        dataset: &DatasetName,
        prepared: PreparedFile,
        claimed: &mut HashSet<NaturalKey>,
    ) -> FileOutcome {
        let PreparedFile {
            file_name,
            digest,
            parsed,
        } = prepared;
        let record_count = parsed.records.len();
        if parsed.dropped_rows > 0 || parsed.skipped_lines > 0 {
            debug!(
                event = "rows_discarded",
                file = %file_name,
                dropped_rows = parsed.dropped_rows,
                skipped_lines = parsed.skipped_lines,
            );
        }

        let mut offered_keys = HashSet::new();
        let offered = parsed
            .records
            .into_iter()
            .filter(|record| {
                let key = record.natural_key();
                !claimed.contains(&key) && offered_keys.insert(key)
            })
            .collect::<Vec<MeasurementRecord>>();

        match store.commit_file(dataset, &file_name, &digest, record_count as u64, &offered) {
            Ok(CommitOutcome::Committed { merge, .. }) => {
                claimed.extend(offered_keys);
                info!(
                    event = "file_registered",
                    dataset = %dataset,
                    file = %file_name,
                    hash = %digest.short(),
                    encoding = parsed.encoding,
                    records = record_count,
                    inserted = merge.inserted_rows,
                    created_table = merge.created_table,
                );
                FileOutcome::Registered(LoadedFile {
                    file_name,
                    content_hash: digest,
                    encoding: parsed.encoding,
                    record_count,
                    inserted_rows: merge.inserted_rows,
                    skipped_lines: parsed.skipped_lines,
                    dropped_rows: parsed.dropped_rows,
                })
            }
            Ok(CommitOutcome::AlreadyPresent) => {
                info!(
                    event = "file_already_present",
                    file = %file_name,
                    hash = %digest.short(),
                );
                FileOutcome::AlreadyPresent {
                    file_name,
                    content_hash: digest,
                }
            }
            Err(err) => {
                warn!(
                    event = "file_store_failed",
                    dataset = %dataset,
                    file = %file_name,
                    error = %err,
                );
                FileOutcome::StoreFailure {
                    file_name,
                    reason: err.to_string(),
                }
            }
        }
    }
}

fn ensure_records(parsed: ParsedLog) -> Result<ParsedLog, IngestError> {
    if parsed.records.is_empty() {
        return Err(IngestError::NoRecords);
    }
    Ok(parsed)
}

fn classify_prepare_error(path: &Path, err: IngestError) -> FileOutcome {
    let reason = err.to_string();
    match err {
        IngestError::Io(_) | IngestError::Parse(ParseError::Io(_)) => {
            warn!(event = "file_unreadable", path = %path.display(), error = %reason);
            FileOutcome::IoFailure {
                path: path.to_path_buf(),
                reason,
            }
        }
        IngestError::Storage(_) => {
            warn!(event = "file_store_failed", path = %path.display(), error = %reason);
            FileOutcome::StoreFailure {
                file_name: display_name(path),
                reason,
            }
        }
        IngestError::Parse(_) | IngestError::NoRecords => {
            warn!(event = "file_unparsable", path = %path.display(), error = %reason);
            FileOutcome::ParseFailure {
                file_name: display_name(path),
                reason,
            }
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
