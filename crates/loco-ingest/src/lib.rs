use loco_core::ParseError;
use loco_storage::StorageError;
use thiserror::Error;

pub mod analysis;
pub mod audit;
pub mod ingestor;

pub use analysis::{AnalysisContext, IntervalError, IntervalSelection};
pub use audit::{AuditLog, AuditOptions, DEFAULT_HISTORY_LIMIT, HISTORY_PREVIEW_CHARS};
pub use ingestor::{FileOutcome, IngestionOptions, IngestionReport, Ingestor, LoadedFile};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("no valid measurement rows")]
    NoRecords,
}
