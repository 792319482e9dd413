use chrono::Utc;
use loco_storage::{ConsultationEntry, LocoStore, StorageError};
use serde_json::Value;
use tracing::warn;

pub const DEFAULT_MAX_PARAMETER_CHARS: usize = 1500;
pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const HISTORY_PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone)]
pub struct AuditOptions {
    pub max_parameter_chars: usize,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            max_parameter_chars: DEFAULT_MAX_PARAMETER_CHARS,
        }
    }
}

/// Append-only record of analytic consultations.
///
/// Writes are best-effort: a failing append is logged and swallowed so the
/// consultation it describes still returns its result.
#[derive(Debug, Clone)]
pub struct AuditLog {
    store: LocoStore,
    options: AuditOptions,
}

impl AuditLog {
    pub fn new(store: LocoStore, options: AuditOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &AuditOptions {
        &self.options
    }

    /// Returns the new entry id, or `None` when the write was dropped.
    pub fn append(&self, query_type: &str, parameters: &Value) -> Option<i64> {
        let serialized = truncate_chars(&parameters.to_string(), self.options.max_parameter_chars);
        match self
            .store
            .append_consultation(query_type, &serialized, Utc::now())
        {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(
                    event = "audit_append_failed",
                    query_type,
                    error = %err,
                );
                None
            }
        }
    }

    pub fn read_recent(&self, limit: usize) -> Result<Vec<ConsultationEntry>, StorageError> {
        self.store.recent_consultations(limit)
    }
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((byte_index, _)) => value[..byte_index].to_string(),
        None => value.to_string(),
    }
}
