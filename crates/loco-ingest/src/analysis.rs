use crate::audit::{AuditLog, AuditOptions};
use chrono::NaiveDateTime;
use loco_core::{
    detect_percent_changes, parse_time_string, summarize_variable, AnomalyScan, DatasetName,
    MeasurementRecord, VariableSummary,
};
use loco_storage::{ConsultationEntry, LocoStore, StorageError};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IntervalError {
    #[error("invalid {which} bound {value:?}, expected dd.mm.yyyy HH:MM:SS")]
    InvalidBound { which: &'static str, value: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalSelection {
    pub rows: Vec<MeasurementRecord>,
    /// Earliest and latest parsable timestamps in the dataset; only filled when
    /// no row falls inside the requested interval.
    pub available: Option<(NaiveDateTime, NaiveDateTime)>,
    pub unparsable_rows: usize,
}

/// Entry point for analytic consultations over persisted datasets. Every
/// consultation is written to the audit log before it runs.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    store: LocoStore,
    audit: AuditLog,
}

impl AnalysisContext {
    pub fn new(store: LocoStore, audit_options: AuditOptions) -> Self {
        let audit = AuditLog::new(store.clone(), audit_options);
        Self { store, audit }
    }

    pub fn store(&self) -> &LocoStore {
        &self.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn first_rows(
        &self,
        dataset: &DatasetName,
        limit: usize,
    ) -> Result<Vec<MeasurementRecord>, StorageError> {
        self.audit
            .append("list_rows", &json!({ "dataset": dataset.label(), "n": limit }));
        self.store.first_measurements(dataset, limit)
    }

    pub fn filter_interval(
        &self,
        dataset: &DatasetName,
        start: &str,
        end: &str,
    ) -> Result<IntervalSelection, IntervalError> {
        self.audit.append(
            "interval_filter",
            &json!({ "dataset": dataset.label(), "start": start, "end": end }),
        );

        let start_at = parse_time_string(start).ok_or_else(|| IntervalError::InvalidBound {
            which: "start",
            value: start.to_string(),
        })?;
        let end_at = parse_time_string(end).ok_or_else(|| IntervalError::InvalidBound {
            which: "end",
            value: end.to_string(),
        })?;

        let mut selection = IntervalSelection {
            rows: Vec::new(),
            available: None,
            unparsable_rows: 0,
        };
        let mut earliest: Option<NaiveDateTime> = None;
        let mut latest: Option<NaiveDateTime> = None;

        for record in self.store.measurements(dataset)? {
            let Some(at) = record.timestamp() else {
                selection.unparsable_rows += 1;
                continue;
            };
            earliest = Some(earliest.map_or(at, |current| current.min(at)));
            latest = Some(latest.map_or(at, |current| current.max(at)));
            if start_at <= at && at <= end_at {
                selection.rows.push(record);
            }
        }

        if selection.rows.is_empty() {
            selection.available = earliest.zip(latest);
        }
        debug!(
            event = "interval_filtered",
            dataset = %dataset,
            matched = selection.rows.len(),
            unparsable = selection.unparsable_rows,
        );
        Ok(selection)
    }

    pub fn variables(&self, dataset: &DatasetName) -> Result<Vec<String>, StorageError> {
        self.store.variable_names(dataset)
    }

    pub fn detect_anomalies(
        &self,
        dataset: &DatasetName,
        variable_name: &str,
        threshold: f64,
    ) -> Result<AnomalyScan, StorageError> {
        self.audit.append(
            "anomaly_scan",
            &json!({
                "dataset": dataset.label(),
                "variable": variable_name,
                "threshold": threshold,
            }),
        );
        let records = self.store.measurements(dataset)?;
        let scan = detect_percent_changes(&records, variable_name, threshold);
        debug!(
            event = "anomaly_scan",
            dataset = %dataset,
            variable = variable_name,
            status = scan.status.as_str(),
            flagged = scan.anomalies.len(),
        );
        Ok(scan)
    }

    pub fn summarize(
        &self,
        dataset: &DatasetName,
        variable_name: &str,
    ) -> Result<Option<VariableSummary>, StorageError> {
        self.audit.append(
            "variable_summary",
            &json!({ "dataset": dataset.label(), "variable": variable_name }),
        );
        let records = self.store.measurements(dataset)?;
        Ok(summarize_variable(&records, variable_name))
    }

    /// Cleaned, deduplicated measurements for model training and the assistant.
    pub fn measurement_set(
        &self,
        dataset: &DatasetName,
    ) -> Result<Vec<MeasurementRecord>, StorageError> {
        self.audit
            .append("measurement_set", &json!({ "dataset": dataset.label() }));
        self.store.measurements(dataset)
    }

    pub fn record_assistant_query(&self, question: &str, response: &str) -> Option<i64> {
        self.audit.append(
            "assistant_query",
            &json!({ "question": question, "response": response }),
        )
    }

    pub fn history(&self, limit: usize) -> Result<Vec<ConsultationEntry>, StorageError> {
        self.audit.read_recent(limit)
    }
}
