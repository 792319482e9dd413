use crate::MeasurementRecord;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub variable_name: String,
    pub time_ms: i64,
    pub time_string: String,
    pub value: f64,
    pub previous_value: f64,
    pub percent_change: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Flagged,
    NoneAboveThreshold,
    EmptyDataset,
    UnknownVariable,
    InsufficientHistory,
    InvalidThreshold,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Flagged => "flagged",
            ScanStatus::NoneAboveThreshold => "none_above_threshold",
            ScanStatus::EmptyDataset => "empty_dataset",
            ScanStatus::UnknownVariable => "unknown_variable",
            ScanStatus::InsufficientHistory => "insufficient_history",
            ScanStatus::InvalidThreshold => "invalid_threshold",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ScanStatus::Flagged => "percentage swings at or above the threshold were found",
            ScanStatus::NoneAboveThreshold => "no percentage swing reached the threshold",
            ScanStatus::EmptyDataset => "the dataset holds no measurements",
            ScanStatus::UnknownVariable => "the variable does not occur in the dataset",
            ScanStatus::InsufficientHistory => {
                "no reading has a non-zero preceding reading to compare against"
            }
            ScanStatus::InvalidThreshold => "the threshold must be a positive percentage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScan {
    pub variable_name: String,
    pub threshold: f64,
    pub status: ScanStatus,
    /// Consecutive pairs whose percent change was defined.
    pub compared_pairs: usize,
    /// Pairs skipped because the preceding reading was zero.
    pub zero_baselines: usize,
    pub anomalies: Vec<AnomalyRecord>,
}

impl AnomalyScan {
    fn empty(variable_name: &str, threshold: f64, status: ScanStatus) -> Self {
        Self {
            variable_name: variable_name.to_string(),
            threshold,
            status,
            compared_pairs: 0,
            zero_baselines: 0,
            anomalies: Vec::new(),
        }
    }
}

/// Relative change from `previous` to `current` in percent; undefined when
/// `previous` is zero.
pub fn percent_change(previous: f64, current: f64) -> Option<f64> {
    if previous == 0.0 {
        return None;
    }
    Some((current - previous) / previous * 100.0)
}

/// Flags readings of `variable_name` whose change against the immediately
/// preceding reading (ascending `time_ms`, ties in input order) is at least
/// `threshold` percent in magnitude.
pub fn detect_percent_changes(
    records: &[MeasurementRecord],
    variable_name: &str,
    threshold: f64,
) -> AnomalyScan {
    if !threshold.is_finite() || threshold <= 0.0 {
        return AnomalyScan::empty(variable_name, threshold, ScanStatus::InvalidThreshold);
    }
    if records.is_empty() {
        return AnomalyScan::empty(variable_name, threshold, ScanStatus::EmptyDataset);
    }

    let mut series = records
        .iter()
        .filter(|record| record.variable_name == variable_name)
        .collect::<Vec<&MeasurementRecord>>();
    if series.is_empty() {
        return AnomalyScan::empty(variable_name, threshold, ScanStatus::UnknownVariable);
    }
    series.sort_by_key(|record| record.time_ms);

    let mut scan = AnomalyScan::empty(variable_name, threshold, ScanStatus::InsufficientHistory);
    for pair in series.windows(2) {
        let (previous, current) = (pair[0], pair[1]);
        let Some(change) = percent_change(previous.value, current.value) else {
            scan.zero_baselines += 1;
            continue;
        };
        scan.compared_pairs += 1;
        if change.abs() >= threshold {
            scan.anomalies.push(AnomalyRecord {
                variable_name: current.variable_name.clone(),
                time_ms: current.time_ms,
                time_string: current.time_string.clone(),
                value: current.value,
                previous_value: previous.value,
                percent_change: change,
            });
        }
    }

    scan.status = if scan.compared_pairs == 0 {
        ScanStatus::InsufficientHistory
    } else if scan.anomalies.is_empty() {
        ScanStatus::NoneAboveThreshold
    } else {
        ScanStatus::Flagged
    };
    scan
}
