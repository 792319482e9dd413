use crate::MeasurementRecord;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSummary {
    pub variable_name: String,
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

/// Population statistics over every reading of `variable_name`, or `None` when
/// the variable has no readings.
pub fn summarize_variable(
    records: &[MeasurementRecord],
    variable_name: &str,
) -> Option<VariableSummary> {
    let values = records
        .iter()
        .filter(|record| record.variable_name == variable_name)
        .map(|record| record.value)
        .collect::<Vec<f64>>();
    if values.is_empty() {
        return None;
    }

    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let variance = values
        .iter()
        .map(|value| (value - mean).powi(2))
        .sum::<f64>()
        / count as f64;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    Some(VariableSummary {
        variable_name: variable_name.to_string(),
        count,
        mean,
        min,
        max,
        std_dev: variance.sqrt(),
    })
}
