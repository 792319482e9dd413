use loco_core::{DatasetName, ScanStatus};
use loco_ingest::{
    AnalysisContext, AuditOptions, FileOutcome, IngestionOptions, Ingestor,
};
use loco_storage::{LocoStore, RegisterOutcome};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const HEADER: &str = "VarName;TimeString;VarValue;Validity;Time_ms";

fn setup() -> (TempDir, LocoStore, DatasetName, Ingestor) {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = LocoStore::open(dir.path().join("db").join("loco.db")).expect("open store");
    let dataset = DatasetName::new("LOCOMOTORA 1").expect("dataset");
    (dir, store, dataset, Ingestor::new(IngestionOptions::default()))
}

fn row(name: &str, second: u32, value: &str) -> String {
    format!(
        "\"{name}\";\"04.12.2024 08:56:{second:02}\";{value};1;{}",
        u64::from(second) * 1000
    )
}

fn write_log(dir: &TempDir, name: &str, rows: &[String]) -> PathBuf {
    let path = dir.path().join(name);
    let mut body = String::from(HEADER);
    for row in rows {
        body.push('\n');
        body.push_str(row);
    }
    body.push('\n');
    fs::write(&path, body).expect("write log");
    path
}

#[test]
fn overlapping_files_load_only_their_union() {
    let (dir, store, dataset, ingestor) = setup();
    let first = write_log(
        &dir,
        "LOG0.csv",
        &[row("RPM", 1, "100"), row("RPM", 2, "110"), row("IMT", 1, "40")],
    );
    let second = write_log(
        &dir,
        "LOG1.csv",
        &[row("RPM", 2, "110"), row("IMT", 1, "40"), row("RPM", 3, "120")],
    );

    let report = ingestor.ingest_batch(&store, &dataset, &[&first, &second]);
    assert_eq!(report.registered_files(), 2);
    assert_eq!(report.newly_loaded_rows, 4);
    assert_eq!(store.measurement_count(&dataset).expect("count"), 4);

    let again = ingestor.ingest_batch(&store, &dataset, &[&first, &second]);
    assert_eq!(again.newly_loaded_rows, 0);
    assert_eq!(again.count("already_present"), 2);
    assert_eq!(store.measurement_count(&dataset).expect("count"), 4);
    assert_eq!(store.ledger_count().expect("ledger"), 2);
}

#[test]
fn renamed_copy_is_recognised_by_content() {
    let (dir, store, dataset, ingestor) = setup();
    let original = write_log(&dir, "LOG0.csv", &[row("RPM", 1, "100")]);
    let renamed = dir.path().join("LOG0 - copia.csv");
    fs::copy(&original, &renamed).expect("copy");

    assert!(ingestor.ingest_file(&store, &dataset, &original).is_registered());
    let outcome = ingestor.ingest_file(&store, &dataset, &renamed);
    assert!(matches!(outcome, FileOutcome::AlreadyPresent { ref file_name, .. } if file_name == "LOG0 - copia.csv"));

    assert_eq!(store.ledger_count().expect("ledger"), 1);
    assert_eq!(store.measurement_count(&dataset).expect("count"), 1);
}

#[test]
fn decimal_commas_feed_percent_change_detection() {
    let (dir, store, dataset, ingestor) = setup();
    let path = write_log(&dir, "LOG0.csv", &[row("RPM", 1, "12,5"), row("RPM", 2, "25,0")]);
    assert!(ingestor.ingest_file(&store, &dataset, &path).is_registered());

    let context = AnalysisContext::new(store, AuditOptions::default());
    let values = context
        .measurement_set(&dataset)
        .expect("measurements")
        .iter()
        .map(|record| record.value)
        .collect::<Vec<_>>();
    assert_eq!(values, vec![12.5, 25.0]);

    let at_boundary = context
        .detect_anomalies(&dataset, "RPM", 100.0)
        .expect("scan");
    assert_eq!(at_boundary.status, ScanStatus::Flagged);
    assert_eq!(at_boundary.anomalies[0].percent_change, 100.0);

    let above = context
        .detect_anomalies(&dataset, "RPM", 100.01)
        .expect("scan");
    assert_eq!(above.status, ScanStatus::NoneAboveThreshold);

    let unknown = context
        .detect_anomalies(&dataset, "TEMP", 10.0)
        .expect("scan");
    assert_eq!(unknown.status, ScanStatus::UnknownVariable);
    assert_eq!(context.history(10).expect("history").len(), 4);
}

#[test]
fn rows_without_value_are_dropped_before_counting() {
    let (dir, store, dataset, ingestor) = setup();
    let path = write_log(
        &dir,
        "LOG0.csv",
        &[row("RPM", 1, "10"), row("RPM", 2, ""), row("RPM", 3, "12")],
    );

    let FileOutcome::Registered(loaded) = ingestor.ingest_file(&store, &dataset, &path) else {
        panic!("expected registration");
    };
    assert_eq!(loaded.record_count, 2);
    assert_eq!(loaded.dropped_rows, 1);

    let entry = store
        .ledger_entry(&loaded.content_hash)
        .expect("ledger")
        .expect("entry");
    assert_eq!(entry.record_count, 2);
}

#[test]
fn known_digest_registration_leaves_ledger_untouched() {
    let (dir, store, dataset, ingestor) = setup();
    let path = write_log(&dir, "LOG0.csv", &[row("RPM", 1, "10"), row("RPM", 2, "11")]);
    let FileOutcome::Registered(loaded) = ingestor.ingest_file(&store, &dataset, &path) else {
        panic!("expected registration");
    };

    let outcome = store.register_file("other-name.csv", &loaded.content_hash, 999);
    assert_eq!(outcome, RegisterOutcome::AlreadyPresent);

    let entry = store
        .ledger_entry(&loaded.content_hash)
        .expect("ledger")
        .expect("entry");
    assert_eq!(entry.record_count, 2);
    assert_eq!(entry.file_name, "LOG0.csv");
}

#[test]
fn latin1_log_is_decoded_before_parsing() {
    let (dir, store, dataset, ingestor) = setup();
    let mut bytes = format!("{HEADER}\n").into_bytes();
    for second in 0..40_u32 {
        bytes.extend_from_slice(b"\"Presi\xf3n a\xe9rea de freno\";\"04.12.2024 08:56:");
        bytes.extend_from_slice(format!("{second:02}\";5,{second};1;{}\n", second * 1000).as_bytes());
    }
    let path = dir.path().join("latin1.csv");
    fs::write(&path, bytes).expect("write");

    assert!(ingestor.ingest_file(&store, &dataset, &path).is_registered());
    let names = store.variable_names(&dataset).expect("names");
    assert_eq!(names, vec!["Presión aérea de freno".to_string()]);
}
