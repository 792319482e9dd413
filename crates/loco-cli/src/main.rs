mod config;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{load_config, ConfigFlags};
use loco_core::DatasetName;
use loco_ingest::{
    AnalysisContext, AuditOptions, FileOutcome, IngestionOptions, Ingestor,
    DEFAULT_HISTORY_LIMIT, HISTORY_PREVIEW_CHARS,
};
use loco_storage::LocoStore;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "loco")]
#[command(about = "Locomotive sensor-log ingestion and analysis", long_about = None)]
struct Cli {
    /// SQLite database file (falls back to LOCO_DB_PATH)
    #[arg(long, global = true, default_value = "")]
    db: String,
    /// Directory for loco.log (falls back to LOCO_LOG_DIR)
    #[arg(long, global = true, default_value = "")]
    log_dir: String,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load one or more sensor logs into a locomotive dataset
    Ingest {
        #[arg(long, default_value = "LOCOMOTORA 1")]
        dataset: String,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Flag percentage swings of one variable
    Anomalies {
        #[arg(long, default_value = "LOCOMOTORA 1")]
        dataset: String,
        #[arg(long)]
        variable: String,
        #[arg(long)]
        threshold: f64,
    },
    /// List the distinct variables of a dataset
    Variables {
        #[arg(long, default_value = "LOCOMOTORA 1")]
        dataset: String,
    },
    /// Show the first rows of a dataset
    Rows {
        #[arg(long, default_value = "LOCOMOTORA 1")]
        dataset: String,
        #[arg(short, long, default_value_t = 10)]
        n: usize,
    },
    /// Rows whose TimeString falls in [start, end] (dd.mm.yyyy HH:MM:SS)
    Interval {
        #[arg(long, default_value = "LOCOMOTORA 1")]
        dataset: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
    },
    /// Count, mean, min, max and deviation of one variable
    Summary {
        #[arg(long, default_value = "LOCOMOTORA 1")]
        dataset: String,
        #[arg(long)]
        variable: String,
    },
    /// Latest consultations, newest first
    History {
        #[arg(short, long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&ConfigFlags {
        db: cli.db.clone(),
        log_dir: cli.log_dir.clone(),
        debug: cli.debug,
    });
    logging::init_logging(&config);

    let store = LocoStore::open(&config.db_path)
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    info!(event = "store_opened", path = %config.db_path.display(), debug = config.debug);
    let context = AnalysisContext::new(store.clone(), AuditOptions::default());

    match cli.command {
        Commands::Ingest { dataset, paths } => {
            let dataset = dataset_name(&dataset)?;
            let report = Ingestor::new(IngestionOptions::default())
                .ingest_batch(&store, &dataset, &paths);
            for outcome in &report.outcomes {
                match outcome {
                    FileOutcome::Registered(loaded) => println!(
                        "registered {} ({} rows, {} new, encoding {})",
                        loaded.file_name, loaded.record_count, loaded.inserted_rows, loaded.encoding
                    ),
                    FileOutcome::AlreadyPresent { file_name, .. } => {
                        println!("already present {file_name}")
                    }
                    FileOutcome::IoFailure { path, reason } => {
                        println!("unreadable {}: {reason}", path.display())
                    }
                    FileOutcome::ParseFailure { file_name, reason }
                    | FileOutcome::StoreFailure { file_name, reason } => {
                        println!("{} {file_name}: {reason}", outcome.as_str())
                    }
                }
            }
            println!("{} new rows in {dataset}", report.newly_loaded_rows);
        }
        Commands::Anomalies {
            dataset,
            variable,
            threshold,
        } => {
            let dataset = dataset_name(&dataset)?;
            let scan = context
                .detect_anomalies(&dataset, &variable, threshold)
                .context("anomaly scan failed")?;
            println!("{}: {}", scan.status.as_str(), scan.status.describe());
            for anomaly in &scan.anomalies {
                println!(
                    "{}\t{}\t{} -> {}\t{:+.2}%",
                    anomaly.time_string,
                    anomaly.time_ms,
                    anomaly.previous_value,
                    anomaly.value,
                    anomaly.percent_change
                );
            }
        }
        Commands::Variables { dataset } => {
            let dataset = dataset_name(&dataset)?;
            for name in context.variables(&dataset).context("variable listing failed")? {
                println!("{name}");
            }
        }
        Commands::Rows { dataset, n } => {
            let dataset = dataset_name(&dataset)?;
            let rows = context
                .first_rows(&dataset, n)
                .context("row listing failed")?;
            for record in rows {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Commands::Interval {
            dataset,
            start,
            end,
        } => {
            let dataset = dataset_name(&dataset)?;
            let selection = context
                .filter_interval(&dataset, &start, &end)
                .context("interval filter failed")?;
            for record in &selection.rows {
                println!("{}", serde_json::to_string(record)?);
            }
            if let Some((earliest, latest)) = selection.available {
                println!("no rows in interval; data spans {earliest} to {latest}");
            }
        }
        Commands::Summary { dataset, variable } => {
            let dataset = dataset_name(&dataset)?;
            match context
                .summarize(&dataset, &variable)
                .context("summary failed")?
            {
                Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
                None => println!("{variable} does not occur in {dataset}"),
            }
        }
        Commands::History { limit } => {
            for entry in context.history(limit).context("history query failed")? {
                println!(
                    "{}\t{}\t{}",
                    entry.recorded_at.to_rfc3339(),
                    entry.query_type,
                    entry.preview(HISTORY_PREVIEW_CHARS)
                );
            }
        }
    }

    Ok(())
}

fn dataset_name(raw: &str) -> Result<DatasetName> {
    DatasetName::new(raw).with_context(|| format!("invalid dataset name {raw:?}"))
}
