use crate::config::Config;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "loco.log";

/// Installs the global subscriber: stderr always, plus `loco.log` under the
/// configured directory when it can be opened. `RUST_LOG` overrides the
/// configured filter. Returns false when a subscriber was already set.
pub fn init_logging(config: &Config) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    let log_file = match open_log_file(Path::new(&config.log_dir)) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };
    let plain_text = log_file.is_some();
    let writer = io::stderr.and(log_file.map(Mutex::new));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!plain_text)
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}

/// `Ok(None)` when file logging is disabled by a blank directory.
fn open_log_file(log_dir: &Path) -> io::Result<Option<File>> {
    if log_dir.as_os_str().is_empty() || log_dir.to_string_lossy().trim().is_empty() {
        return Ok(None);
    }
    fs::create_dir_all(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE_NAME))?;
    Ok(Some(file))
}
