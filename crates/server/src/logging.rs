//! Structured logging for the Cowork server.
//!
//! Everything goes to `<data dir>/logs/server.log`; stdout stays quiet so the
//! server can run under a UI process without interleaving output.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::paths::DataPaths;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";

/// Keeps the file writer flushing until dropped.
pub struct LoggingHandle {
    pub run_id: String,
    _guard: WorkerGuard,
}

pub fn init_logging(paths: &DataPaths) -> anyhow::Result<LoggingHandle> {
    let log_dir = paths.log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let log_path = paths.log_path();

    if std::env::var("COWORK_TRUNCATE_LOG_ON_START").as_deref() == Ok("1") {
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;
    }

    let filter_spec = filter_spec(
        std::env::var("COWORK_LOG_FILTER").ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let filter = EnvFilter::try_new(&filter_spec).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let file_appender = tracing_appender::rolling::never(&log_dir, DataPaths::LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let format = std::env::var("COWORK_LOG_FORMAT").unwrap_or_else(|_| "json".into());

    let registry = tracing_subscriber::registry().with(filter);
    if format.eq_ignore_ascii_case("pretty") {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()?;
    }

    let run_id = std::env::var("COWORK_RUN_ID").unwrap_or_else(|_| process_run_id());

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_path.display(),
        data_dir = %paths.root().display(),
        db_path = %paths.db_path().display(),
        format = %format,
        run_id = %run_id,
        filter = %filter_spec,
    );

    Ok(LoggingHandle {
        run_id,
        _guard: guard,
    })
}

/// `COWORK_LOG_FILTER` beats `RUST_LOG`; blank values are skipped.
fn filter_spec(cowork_filter: Option<String>, rust_log: Option<String>) -> String {
    [cowork_filter, rust_log]
        .into_iter()
        .flatten()
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty() && EnvFilter::try_new(value).is_ok())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Tags every line of one server process so restarts can be told apart.
fn process_run_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("pid-{}-{}", std::process::id(), now)
}
