use std::fs::File;
use std::io;
use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialise logging: a compact stdout layer for the operator plus a file
/// layer writing the run log. The log file is truncated on every start
/// (one run, one log); each line carries an ISO-8601 timestamp.
pub fn init_logging(log_path: &Path) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(log_path)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);

    let stdout_layer = fmt::layer()
        .with_writer(io::stdout)
        .with_ansi(true)
        .with_target(false);

    // File gets everything at debug level
    let file_filter = EnvFilter::try_from_env("FILE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("debug"))
        .add_directive("b2backup=debug".parse()?);

    // Console gets only info and above unless RUST_LOG says otherwise
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(file_layer.with_filter(file_filter))
        .with(stdout_layer.with_filter(console_filter))
        .init();

    tracing::debug!(log_file = %log_path.display(), "logging initialized");

    Ok(guard)
}
