//! Log setup for the command line tool.

use std::env;
use std::path::PathBuf;

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "contrib_cache=info";

/// Directory of the rolling log files.
pub fn log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir().ok_or_else(|| eyre!("Could not determine data directory"))?;
  Ok(data_dir.join("contrib-cache").join("logs"))
}

fn filter() -> EnvFilter {
  let directives = env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string());
  EnvFilter::new(directives)
}

/// Initializes logging.
///
/// Events go to a daily rolling file under [`log_dir`]; with `verbose` they
/// are also written to stderr. `RUST_LOG` overrides the default filter. The
/// returned guard must be held until exit so buffered lines reach the file.
pub fn init_logging(verbose: bool) -> Result<WorkerGuard> {
  let dir = log_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, "contrib-cache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let file_layer = tracing_subscriber::fmt::layer()
    .with_writer(writer)
    .with_ansi(false)
    .with_target(true)
    .with_filter(filter());

  let stderr_layer = verbose.then(|| {
    tracing_subscriber::fmt::layer()
      .compact()
      .with_writer(std::io::stderr)
      .with_filter(filter())
  });

  tracing_subscriber::registry()
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
