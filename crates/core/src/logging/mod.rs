use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::OnceLock;

use crate::config::LogLevel;
use tracing::{info, subscriber::set_global_default};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

static WORKER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize structured JSON logging to the given `logs.jsonl` path.
/// Later calls leave the first subscriber in place. The parent directory is
/// created when missing.
pub fn init(logs_path: &Path, level: LogLevel) -> io::Result<()> {
  if let Some(parent) = logs_path.parent() {
    fs::create_dir_all(parent)?;
  }

  let file = OpenOptions::new()
    .create(true)
    .append(true)
    .open(logs_path)?;

  // Keep the guard alive for the process lifetime so buffered lines flush.
  let (nb_writer, guard) = tracing_appender::non_blocking(file);
  let _ = WORKER_GUARD.set(guard);

  let filter = EnvFilter::new(level.as_filter());

  let json_layer = fmt::layer()
    .with_timer(ChronoUtc::rfc_3339())
    .json()
    .with_current_span(true)
    .with_span_list(true)
    .with_level(true)
    .with_target(false)
    .with_thread_ids(false)
    .with_thread_names(false)
    .with_writer(move || nb_writer.clone());

  let subscriber = Registry::default().with(filter).with(json_layer);

  // Ignore error if already set
  let _ = set_global_default(subscriber);

  info!(
    event = "logging_initialized",
    logs_path = %logs_path.display(),
    level = ?level,
    "logging initialized"
  );
  Ok(())
}
