use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Log level for the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Off,
  Warn,
  #[default]
  Info,
  Debug,
  Trace,
}

impl LogLevel {
  pub fn as_filter(self) -> &'static str {
    match self {
      LogLevel::Off => "off",
      LogLevel::Warn => "warn",
      LogLevel::Info => "info",
      LogLevel::Debug => "debug",
      LogLevel::Trace => "trace",
    }
  }
}

/// Effective configuration after merging defaults, global, and project config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
  pub log_level: LogLevel,
  /// Concurrent work queue workers (defaults to 4)
  pub workers: usize,
  /// Messages kept for replay by the event bus (defaults to 1000)
  pub history_capacity: usize,
  /// Jobs retained before the oldest finished ones are dropped (defaults to 1000)
  pub max_jobs: usize,
  /// Deadline for stopping services on shutdown (defaults to 10)
  pub shutdown_timeout_secs: u64,
  /// Leading word that detaches a task command (defaults to "spawn")
  pub spawn_prefix: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      log_level: LogLevel::Info,
      workers: 4,
      history_capacity: 1000,
      max_jobs: 1000,
      shutdown_timeout_secs: 10,
      spawn_prefix: "spawn".to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(super) struct PartialConfig {
  pub log_level: Option<LogLevel>,
  pub workers: Option<usize>,
  pub history_capacity: Option<usize>,
  pub max_jobs: Option<usize>,
  pub shutdown_timeout_secs: Option<u64>,
  pub spawn_prefix: Option<String>,
}

impl PartialConfig {
  pub(super) fn merge_over(self, base: Config) -> Config {
    let PartialConfig {
      log_level,
      workers,
      history_capacity,
      max_jobs,
      shutdown_timeout_secs,
      spawn_prefix,
    } = self;

    Config {
      log_level: log_level.unwrap_or(base.log_level),
      workers: workers.unwrap_or(base.workers),
      history_capacity: history_capacity.unwrap_or(base.history_capacity),
      max_jobs: max_jobs.unwrap_or(base.max_jobs),
      shutdown_timeout_secs: shutdown_timeout_secs.unwrap_or(base.shutdown_timeout_secs),
      spawn_prefix: spawn_prefix.unwrap_or(base.spawn_prefix),
    }
  }
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("io: {0}")]
  Io(#[from] std::io::Error),
  #[error("toml: {0}")]
  Toml(#[from] toml::de::Error),
  #[error("`{key}` must be greater than zero")]
  Zero { key: &'static str },
  #[error("`spawn_prefix` must be a single non-empty word")]
  InvalidSpawnPrefix,
}

pub type Result<T> = std::result::Result<T, ConfigError>;
