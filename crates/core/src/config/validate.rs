use super::types::{Config, ConfigError, Result};

pub(super) fn validate(cfg: &Config) -> Result<()> {
  let counts = [
    ("workers", cfg.workers as u64),
    ("history_capacity", cfg.history_capacity as u64),
    ("max_jobs", cfg.max_jobs as u64),
  ];
  for (key, value) in counts {
    if value == 0 {
      return Err(ConfigError::Zero { key });
    }
  }

  let prefix = cfg.spawn_prefix.as_str();
  if prefix.is_empty() || prefix.chars().any(char::is_whitespace) {
    return Err(ConfigError::InvalidSpawnPrefix);
  }

  Ok(())
}
