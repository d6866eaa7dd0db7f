use std::fs;
use std::path::Path;

use super::paths::{global_config_path, project_config_path};
use super::types::{Config, PartialConfig, Result};
use super::validate::validate;

/// Load configuration by resolving the default global and project paths.
/// Project config overrides global; both override defaults.
pub fn load(project_root: Option<&Path>) -> Result<Config> {
  let project = project_root.map(project_config_path);
  load_from_paths(global_config_path().as_deref(), project.as_deref())
}

/// Load configuration from explicit file paths; missing files are skipped.
pub fn load_from_paths(global: Option<&Path>, project: Option<&Path>) -> Result<Config> {
  let mut cfg = Config::default();

  for path in [global, project].into_iter().flatten() {
    if let Ok(s) = fs::read_to_string(path) {
      let partial: PartialConfig = toml::from_str(&s)?;
      cfg = partial.merge_over(cfg);
    }
  }

  validate(&cfg)?;

  Ok(cfg)
}
