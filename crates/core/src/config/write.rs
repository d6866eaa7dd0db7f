use std::path::Path;

use super::paths::project_config_path;
use super::types::Config;

/// Write a default project config if it does not exist yet.
pub fn write_default_project_config(project_root: &Path) -> std::io::Result<()> {
  let path = project_config_path(project_root);
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  if !path.exists() {
    let cfg = Config::default();
    let s = toml::to_string_pretty(&cfg).map_err(std::io::Error::other)?;
    std::fs::write(&path, s)?;
  }
  Ok(())
}
