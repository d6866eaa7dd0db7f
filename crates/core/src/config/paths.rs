use std::path::{Path, PathBuf};

/// Location of the global config file (~/.config/workbench/config.toml)
pub fn global_config_path() -> Option<PathBuf> {
  dirs::config_dir().map(|p| p.join("workbench").join("config.toml"))
}

/// Project state directory (./.workbench)
pub fn workbench_dir(project_root: &Path) -> PathBuf {
  project_root.join(".workbench")
}

/// Location of the project config file (./.workbench/config.toml)
pub fn project_config_path(project_root: &Path) -> PathBuf {
  workbench_dir(project_root).join("config.toml")
}

/// Location of the entity catalog (./.workbench/catalog.toml)
pub fn catalog_path(project_root: &Path) -> PathBuf {
  workbench_dir(project_root).join("catalog.toml")
}

/// Location of the structured log file (./.workbench/logs.jsonl)
pub fn logs_path(project_root: &Path) -> PathBuf {
  workbench_dir(project_root).join("logs.jsonl")
}
