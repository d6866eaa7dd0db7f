mod load;
mod paths;
mod types;
mod validate;
mod write;

pub use load::{load, load_from_paths};
pub use paths::{catalog_path, global_config_path, logs_path, project_config_path, workbench_dir};
pub use types::{Config, ConfigError, LogLevel, Result};
pub use write::write_default_project_config;
