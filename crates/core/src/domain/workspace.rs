use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::store::Id;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
  pub id: Id,
  pub name: String,
  pub path: PathBuf,
  #[serde(default)]
  pub project_ids: Vec<Id>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
  #[default]
  Unknown,
  Syncing,
  Synced,
  Failed,
}

/// Repository checkout inside a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
  pub id: Id,
  pub workspace_id: Id,
  pub name: String,
  pub path: PathBuf,
  /// Remote to clone from; projects without one are never synced.
  #[serde(default)]
  pub url: Option<String>,
  /// Branch to check out after cloning.
  #[serde(default)]
  pub reference: Option<String>,
  #[serde(default)]
  pub sync_status: SyncStatus,
}
