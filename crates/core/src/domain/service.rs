use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{InvalidTransition, Status, transition};
use crate::store::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
  #[default]
  Stopped,
  Starting,
  Running,
  Stopping,
  Failed,
}

impl Status for ServiceStatus {
  const ALL: &'static [Self] = &[
    ServiceStatus::Stopped,
    ServiceStatus::Starting,
    ServiceStatus::Running,
    ServiceStatus::Stopping,
    ServiceStatus::Failed,
  ];

  fn as_str(self) -> &'static str {
    match self {
      ServiceStatus::Stopped => "stopped",
      ServiceStatus::Starting => "starting",
      ServiceStatus::Running => "running",
      ServiceStatus::Stopping => "stopping",
      ServiceStatus::Failed => "failed",
    }
  }

  fn can_transition(self, to: Self) -> bool {
    use ServiceStatus::*;
    matches!(
      (self, to),
      (Stopped, Starting)
        | (Failed, Starting)
        | (Starting, Running)
        | (Starting, Failed)
        | (Running, Stopping)
        | (Stopping, Stopped)
        | (Stopping, Failed)
    )
  }

  fn is_terminal(self) -> bool {
    matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed)
  }
}

/// Environment variable declared by a service or task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
  pub name: String,
  #[serde(default)]
  pub default: Option<String>,
}

/// Merge declared variables in order: the first declaration carrying a
/// default value wins, later defaults for the same name are ignored.
/// `overrides` are applied last and always win.
pub fn merge_variables<'a, I>(
  declared: I,
  overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String>
where
  I: IntoIterator<Item = &'a Variable>,
{
  let mut env = BTreeMap::new();
  for var in declared {
    if let Some(value) = &var.default
      && !env.contains_key(&var.name)
    {
      env.insert(var.name.clone(), value.clone());
    }
  }
  for (key, value) in overrides {
    env.insert(key.clone(), value.clone());
  }
  env
}

/// Long-running supervised process with declared dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
  pub id: Id,
  pub name: String,
  pub status: ServiceStatus,
  pub command: String,
  /// Working directory; the orchestrator default when unset.
  #[serde(default)]
  pub dir: Option<PathBuf>,
  #[serde(default)]
  pub dependency_ids: Vec<Id>,
  #[serde(default)]
  pub before_hook_ids: Vec<Id>,
  #[serde(default)]
  pub after_hook_ids: Vec<Id>,
  #[serde(default)]
  pub variables: Vec<Variable>,
  #[serde(default)]
  pub pid: Option<u32>,
}

impl Service {
  pub fn new(id: Id, name: &str, command: &str) -> Self {
    Service {
      id,
      name: name.to_string(),
      status: ServiceStatus::Stopped,
      command: command.to_string(),
      dir: None,
      dependency_ids: Vec::new(),
      before_hook_ids: Vec::new(),
      after_hook_ids: Vec::new(),
      variables: Vec::new(),
      pid: None,
    }
  }

  pub fn transition_to(&mut self, status: ServiceStatus) -> Result<(), InvalidTransition> {
    transition(&mut self.status, status)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn var(name: &str, default: Option<&str>) -> Variable {
    Variable {
      name: name.to_string(),
      default: default.map(str::to_string),
    }
  }

  #[test]
  fn first_default_wins() {
    let declared = vec![
      var("PORT", None),
      var("PORT", Some("8080")),
      var("HOST", Some("localhost")),
      var("PORT", Some("9090")),
    ];
    let env = merge_variables(&declared, &BTreeMap::new());
    assert_eq!(env.get("PORT").map(String::as_str), Some("8080"));
    assert_eq!(env.get("HOST").map(String::as_str), Some("localhost"));
  }

  #[test]
  fn overrides_beat_defaults() {
    let declared = vec![var("PORT", Some("8080")), var("TOKEN", None)];
    let mut overrides = BTreeMap::new();
    overrides.insert("PORT".to_string(), "3000".to_string());
    let env = merge_variables(&declared, &overrides);
    assert_eq!(env.get("PORT").map(String::as_str), Some("3000"));
    assert!(!env.contains_key("TOKEN"));
  }

  #[test]
  fn lifecycle_table() {
    let mut svc = Service::new(Id::new("Service", ["db"]), "db", "true");
    svc.transition_to(ServiceStatus::Starting).unwrap();
    assert!(svc.transition_to(ServiceStatus::Stopping).is_err());
    svc.transition_to(ServiceStatus::Running).unwrap();
    svc.transition_to(ServiceStatus::Stopping).unwrap();
    svc.transition_to(ServiceStatus::Failed).unwrap();
    svc.transition_to(ServiceStatus::Starting).unwrap();
  }
}
