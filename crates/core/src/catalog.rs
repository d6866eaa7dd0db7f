//! Static definitions loaded from `.workbench/catalog.toml`.
//!
//! ```toml
//! [[workspaces]]
//! name = "main"
//! path = "src"
//!
//! [[workspaces.projects]]
//! name = "api"
//! url = "https://example.com/api.git"
//!
//! [[services]]
//! name = "api"
//! command = "cargo run"
//! dir = "src/api"
//! needs = ["db"]
//! before = ["migrate"]
//! variables = [{ name = "PORT", default = "8080" }]
//!
//! [[tasks]]
//! name = "migrate"
//! [[tasks.steps]]
//! commands = ["make migrate"]
//! projects = ["main/api"]
//! ```
//!
//! Relative paths resolve against the root passed to [`Catalog::install`].
//! References are checked before anything is stored; dependency cycles are
//! left to [`ServiceOrchestrator::start`](crate::service::ServiceOrchestrator::start).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::domain::{Command, Node, Project, Service, Step, SyncStatus, Task, Variable, Workspace};
use crate::store::{EntityStore, Id};

#[derive(Debug, Error)]
pub enum CatalogError {
  #[error("io: {0}")]
  Io(#[from] std::io::Error),
  #[error("toml: {0}")]
  Toml(#[from] toml::de::Error),
  #[error("duplicate {kind} `{name}`")]
  Duplicate { kind: &'static str, name: String },
  #[error("{owner} refers to unknown {kind} `{name}`")]
  UnknownReference {
    owner: String,
    kind: &'static str,
    name: String,
  },
  #[error("{kind} name `{name}` must be non-empty and free of `:` and `/`")]
  InvalidName { kind: &'static str, name: String },
  #[error("project reference `{0}` must look like `workspace/project`")]
  MalformedProjectReference(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Catalog {
  #[serde(default)]
  pub workspaces: Vec<WorkspaceDef>,
  #[serde(default)]
  pub services: Vec<ServiceDef>,
  #[serde(default)]
  pub tasks: Vec<TaskDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceDef {
  pub name: String,
  pub path: PathBuf,
  #[serde(default)]
  pub projects: Vec<ProjectDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectDef {
  pub name: String,
  /// Checkout directory, relative to the workspace; defaults to `name`.
  #[serde(default)]
  pub path: Option<PathBuf>,
  #[serde(default)]
  pub url: Option<String>,
  #[serde(default)]
  pub reference: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDef {
  pub name: String,
  pub command: String,
  #[serde(default)]
  pub dir: Option<PathBuf>,
  /// Services that must be running first.
  #[serde(default)]
  pub needs: Vec<String>,
  /// Tasks run before the process is spawned.
  #[serde(default)]
  pub before: Vec<String>,
  /// Tasks run after the process exits.
  #[serde(default)]
  pub after: Vec<String>,
  #[serde(default)]
  pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDef {
  pub name: String,
  #[serde(default)]
  pub variables: Vec<Variable>,
  #[serde(default)]
  pub steps: Vec<StepDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDef {
  pub commands: Vec<String>,
  /// `workspace/project` references; empty runs once in the default directory.
  #[serde(default)]
  pub projects: Vec<String>,
}

pub fn service_id(name: &str) -> Id {
  Id::new(Service::KIND, [name])
}

pub fn task_id(name: &str) -> Id {
  Id::new(Task::KIND, [name])
}

pub fn workspace_id(name: &str) -> Id {
  Id::new(Workspace::KIND, [name])
}

pub fn project_id(workspace: &str, name: &str) -> Id {
  Id::new(Project::KIND, [workspace, name])
}

impl Catalog {
  pub fn from_toml_str(s: &str) -> Result<Self, CatalogError> {
    Ok(toml::from_str(s)?)
  }

  /// Read a catalog file; a missing file is an empty catalog.
  pub fn load(path: &Path) -> Result<Self, CatalogError> {
    match fs::read_to_string(path) {
      Ok(s) => Self::from_toml_str(&s),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
      Err(e) => Err(e.into()),
    }
  }

  pub fn validate(&self) -> Result<(), CatalogError> {
    let mut projects = HashSet::new();
    let mut workspaces = HashSet::new();
    for ws in &self.workspaces {
      valid_name("workspace", &ws.name)?;
      unique(&mut workspaces, "workspace", &ws.name)?;
      for p in &ws.projects {
        valid_name("project", &p.name)?;
        unique(&mut projects, "project", &format!("{}/{}", ws.name, p.name))?;
      }
    }
    let mut tasks = HashSet::new();
    for task in &self.tasks {
      valid_name("task", &task.name)?;
      unique(&mut tasks, "task", &task.name)?;
    }
    let mut services = HashSet::new();
    for service in &self.services {
      valid_name("service", &service.name)?;
      unique(&mut services, "service", &service.name)?;
    }

    for task in &self.tasks {
      for step in &task.steps {
        for reference in &step.projects {
          split_project(reference)?;
          known(&projects, "project", reference, || format!("task `{}`", task.name))?;
        }
      }
    }
    for service in &self.services {
      let owner = || format!("service `{}`", service.name);
      for dep in &service.needs {
        known(&services, "service", dep, owner)?;
      }
      for hook in service.before.iter().chain(&service.after) {
        known(&tasks, "task", hook, owner)?;
      }
    }
    Ok(())
  }

  /// Validate, then store every definition as an entity.
  pub fn install(&self, store: &EntityStore, root: &Path) -> Result<(), CatalogError> {
    self.validate()?;

    for ws in &self.workspaces {
      let ws_path = root.join(&ws.path);
      let mut workspace = Workspace {
        id: workspace_id(&ws.name),
        name: ws.name.clone(),
        path: ws_path.clone(),
        project_ids: Vec::new(),
      };
      for p in &ws.projects {
        let project = Project {
          id: project_id(&ws.name, &p.name),
          workspace_id: workspace.id.clone(),
          name: p.name.clone(),
          path: ws_path.join(p.path.as_deref().unwrap_or(Path::new(&p.name))),
          url: p.url.clone(),
          reference: p.reference.clone(),
          sync_status: SyncStatus::Unknown,
        };
        workspace.project_ids.push(project.id.clone());
        store.store(project);
      }
      store.store(workspace);
    }

    for def in &self.tasks {
      let mut task = Task::new(task_id(&def.name), &def.name);
      task.variables = def.variables.clone();
      for (s, step_def) in def.steps.iter().enumerate() {
        let s = s.to_string();
        let mut step = Step {
          id: Id::new(Step::KIND, [def.name.as_str(), s.as_str()]),
          task_id: task.id.clone(),
          command_ids: Vec::new(),
          project_ids: Vec::new(),
        };
        for (c, run) in step_def.commands.iter().enumerate() {
          let c = c.to_string();
          let command = Command::new(Id::new(Command::KIND, [def.name.as_str(), s.as_str(), c.as_str()]), run);
          step.command_ids.push(command.id.clone());
          store.store(command);
        }
        for reference in &step_def.projects {
          let (ws, name) = split_project(reference)?;
          step.project_ids.push(project_id(ws, name));
        }
        task.step_ids.push(step.id.clone());
        store.store(step);
      }
      store.store(task);
    }

    for def in &self.services {
      let mut service = Service::new(service_id(&def.name), &def.name, &def.command);
      service.dir = def.dir.as_ref().map(|d| root.join(d));
      service.dependency_ids = def.needs.iter().map(|n| service_id(n)).collect();
      service.before_hook_ids = def.before.iter().map(|n| task_id(n)).collect();
      service.after_hook_ids = def.after.iter().map(|n| task_id(n)).collect();
      service.variables = def.variables.clone();
      store.store(service);
    }

    info!(
      event = "catalog_installed",
      workspaces = self.workspaces.len(),
      services = self.services.len(),
      tasks = self.tasks.len()
    );
    Ok(())
  }
}

/// Names become ID keys, where `:` separates the parts.
fn valid_name(kind: &'static str, name: &str) -> Result<(), CatalogError> {
  if name.is_empty() || name.contains([':', '/']) {
    return Err(CatalogError::InvalidName {
      kind,
      name: name.to_string(),
    });
  }
  Ok(())
}

fn unique(seen: &mut HashSet<String>, kind: &'static str, name: &str) -> Result<(), CatalogError> {
  if !seen.insert(name.to_string()) {
    return Err(CatalogError::Duplicate {
      kind,
      name: name.to_string(),
    });
  }
  Ok(())
}

fn known(
  names: &HashSet<String>,
  kind: &'static str,
  name: &str,
  owner: impl FnOnce() -> String,
) -> Result<(), CatalogError> {
  if names.contains(name) {
    return Ok(());
  }
  Err(CatalogError::UnknownReference {
    owner: owner(),
    kind,
    name: name.to_string(),
  })
}

fn split_project(reference: &str) -> Result<(&str, &str), CatalogError> {
  match reference.split_once('/') {
    Some((ws, name)) if !ws.is_empty() && !name.is_empty() && !name.contains('/') => Ok((ws, name)),
    _ => Err(CatalogError::MalformedProjectReference(reference.to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = r#"
[[workspaces]]
name = "main"
path = "src"

[[workspaces.projects]]
name = "api"
url = "https://example.com/api.git"

[[workspaces.projects]]
name = "web"
path = "frontend"

[[services]]
name = "db"
command = "postgres"
variables = [{ name = "PORT", default = "5432" }]

[[services]]
name = "api"
command = "cargo run"
dir = "src/api"
needs = ["db"]
before = ["migrate"]

[[tasks]]
name = "migrate"
variables = [{ name = "ENV" }]

[[tasks.steps]]
commands = ["make migrate", "spawn tail -f log"]
projects = ["main/api", "main/web"]

[[tasks.steps]]
commands = ["echo done"]
"#;

  #[test]
  fn installs_entities_with_resolved_paths() {
    let store = EntityStore::new();
    let root = Path::new("/work");
    Catalog::from_toml_str(SAMPLE).unwrap().install(&store, root).unwrap();

    let ws: Workspace = store.load(&workspace_id("main")).unwrap();
    assert_eq!(ws.project_ids.len(), 2);
    let web: Project = store.load(&project_id("main", "web")).unwrap();
    assert_eq!(web.path, Path::new("/work/src/frontend"));
    let api: Project = store.load(&project_id("main", "api")).unwrap();
    assert_eq!(api.path, Path::new("/work/src/api"));

    let svc: Service = store.load(&service_id("api")).unwrap();
    assert_eq!(svc.dependency_ids, vec![service_id("db")]);
    assert_eq!(svc.before_hook_ids, vec![task_id("migrate")]);
    assert_eq!(svc.dir.as_deref(), Some(Path::new("/work/src/api")));

    let task: Task = store.load(&task_id("migrate")).unwrap();
    assert_eq!(task.step_ids.len(), 2);
    let first: Step = store.load(&task.step_ids[0]).unwrap();
    assert_eq!(first.project_ids, vec![project_id("main", "api"), project_id("main", "web")]);
    let spawn: Command = store.load(&first.command_ids[1]).unwrap();
    assert_eq!(spawn.run, "spawn tail -f log");
  }

  #[test]
  fn unknown_dependency_is_rejected_before_storing() {
    let store = EntityStore::new();
    let catalog = Catalog::from_toml_str(
      r#"
[[services]]
name = "api"
command = "run"
needs = ["ghost"]
"#,
    )
    .unwrap();
    match catalog.install(&store, Path::new("/")) {
      Err(CatalogError::UnknownReference { kind, name, .. }) => {
        assert_eq!(kind, "service");
        assert_eq!(name, "ghost");
      }
      other => panic!("unexpected result: {other:?}"),
    }
    assert!(store.list::<Service>().is_empty());
  }

  #[test]
  fn duplicate_task_is_rejected() {
    let catalog = Catalog::from_toml_str(
      r#"
[[tasks]]
name = "t"
[[tasks]]
name = "t"
"#,
    )
    .unwrap();
    assert!(matches!(catalog.validate(), Err(CatalogError::Duplicate { kind: "task", .. })));
  }

  #[test]
  fn names_with_id_separators_are_rejected() {
    // `a:b/c` and `a/b:c` would otherwise map to the same project ID.
    let catalog = Catalog::from_toml_str(
      r#"
[[workspaces]]
name = "a:b"
path = "x"
[[workspaces.projects]]
name = "c"

[[workspaces]]
name = "a"
path = "y"
[[workspaces.projects]]
name = "b:c"
"#,
    )
    .unwrap();
    assert!(matches!(
      catalog.validate(),
      Err(CatalogError::InvalidName { kind: "workspace", .. })
    ));

    for (kind, toml) in [
      ("project", "[[workspaces]]\nname = \"w\"\npath = \".\"\n[[workspaces.projects]]\nname = \"b:c\"\n"),
      ("service", "[[services]]\nname = \"db:1\"\ncommand = \"true\"\n"),
      ("task", "[[tasks]]\nname = \"\"\n"),
    ] {
      let store = EntityStore::new();
      match Catalog::from_toml_str(toml).unwrap().install(&store, Path::new("/")) {
        Err(CatalogError::InvalidName { kind: found, .. }) => assert_eq!(found, kind),
        other => panic!("unexpected result for {kind}: {other:?}"),
      }
    }
  }

  #[test]
  fn malformed_project_reference() {
    let catalog = Catalog::from_toml_str(
      r#"
[[tasks]]
name = "t"
[[tasks.steps]]
commands = ["true"]
projects = ["api"]
"#,
    )
    .unwrap();
    assert!(matches!(
      catalog.validate(),
      Err(CatalogError::MalformedProjectReference(_))
    ));
  }

  #[test]
  fn cycles_are_accepted_here() {
    let catalog = Catalog::from_toml_str(
      r#"
[[services]]
name = "a"
command = "true"
needs = ["b"]
[[services]]
name = "b"
command = "true"
needs = ["a"]
"#,
    )
    .unwrap();
    assert!(catalog.validate().is_ok());
  }

  #[test]
  fn missing_file_is_empty() {
    let td = tempfile::tempdir().unwrap();
    let catalog = Catalog::load(&td.path().join("catalog.toml")).unwrap();
    assert!(catalog.services.is_empty());
  }
}
