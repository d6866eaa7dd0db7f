use serde::{Deserialize, Serialize};

use super::{InvalidTransition, Status, Variable, transition};
use crate::store::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  /// Idle, either never run or last run succeeded.
  #[default]
  Stopped,
  Running,
  Failed,
}

impl Status for TaskStatus {
  const ALL: &'static [Self] = &[TaskStatus::Stopped, TaskStatus::Running, TaskStatus::Failed];

  fn as_str(self) -> &'static str {
    match self {
      TaskStatus::Stopped => "stopped",
      TaskStatus::Running => "running",
      TaskStatus::Failed => "failed",
    }
  }

  fn can_transition(self, to: Self) -> bool {
    use TaskStatus::*;
    matches!(
      (self, to),
      (Stopped, Running) | (Failed, Running) | (Running, Stopped) | (Running, Failed)
    )
  }

  fn is_terminal(self) -> bool {
    !matches!(self, TaskStatus::Running)
  }
}

/// Static recipe of ordered steps plus the transient execution cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub id: Id,
  pub name: String,
  #[serde(default)]
  pub step_ids: Vec<Id>,
  #[serde(default)]
  pub variables: Vec<Variable>,
  #[serde(default)]
  pub status: TaskStatus,
  #[serde(default)]
  pub current_step_id: Option<Id>,
  #[serde(default)]
  pub current_project_id: Option<Id>,
  #[serde(default)]
  pub current_command_id: Option<Id>,
}

impl Task {
  pub fn new(id: Id, name: &str) -> Self {
    Task {
      id,
      name: name.to_string(),
      step_ids: Vec::new(),
      variables: Vec::new(),
      status: TaskStatus::Stopped,
      current_step_id: None,
      current_project_id: None,
      current_command_id: None,
    }
  }

  pub fn transition_to(&mut self, status: TaskStatus) -> Result<(), InvalidTransition> {
    transition(&mut self.status, status)
  }

  pub fn clear_cursor(&mut self) {
    self.current_step_id = None;
    self.current_project_id = None;
    self.current_command_id = None;
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
  pub id: Id,
  pub task_id: Id,
  #[serde(default)]
  pub command_ids: Vec<Id>,
  /// When non-empty the command sequence runs once per project.
  #[serde(default)]
  pub project_ids: Vec<Id>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
  pub id: Id,
  pub run: String,
}

impl Command {
  pub fn new(id: Id, run: &str) -> Self {
    Command {
      id,
      run: run.to_string(),
    }
  }

  /// The remainder of the command line when it starts with `prefix` followed
  /// by whitespace; such commands are detached instead of awaited.
  pub fn detached<'a>(&'a self, prefix: &str) -> Option<&'a str> {
    let rest = self.run.trim_start().strip_prefix(prefix)?;
    if rest.starts_with(char::is_whitespace) {
      let rest = rest.trim();
      (!rest.is_empty()).then_some(rest)
    } else {
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cmd(run: &str) -> Command {
    Command::new(Id::new("Command", ["t", "0", "0"]), run)
  }

  #[test]
  fn detects_spawn_prefix() {
    assert_eq!(cmd("spawn npm run dev").detached("spawn"), Some("npm run dev"));
    assert_eq!(cmd("  spawn   sleep 5 ").detached("spawn"), Some("sleep 5"));
    assert_eq!(cmd("spawner --x").detached("spawn"), None);
    assert_eq!(cmd("spawn").detached("spawn"), None);
    assert_eq!(cmd("echo spawn x").detached("spawn"), None);
  }

  #[test]
  fn transitions_enforced() {
    let mut task = Task::new(Id::new("Task", ["build"]), "build");
    task.transition_to(TaskStatus::Running).unwrap();
    assert!(task.transition_to(TaskStatus::Running).is_err());
    task.transition_to(TaskStatus::Failed).unwrap();
    task.transition_to(TaskStatus::Running).unwrap();
    task.transition_to(TaskStatus::Stopped).unwrap();
  }
}
