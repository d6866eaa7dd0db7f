use serde::{Deserialize, Serialize};

use super::{InvalidTransition, Status, transition};
use crate::store::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
  Running,
  Stopping,
  Done,
  Failed,
}

impl Status for ProcessStatus {
  const ALL: &'static [Self] = &[
    ProcessStatus::Running,
    ProcessStatus::Stopping,
    ProcessStatus::Done,
    ProcessStatus::Failed,
  ];

  fn as_str(self) -> &'static str {
    match self {
      ProcessStatus::Running => "running",
      ProcessStatus::Stopping => "stopping",
      ProcessStatus::Done => "done",
      ProcessStatus::Failed => "failed",
    }
  }

  fn can_transition(self, to: Self) -> bool {
    use ProcessStatus::*;
    matches!(
      (self, to),
      (Running, Stopping) | (Running, Done) | (Running, Failed) | (Stopping, Done) | (Stopping, Failed)
    )
  }

  fn is_terminal(self) -> bool {
    matches!(self, ProcessStatus::Done | ProcessStatus::Failed)
  }
}

/// Detached command started by a task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
  pub id: Id,
  pub group_id: Id,
  pub command_id: Id,
  pub status: ProcessStatus,
  #[serde(default)]
  pub pid: Option<u32>,
}

impl Process {
  pub fn transition_to(&mut self, status: ProcessStatus) -> Result<(), InvalidTransition> {
    transition(&mut self.status, status)
  }
}

/// Processes detached by one task run. The group has no stored status; see
/// [`ProcessGroup::aggregate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessGroup {
  pub id: Id,
  pub task_id: Id,
  #[serde(default)]
  pub process_ids: Vec<Id>,
}

impl ProcessGroup {
  /// Failed if any member failed, else running while any member is alive,
  /// else done. An empty group is done.
  pub fn aggregate<I>(statuses: I) -> ProcessStatus
  where
    I: IntoIterator<Item = ProcessStatus>,
  {
    let mut alive = false;
    for status in statuses {
      match status {
        ProcessStatus::Failed => return ProcessStatus::Failed,
        ProcessStatus::Running | ProcessStatus::Stopping => alive = true,
        ProcessStatus::Done => {}
      }
    }
    if alive {
      ProcessStatus::Running
    } else {
      ProcessStatus::Done
    }
  }
}
