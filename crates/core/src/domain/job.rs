use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{InvalidTransition, Node, Status, transition};
use crate::store::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
  #[default]
  Normal,
  High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
  Queued,
  Running,
  Stopping,
  Failed,
  Done,
}

impl Status for JobStatus {
  const ALL: &'static [Self] = &[
    JobStatus::Queued,
    JobStatus::Running,
    JobStatus::Stopping,
    JobStatus::Failed,
    JobStatus::Done,
  ];

  fn as_str(self) -> &'static str {
    match self {
      JobStatus::Queued => "queued",
      JobStatus::Running => "running",
      JobStatus::Stopping => "stopping",
      JobStatus::Failed => "failed",
      JobStatus::Done => "done",
    }
  }

  fn can_transition(self, to: Self) -> bool {
    use JobStatus::*;
    matches!(
      (self, to),
      (Queued, Running)
        | (Queued, Failed)
        | (Running, Stopping)
        | (Running, Done)
        | (Running, Failed)
        | (Stopping, Done)
        | (Stopping, Failed)
    )
  }

  fn is_terminal(self) -> bool {
    matches!(self, JobStatus::Failed | JobStatus::Done)
  }
}

/// One-shot unit of work tracked by the [`WorkQueue`](crate::queue::WorkQueue).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
  pub id: Id,
  pub name: String,
  pub priority: Priority,
  pub status: JobStatus,
  /// Correlation only; never consulted for execution.
  pub owner_id: Id,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl Job {
  pub fn new(name: &str, owner_id: Id, priority: Priority, status: JobStatus) -> Self {
    let now = Utc::now();
    Job {
      id: Id::new(Job::KIND, [uuid::Uuid::new_v4().to_string()]),
      name: name.to_string(),
      priority,
      status,
      owner_id,
      created_at: now,
      updated_at: now,
      error: None,
    }
  }

  pub fn transition_to(&mut self, status: JobStatus) -> Result<(), InvalidTransition> {
    transition(&mut self.status, status)?;
    self.updated_at = Utc::now();
    Ok(())
  }
}
