//! Entity records tracked by the [`EntityStore`](crate::store::EntityStore).
//!
//! Every record kind is a variant of [`Entity`] and implements [`Node`],
//! which ties it to the kind tag embedded in its [`Id`]. Lifecycle fields
//! use enums implementing [`Status`] so transitions are checked in one place.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::Id;

pub mod job;
pub mod process;
pub mod service;
pub mod task;
pub mod workspace;

pub use job::{Job, JobStatus, Priority};
pub use process::{Process, ProcessGroup, ProcessStatus};
pub use service::{Service, ServiceStatus, Variable};
pub use task::{Command, Step, Task, TaskStatus};
pub use workspace::{Project, SyncStatus, Workspace};

/// A record with a kind-tagged identifier.
pub trait Node: Clone + Into<Entity> + Send + Sync + 'static {
  const KIND: &'static str;

  fn id(&self) -> &Id;

  fn from_entity(entity: Entity) -> Option<Self>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
  Workspace(Workspace),
  Project(Project),
  Service(Service),
  Task(Task),
  Step(Step),
  Command(Command),
  Job(Job),
  ProcessGroup(ProcessGroup),
  Process(Process),
}

impl Entity {
  pub fn id(&self) -> &Id {
    match self {
      Entity::Workspace(v) => &v.id,
      Entity::Project(v) => &v.id,
      Entity::Service(v) => &v.id,
      Entity::Task(v) => &v.id,
      Entity::Step(v) => &v.id,
      Entity::Command(v) => &v.id,
      Entity::Job(v) => &v.id,
      Entity::ProcessGroup(v) => &v.id,
      Entity::Process(v) => &v.id,
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Entity::Workspace(_) => Workspace::KIND,
      Entity::Project(_) => Project::KIND,
      Entity::Service(_) => Service::KIND,
      Entity::Task(_) => Task::KIND,
      Entity::Step(_) => Step::KIND,
      Entity::Command(_) => Command::KIND,
      Entity::Job(_) => Job::KIND,
      Entity::ProcessGroup(_) => ProcessGroup::KIND,
      Entity::Process(_) => Process::KIND,
    }
  }
}

macro_rules! node {
  ($ty:ident) => {
    impl Node for $ty {
      const KIND: &'static str = stringify!($ty);

      fn id(&self) -> &Id {
        &self.id
      }

      fn from_entity(entity: Entity) -> Option<Self> {
        match entity {
          Entity::$ty(v) => Some(v),
          _ => None,
        }
      }
    }

    impl From<$ty> for Entity {
      fn from(v: $ty) -> Self {
        Entity::$ty(v)
      }
    }
  };
}

node!(Workspace);
node!(Project);
node!(Service);
node!(Task);
node!(Step);
node!(Command);
node!(Job);
node!(ProcessGroup);
node!(Process);

/// Lifecycle enum with an explicit transition table.
pub trait Status: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
  /// Every variant, in counter order.
  const ALL: &'static [Self];

  fn as_str(self) -> &'static str;

  fn can_transition(self, to: Self) -> bool;

  fn is_terminal(self) -> bool;

  fn index(self) -> usize {
    Self::ALL.iter().position(|s| *s == self).unwrap_or(0)
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition: {from} -> {to}")]
pub struct InvalidTransition {
  pub from: &'static str,
  pub to: &'static str,
}

/// Apply `to` to `current` if the transition table allows it.
pub fn transition<S: Status>(current: &mut S, to: S) -> Result<(), InvalidTransition> {
  if current.can_transition(to) {
    *current = to;
    Ok(())
  } else {
    Err(InvalidTransition {
      from: current.as_str(),
      to: to.as_str(),
    })
  }
}
