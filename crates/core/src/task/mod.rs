//! Sequential executor for task steps.
//!
//! Steps run strictly in order. A step without projects runs each command
//! once in the runner's default directory; a step with projects runs the
//! whole command sequence once per project, inside the project directory.
//! Commands carrying the spawn prefix are detached into the run's
//! [`ProcessGroup`](crate::domain::ProcessGroup) instead of awaited.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{Event, EventBus};
use crate::domain::service::merge_variables;
use crate::domain::{Command, InvalidTransition, Project, Step, Task, TaskStatus};
use crate::process::{self, CommandSpec};
use crate::store::{EntityStore, Id, StoreError};

mod detach;

#[derive(Debug, Error)]
pub enum TaskError {
  #[error("task {0} is already running")]
  Conflict(Id),
  #[error("command `{command}` failed: {status}")]
  CommandFailed { command: String, status: String },
  #[error("failed to spawn `{command}`: {source}")]
  Spawn {
    command: String,
    #[source]
    source: io::Error,
  },
  #[error("task {0} was cancelled")]
  Cancelled(Id),
  #[error("process {0} is not running")]
  NotRunning(Id),
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error(transparent)]
  Transition(#[from] InvalidTransition),
}

pub type TaskResult<T> = Result<T, TaskError>;

struct Inner {
  store: Arc<EntityStore>,
  bus: EventBus,
  default_dir: PathBuf,
  spawn_prefix: String,
  /// Stop tokens for live detached processes.
  detached: DashMap<Id, CancellationToken>,
}

#[derive(Clone)]
pub struct TaskRunner {
  inner: Arc<Inner>,
}

/// State of one `run` call.
struct RunState<'a> {
  task_id: &'a Id,
  env: &'a BTreeMap<String, String>,
  cancel: &'a CancellationToken,
  /// Created on the first detached command.
  group_id: Option<Id>,
}

impl TaskRunner {
  pub fn new(store: Arc<EntityStore>, bus: EventBus, default_dir: PathBuf, spawn_prefix: &str) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        bus,
        default_dir,
        spawn_prefix: spawn_prefix.to_string(),
        detached: DashMap::new(),
      }),
    }
  }

  /// Run every step of the task. Fails with [`TaskError::Conflict`] when the
  /// task is already running. The task ends `stopped` on success and
  /// `failed` on the first failing synchronous command or on cancellation.
  pub async fn run(
    &self,
    task_id: &Id,
    overrides: &BTreeMap<String, String>,
    cancel: &CancellationToken,
  ) -> TaskResult<()> {
    let store = &self.inner.store;
    let task = {
      let _guard = store.lock([task_id]).await;
      let mut task: Task = store.load(task_id)?;
      if task.status == TaskStatus::Running {
        return Err(TaskError::Conflict(task_id.clone()));
      }
      task.transition_to(TaskStatus::Running)?;
      task.clear_cursor();
      store.store(task.clone());
      self.inner.bus.publish(Event::Task(task.clone()));
      task
    };
    info!(event = "task_started", task = %task.name, steps = task.step_ids.len());

    let env = merge_variables(&task.variables, overrides);
    let mut run = RunState {
      task_id,
      env: &env,
      cancel,
      group_id: None,
    };
    let result = self.execute(&task, &mut run).await;

    {
      let _guard = store.lock([task_id]).await;
      let mut task: Task = store.load(task_id)?;
      task.transition_to(if result.is_ok() {
        TaskStatus::Stopped
      } else {
        TaskStatus::Failed
      })?;
      task.clear_cursor();
      store.store(task.clone());
      self.inner.bus.publish(Event::Task(task));
    }

    match &result {
      Ok(()) => info!(event = "task_finished", task = %task.name),
      Err(e) => warn!(event = "task_failed", task = %task.name, error = %e),
    }
    result
  }

  async fn execute(&self, task: &Task, run: &mut RunState<'_>) -> TaskResult<()> {
    let store = &self.inner.store;
    for step_id in &task.step_ids {
      let step: Step = store.load(step_id)?;
      let commands = step
        .command_ids
        .iter()
        .map(|id| store.load::<Command>(id))
        .collect::<Result<Vec<_>, _>>()?;
      if step.project_ids.is_empty() {
        self
          .run_commands(run, &step, None, &commands, &self.inner.default_dir)
          .await?;
      } else {
        for project_id in &step.project_ids {
          let project: Project = store.load(project_id)?;
          self
            .run_commands(run, &step, Some(project_id), &commands, &project.path)
            .await?;
        }
      }
    }
    Ok(())
  }

  async fn run_commands(
    &self,
    run: &mut RunState<'_>,
    step: &Step,
    project_id: Option<&Id>,
    commands: &[Command],
    dir: &Path,
  ) -> TaskResult<()> {
    for command in commands {
      if run.cancel.is_cancelled() {
        return Err(TaskError::Cancelled(run.task_id.clone()));
      }
      self.mark(run.task_id, step, project_id, command).await?;
      match command.detached(&self.inner.spawn_prefix) {
        Some(line) => self.detach(run, command, line, dir).await?,
        None => self.run_sync(run, command, dir).await?,
      }
    }
    Ok(())
  }

  /// Record the unit about to execute; observational only.
  async fn mark(
    &self,
    task_id: &Id,
    step: &Step,
    project_id: Option<&Id>,
    command: &Command,
  ) -> TaskResult<()> {
    let store = &self.inner.store;
    let _guard = store.lock([task_id]).await;
    let mut task: Task = store.load(task_id)?;
    task.current_step_id = Some(step.id.clone());
    task.current_project_id = project_id.cloned();
    task.current_command_id = Some(command.id.clone());
    store.store(task.clone());
    self.inner.bus.publish(Event::Task(task));
    Ok(())
  }

  async fn run_sync(&self, run: &RunState<'_>, command: &Command, dir: &Path) -> TaskResult<()> {
    let spec = CommandSpec {
      label: &command.run,
      command: &command.run,
      dir,
      env: run.env,
    };
    let spawn_err = |source| TaskError::Spawn {
      command: command.run.clone(),
      source,
    };
    let mut child = process::spawn_group(&spec).map_err(spawn_err)?;
    let exit = child.wait_or_interrupt(run.cancel).await.map_err(spawn_err)?;
    if exit.interrupted {
      return Err(TaskError::Cancelled(run.task_id.clone()));
    }
    if !exit.success() {
      return Err(TaskError::CommandFailed {
        command: command.run.clone(),
        status: process::describe(&exit.status),
      });
    }
    Ok(())
  }
}
