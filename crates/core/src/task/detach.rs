use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{RunState, TaskError, TaskResult, TaskRunner};
use crate::bus::Event;
use crate::domain::{Command, Node, Process, ProcessGroup, ProcessStatus, Status};
use crate::process::{self, CommandSpec, GroupChild};
use crate::store::Id;

impl TaskRunner {
  /// Start `line` in the background under the run's process group and
  /// return without waiting for it.
  pub(super) async fn detach(
    &self,
    run: &mut RunState<'_>,
    command: &Command,
    line: &str,
    dir: &Path,
  ) -> TaskResult<()> {
    let store = &self.inner.store;
    let group_id = match &run.group_id {
      Some(id) => id.clone(),
      None => {
        let group = ProcessGroup {
          id: Id::new(
            ProcessGroup::KIND,
            [run.task_id.to_string(), uuid::Uuid::new_v4().to_string()],
          ),
          task_id: run.task_id.clone(),
          process_ids: Vec::new(),
        };
        let id = group.id.clone();
        store.store(group);
        run.group_id = Some(id.clone());
        id
      }
    };

    let spec = CommandSpec {
      label: line,
      command: line,
      dir,
      env: run.env,
    };
    let child = process::spawn_group(&spec).map_err(|source| TaskError::Spawn {
      command: line.to_string(),
      source,
    })?;

    let proc = Process {
      id: Id::new(Process::KIND, [uuid::Uuid::new_v4().to_string()]),
      group_id: group_id.clone(),
      command_id: command.id.clone(),
      status: ProcessStatus::Running,
      pid: child.pid(),
    };
    let cancel = CancellationToken::new();
    self.inner.detached.insert(proc.id.clone(), cancel.clone());
    store.store(proc.clone());
    self.inner.bus.publish(Event::Process(proc.clone()));
    {
      let _guard = store.lock([&group_id]).await;
      let mut group: ProcessGroup = store.load(&group_id)?;
      group.process_ids.push(proc.id.clone());
      store.store(group);
    }
    info!(event = "process_detached", process = %proc.id, command = line, pid = proc.pid);

    let runner = self.clone();
    tokio::spawn(async move {
      runner.supervise(proc.id, child, cancel).await;
    });
    Ok(())
  }

  async fn supervise(&self, id: Id, mut child: GroupChild, cancel: CancellationToken) {
    let exit = child.wait_or_interrupt(&cancel).await;
    self.inner.detached.remove(&id);

    let store = &self.inner.store;
    let _guard = store.lock([&id]).await;
    let mut proc: Process = match store.load(&id) {
      Ok(p) => p,
      Err(e) => {
        warn!(event = "process_lost", process = %id, error = %e);
        return;
      }
    };
    let requested = proc.status == ProcessStatus::Stopping;
    let outcome = match &exit {
      Ok(exit) if exit.success() || exit.interrupted || requested => ProcessStatus::Done,
      Ok(exit) => {
        warn!(event = "process_failed", process = %id, status = %process::describe(&exit.status));
        ProcessStatus::Failed
      }
      Err(e) => {
        warn!(event = "process_failed", process = %id, error = %e);
        ProcessStatus::Failed
      }
    };
    if let Err(e) = proc.transition_to(outcome) {
      warn!(event = "process_transition_rejected", process = %id, error = %e);
      return;
    }
    proc.pid = None;
    store.store(proc.clone());
    self.inner.bus.publish(Event::Process(proc));
    info!(event = "process_exited", process = %id, status = outcome.as_str());
  }

  /// Interrupt a detached process. Completion is reported asynchronously
  /// through its status.
  pub async fn stop_process(&self, id: &Id) -> TaskResult<()> {
    let store = &self.inner.store;
    let _guard = store.lock([id]).await;
    let mut proc: Process = store.load(id)?;
    if proc.status != ProcessStatus::Running {
      return Err(TaskError::NotRunning(id.clone()));
    }
    proc.transition_to(ProcessStatus::Stopping)?;
    store.store(proc.clone());
    self.inner.bus.publish(Event::Process(proc));
    if let Some(cancel) = self.inner.detached.get(id) {
      cancel.cancel();
    }
    Ok(())
  }

  /// Stop every running member of a group; returns how many were signalled.
  pub async fn stop_group(&self, group_id: &Id) -> TaskResult<usize> {
    let group: ProcessGroup = self.inner.store.load(group_id)?;
    let mut stopped = 0;
    for id in &group.process_ids {
      match self.stop_process(id).await {
        Ok(()) => stopped += 1,
        Err(TaskError::NotRunning(_)) => {}
        Err(e) => return Err(e),
      }
    }
    Ok(stopped)
  }

  /// Stop every detached process this runner still supervises.
  pub async fn stop_all(&self) -> usize {
    let ids: Vec<Id> = self.inner.detached.iter().map(|e| e.key().clone()).collect();
    let mut stopped = 0;
    for id in ids {
      if self.stop_process(&id).await.is_ok() {
        stopped += 1;
      }
    }
    stopped
  }

  /// Derived from the members; never stored.
  pub fn group_status(&self, group_id: &Id) -> TaskResult<ProcessStatus> {
    let store = &self.inner.store;
    let group: ProcessGroup = store.load(group_id)?;
    let statuses = group
      .process_ids
      .iter()
      .map(|id| store.load::<Process>(id).map(|p| p.status))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(ProcessGroup::aggregate(statuses))
  }

  /// Process groups created by runs of `task_id`.
  pub fn groups_for(&self, task_id: &Id) -> Vec<ProcessGroup> {
    self
      .inner
      .store
      .list::<ProcessGroup>()
      .into_iter()
      .filter(|g| &g.task_id == task_id)
      .collect()
  }
}
