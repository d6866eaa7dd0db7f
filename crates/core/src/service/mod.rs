//! Long-running service supervision.
//!
//! A service is started after its transitive dependencies, each in its own
//! process group. Before hooks must succeed before the process is spawned;
//! after hooks run once it exits. Status transitions follow
//! `stopped -> starting -> running -> stopping -> stopped`, with `failed`
//! reachable from `starting` and `stopping`.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus, kinds};
use crate::domain::service::merge_variables;
use crate::domain::{InvalidTransition, Service, ServiceStatus, Status};
use crate::metrics::StatusCounters;
use crate::process::{self, CommandSpec, GroupChild};
use crate::store::{EntityStore, Id, StoreError};
use crate::task::{TaskError, TaskRunner};

mod graph;

#[derive(Debug, Error)]
pub enum ServiceError {
  #[error("service {0} is already starting or stopping")]
  Conflict(Id),
  #[error("service {0} is not running")]
  NotRunning(Id),
  #[error("cyclic dependency: {}", render_path(.0))]
  CyclicDependency(Vec<Id>),
  #[error("hook {hook} of service {service} failed: {source}")]
  Hook {
    service: Id,
    hook: Id,
    #[source]
    source: TaskError,
  },
  #[error("failed to spawn service {service}: {source}")]
  Spawn {
    service: Id,
    #[source]
    source: io::Error,
  },
  #[error("interrupted while waiting for services to stop")]
  Interrupted,
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error(transparent)]
  Transition(#[from] InvalidTransition),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

fn render_path(path: &[Id]) -> String {
  path
    .iter()
    .map(|id| id.decode().map(|parts| parts.join(":")).unwrap_or_else(|_| id.to_string()))
    .collect::<Vec<_>>()
    .join(" -> ")
}

struct Inner {
  store: Arc<EntityStore>,
  bus: EventBus,
  tasks: TaskRunner,
  default_dir: PathBuf,
  /// Stop tokens of services with a live process.
  active: DashMap<Id, CancellationToken>,
  counters: StatusCounters<ServiceStatus>,
}

#[derive(Clone)]
pub struct ServiceOrchestrator {
  inner: Arc<Inner>,
}

impl ServiceOrchestrator {
  /// Metrics are seeded from the services already in `store`.
  pub fn new(store: Arc<EntityStore>, bus: EventBus, tasks: TaskRunner, default_dir: PathBuf) -> Self {
    let counters = StatusCounters::new("services");
    counters.reset(store.list::<Service>().into_iter().map(|s| s.status));
    Self {
      inner: Arc::new(Inner {
        store,
        bus,
        tasks,
        default_dir,
        active: DashMap::new(),
        counters,
      }),
    }
  }

  pub fn dependency_order(&self, id: &Id) -> ServiceResult<Vec<Id>> {
    graph::dependency_order(&self.inner.store, id)
  }

  /// Start `id` and everything it depends on, dependencies first.
  ///
  /// Services already running are left alone; one that is starting or
  /// stopping aborts the call with [`ServiceError::Conflict`]. A cycle is
  /// reported before any service is touched.
  pub async fn start(&self, id: &Id, overrides: &BTreeMap<String, String>) -> ServiceResult<()> {
    let order = self.dependency_order(id)?;
    let services = order
      .iter()
      .map(|id| self.inner.store.load::<Service>(id))
      .collect::<Result<Vec<_>, _>>()?;
    let env = merge_variables(services.iter().flat_map(|s| s.variables.iter()), overrides);
    debug!(event = "service_start_order", service = %id, count = order.len());
    for service_id in &order {
      self.start_one(service_id, &env).await?;
    }
    Ok(())
  }

  async fn start_one(&self, id: &Id, env: &BTreeMap<String, String>) -> ServiceResult<()> {
    let store = &self.inner.store;
    let service = {
      let _guard = store.lock([id]).await;
      let mut service: Service = store.load(id)?;
      match service.status {
        ServiceStatus::Running => {
          debug!(event = "service_already_running", service = %service.name);
          return Ok(());
        }
        ServiceStatus::Starting | ServiceStatus::Stopping => {
          return Err(ServiceError::Conflict(id.clone()));
        }
        ServiceStatus::Stopped | ServiceStatus::Failed => {}
      }
      self.apply(&mut service, ServiceStatus::Starting)?;
      service
    };
    info!(event = "service_starting", service = %service.name);

    for hook_id in &service.before_hook_ids {
      if let Err(source) = self.inner.tasks.run(hook_id, env, &CancellationToken::new()).await {
        self.fail(id).await;
        return Err(ServiceError::Hook {
          service: id.clone(),
          hook: hook_id.clone(),
          source,
        });
      }
    }

    let dir = service
      .dir
      .clone()
      .unwrap_or_else(|| self.inner.default_dir.clone());
    let spec = CommandSpec {
      label: &service.name,
      command: &service.command,
      dir: &dir,
      env,
    };
    let child = match process::spawn_group(&spec) {
      Ok(child) => child,
      Err(source) => {
        self.fail(id).await;
        return Err(ServiceError::Spawn {
          service: id.clone(),
          source,
        });
      }
    };

    let cancel = CancellationToken::new();
    {
      let _guard = store.lock([id]).await;
      let mut service: Service = store.load(id)?;
      service.pid = child.pid();
      self.inner.active.insert(id.clone(), cancel.clone());
      self.apply(&mut service, ServiceStatus::Running)?;
    }
    info!(event = "service_running", service = %service.name, pid = child.pid());

    let orchestrator = self.clone();
    let id = id.clone();
    let env = env.clone();
    tokio::spawn(async move {
      orchestrator.supervise(id, child, cancel, env).await;
    });
    Ok(())
  }

  /// Wait for the process, run after hooks, and record the outcome.
  async fn supervise(
    &self,
    id: Id,
    mut child: GroupChild,
    cancel: CancellationToken,
    env: BTreeMap<String, String>,
  ) {
    let exit = child.wait_or_interrupt(&cancel).await;
    self.inner.active.remove(&id);
    let store = &self.inner.store;

    let (service, requested) = {
      let _guard = store.lock([&id]).await;
      let mut service: Service = match store.load(&id) {
        Ok(s) => s,
        Err(e) => {
          warn!(event = "service_lost", service = %id, error = %e);
          return;
        }
      };
      let requested = service.status == ServiceStatus::Stopping;
      if service.status == ServiceStatus::Running
        && let Err(e) = self.apply(&mut service, ServiceStatus::Stopping)
      {
        warn!(event = "service_transition_rejected", service = %service.name, error = %e);
        return;
      }
      (service, requested)
    };

    let exit_err = match &exit {
      Ok(exit) if exit.success() || exit.interrupted || requested => None,
      Ok(exit) => Some(process::describe(&exit.status)),
      Err(e) => Some(e.to_string()),
    };
    let mut hook_err = None;
    for hook_id in &service.after_hook_ids {
      if let Err(e) = self.inner.tasks.run(hook_id, &env, &CancellationToken::new()).await {
        warn!(event = "service_after_hook_failed", service = %service.name, hook = %hook_id, error = %e);
        hook_err.get_or_insert_with(|| e.to_string());
      }
    }
    let err = exit_err.or(hook_err);

    let _guard = store.lock([&id]).await;
    let mut service: Service = match store.load(&id) {
      Ok(s) => s,
      Err(e) => {
        warn!(event = "service_lost", service = %id, error = %e);
        return;
      }
    };
    let outcome = if err.is_some() {
      ServiceStatus::Failed
    } else {
      ServiceStatus::Stopped
    };
    if let Err(e) = self.apply(&mut service, outcome) {
      warn!(event = "service_transition_rejected", service = %service.name, error = %e);
      return;
    }
    match err {
      Some(error) => warn!(event = "service_failed", service = %service.name, error = %error),
      None => info!(event = "service_stopped", service = %service.name, requested),
    }
  }

  /// Interrupt a running service. It reaches `stopped` or `failed` once the
  /// process has exited and its after hooks have run.
  pub async fn stop(&self, id: &Id) -> ServiceResult<()> {
    let store = &self.inner.store;
    let _guard = store.lock([id]).await;
    let mut service: Service = store.load(id)?;
    if service.status != ServiceStatus::Running {
      return Err(ServiceError::NotRunning(id.clone()));
    }
    self.apply(&mut service, ServiceStatus::Stopping)?;
    if let Some(cancel) = self.inner.active.get(id) {
      cancel.cancel();
    }
    info!(event = "service_stop_requested", service = %service.name);
    Ok(())
  }

  /// Stop every service that is up and wait until all of them are terminal.
  /// Services still starting are stopped as soon as they report `running`.
  pub async fn clean(&self, cancel: &CancellationToken) -> ServiceResult<()> {
    let bus = &self.inner.bus;
    let checkpoint = bus.last_sequence();
    let mut updates = bus.subscribe(kinds::SERVICE, Some(checkpoint), cancel.clone());

    for service in self.inner.store.list::<Service>() {
      if service.status == ServiceStatus::Running {
        match self.stop(&service.id).await {
          Ok(()) | Err(ServiceError::NotRunning(_)) => {}
          Err(e) => return Err(e),
        }
      }
    }
    let mut pending: BTreeSet<Id> = self
      .inner
      .store
      .list::<Service>()
      .into_iter()
      .filter(|s| !s.status.is_terminal())
      .map(|s| s.id)
      .collect();
    info!(event = "services_cleaning", pending = pending.len());

    while !pending.is_empty() {
      let Some(msg) = updates.recv().await else {
        return Err(ServiceError::Interrupted);
      };
      let Event::Service(service) = &msg.event else {
        continue;
      };
      if !pending.contains(&service.id) {
        continue;
      }
      if service.status.is_terminal() {
        pending.remove(&service.id);
      } else if service.status == ServiceStatus::Running {
        match self.stop(&service.id).await {
          Ok(()) | Err(ServiceError::NotRunning(_)) => {}
          Err(e) => return Err(e),
        }
      }
    }
    info!(event = "services_cleaned");
    Ok(())
  }

  pub fn services(&self) -> Vec<Service> {
    self.inner.store.list::<Service>()
  }

  pub fn metrics(&self) -> BTreeMap<String, i64> {
    self.inner.counters.snapshot()
  }

  /// Move a service from `starting` to `failed`.
  async fn fail(&self, id: &Id) {
    let _guard = self.inner.store.lock([id]).await;
    let result = self
      .inner
      .store
      .load::<Service>(id)
      .map_err(ServiceError::from)
      .and_then(|mut service| self.apply(&mut service, ServiceStatus::Failed));
    if let Err(e) = result {
      warn!(event = "service_transition_rejected", service = %id, error = %e);
    }
  }

  /// Transition, store and publish. The caller holds the service's lock.
  fn apply(&self, service: &mut Service, to: ServiceStatus) -> ServiceResult<()> {
    let from = service.status;
    service.transition_to(to)?;
    if to.is_terminal() {
      service.pid = None;
    }
    self.inner.store.store(service.clone());
    self.inner.counters.record(&self.inner.bus, Some(from), to);
    self.inner.bus.publish(Event::Service(service.clone()));
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{Command, Node, Step, Task};
  use std::time::Duration;

  struct Fixture {
    _dir: tempfile::TempDir,
    store: Arc<EntityStore>,
    orchestrator: ServiceOrchestrator,
  }

  fn fixture(services: Vec<Service>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(EntityStore::new());
    for service in services {
      store.store(service);
    }
    let bus = EventBus::new(256);
    let tasks = TaskRunner::new(Arc::clone(&store), bus.clone(), dir.path().to_path_buf(), "spawn");
    let orchestrator = ServiceOrchestrator::new(Arc::clone(&store), bus, tasks, dir.path().to_path_buf());
    Fixture {
      _dir: dir,
      store,
      orchestrator,
    }
  }

  fn service(name: &str, command: &str, deps: &[&str]) -> Service {
    let mut s = Service::new(Id::new(Service::KIND, [name]), name, command);
    s.dependency_ids = deps.iter().map(|d| Id::new(Service::KIND, [*d])).collect();
    s
  }

  fn hook(store: &EntityStore, name: &str, run: &str) -> Id {
    let mut task = Task::new(Id::new(Task::KIND, [name]), name);
    let command = Command::new(Id::new(Command::KIND, [name]), run);
    let step = Step {
      id: Id::new(Step::KIND, [name]),
      task_id: task.id.clone(),
      command_ids: vec![command.id.clone()],
      project_ids: Vec::new(),
    };
    task.step_ids.push(step.id.clone());
    let id = task.id.clone();
    store.store(command);
    store.store(step);
    store.store(task);
    id
  }

  async fn wait_status(store: &EntityStore, id: &Id, status: ServiceStatus) {
    for _ in 0..300 {
      if store.load::<Service>(id).map(|s| s.status) == Ok(status) {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("service {} never reached {:?}", id, status);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn start_then_stop() {
    let svc = service("web", "sleep 30", &[]);
    let id = svc.id.clone();
    let f = fixture(vec![svc]);
    f.orchestrator.start(&id, &BTreeMap::new()).await.unwrap();
    let running: Service = f.store.load(&id).unwrap();
    assert_eq!(running.status, ServiceStatus::Running);
    assert!(running.pid.is_some());

    f.orchestrator.stop(&id).await.unwrap();
    wait_status(&f.store, &id, ServiceStatus::Stopped).await;
    assert!(f.store.load::<Service>(&id).unwrap().pid.is_none());
  }

  #[tokio::test]
  async fn stop_requires_running() {
    let svc = service("idle", "true", &[]);
    let id = svc.id.clone();
    let f = fixture(vec![svc]);
    assert!(matches!(
      f.orchestrator.stop(&id).await,
      Err(ServiceError::NotRunning(_))
    ));
  }

  #[tokio::test]
  async fn starting_service_conflicts() {
    let mut svc = service("busy", "sleep 30", &[]);
    svc.status = ServiceStatus::Starting;
    let id = svc.id.clone();
    let f = fixture(vec![svc]);
    assert!(matches!(
      f.orchestrator.start(&id, &BTreeMap::new()).await,
      Err(ServiceError::Conflict(_))
    ));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn failing_before_hook_prevents_spawn() {
    let mut svc = service("hooked", "touch spawned; sleep 30", &[]);
    let id = svc.id.clone();
    let f = fixture(Vec::new());
    svc.before_hook_ids = vec![hook(&f.store, "pre", "exit 1")];
    f.store.store(svc);

    let err = f.orchestrator.start(&id, &BTreeMap::new()).await.unwrap_err();
    assert!(matches!(err, ServiceError::Hook { .. }));
    assert_eq!(f.store.load::<Service>(&id).unwrap().status, ServiceStatus::Failed);
    assert!(!f._dir.path().join("spawned").exists());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn abnormal_exit_fails_after_hooks() {
    let mut svc = service("crash", "exit 3", &[]);
    let id = svc.id.clone();
    let f = fixture(Vec::new());
    svc.after_hook_ids = vec![hook(&f.store, "post", "touch after")];
    f.store.store(svc);

    f.orchestrator.start(&id, &BTreeMap::new()).await.unwrap();
    wait_status(&f.store, &id, ServiceStatus::Failed).await;
    assert!(f._dir.path().join("after").exists());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn after_hook_failure_fails_clean_exit() {
    let mut svc = service("tidy", "true", &[]);
    let id = svc.id.clone();
    let f = fixture(Vec::new());
    svc.after_hook_ids = vec![hook(&f.store, "post", "exit 2")];
    f.store.store(svc);

    f.orchestrator.start(&id, &BTreeMap::new()).await.unwrap();
    wait_status(&f.store, &id, ServiceStatus::Failed).await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn variables_merge_across_dependencies() {
    let mut db = service("db", "printf %s \"$PORT\" > db.port; sleep 30", &[]);
    db.variables = vec![crate::domain::Variable {
      name: "PORT".into(),
      default: Some("5432".into()),
    }];
    let mut app = service("app", "printf %s \"$PORT\" > app.port; sleep 30", &["db"]);
    app.variables = vec![crate::domain::Variable {
      name: "PORT".into(),
      default: Some("8080".into()),
    }];
    let app_id = app.id.clone();
    let f = fixture(vec![db, app]);
    f.orchestrator.start(&app_id, &BTreeMap::new()).await.unwrap();

    let dir = f._dir.path().to_path_buf();
    for _ in 0..300 {
      if dir.join("db.port").exists() && dir.join("app.port").exists() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(std::fs::read_to_string(dir.join("app.port")).unwrap(), "5432");
    f.orchestrator.clean(&CancellationToken::new()).await.unwrap();
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn metrics_follow_transitions() {
    let svc = service("m", "sleep 30", &[]);
    let id = svc.id.clone();
    let f = fixture(vec![svc]);
    assert_eq!(f.orchestrator.metrics().get("stopped"), Some(&1));
    f.orchestrator.start(&id, &BTreeMap::new()).await.unwrap();
    assert_eq!(f.orchestrator.metrics().get("running"), Some(&1));
    assert_eq!(f.orchestrator.metrics().get("stopped"), Some(&0));
    f.orchestrator.clean(&CancellationToken::new()).await.unwrap();
    assert_eq!(f.orchestrator.metrics().get("stopped"), Some(&1));
  }
}
