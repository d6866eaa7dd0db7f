//! Runtime wiring and graceful shutdown.
//!
//! [`Runtime::open`] loads config and catalog from a project root and builds
//! every component on one [`EntityStore`] and [`EventBus`]. [`Runtime::start`]
//! launches the worker pool; [`DaemonHandle::shutdown`] stops it and then
//! waits for services under the configured deadline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::catalog::{Catalog, CatalogError};
use crate::config::{self, Config, ConfigError};
use crate::domain::JobStatus;
use crate::queue::{QueueError, WorkQueue};
use crate::service::{ServiceError, ServiceOrchestrator};
use crate::store::EntityStore;
use crate::sync::{GitSync, RepoSync, Syncer};
use crate::task::TaskRunner;

#[derive(Debug, Error)]
pub enum DaemonError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Catalog(#[from] CatalogError),
  #[error(transparent)]
  Queue(#[from] QueueError),
  #[error(transparent)]
  Service(#[from] ServiceError),
  #[error("worker pool panicked: {0}")]
  WorkerPanic(String),
  #[error("shutdown did not complete within {0:?}")]
  ShutdownTimeout(Duration),
}

/// Every component, sharing one store and bus.
#[derive(Clone)]
pub struct Runtime {
  pub config: Config,
  pub root: PathBuf,
  pub store: Arc<EntityStore>,
  pub bus: EventBus,
  pub queue: WorkQueue,
  pub tasks: TaskRunner,
  pub services: ServiceOrchestrator,
  pub syncer: Syncer,
}

impl Runtime {
  /// Load `.workbench/config.toml` layered over the global config, install
  /// `.workbench/catalog.toml`, and build the components.
  pub fn open(root: &Path) -> Result<Self, DaemonError> {
    let config = config::load(Some(root))?;
    let catalog = Catalog::load(&config::catalog_path(root))?;
    Self::with_catalog(root, config, &catalog, Arc::new(GitSync))
  }

  /// Build from explicit parts; `catalog` is installed before the
  /// orchestrator seeds its metrics.
  pub fn with_catalog(
    root: &Path,
    config: Config,
    catalog: &Catalog,
    backend: Arc<dyn RepoSync>,
  ) -> Result<Self, DaemonError> {
    let store = Arc::new(EntityStore::new());
    catalog.install(&store, root)?;

    let bus = EventBus::new(config.history_capacity);
    let queue = WorkQueue::new(Arc::clone(&store), bus.clone(), config.workers, config.max_jobs);
    let tasks = TaskRunner::new(
      Arc::clone(&store),
      bus.clone(),
      root.to_path_buf(),
      &config.spawn_prefix,
    );
    let services = ServiceOrchestrator::new(Arc::clone(&store), bus.clone(), tasks.clone(), root.to_path_buf());
    let syncer = Syncer::new(Arc::clone(&store), bus.clone(), queue.clone(), backend);

    Ok(Self {
      config,
      root: root.to_path_buf(),
      store,
      bus,
      queue,
      tasks,
      services,
      syncer,
    })
  }

  /// Launch the worker pool in the background.
  pub fn start(self) -> DaemonHandle {
    let cancel = CancellationToken::new();
    let queue = self.queue.clone();
    let pool_cancel = cancel.clone();
    let workers = tokio::spawn(async move { queue.work(pool_cancel).await });
    info!(
      event = "daemon_started",
      root = %self.root.display(),
      workers = self.config.workers
    );
    DaemonHandle {
      runtime: self,
      cancel,
      workers,
    }
  }
}

/// Handle to a started runtime.
pub struct DaemonHandle {
  runtime: Runtime,
  cancel: CancellationToken,
  workers: JoinHandle<Result<(), QueueError>>,
}

impl DaemonHandle {
  pub fn runtime(&self) -> &Runtime {
    &self.runtime
  }

  /// Stop the worker pool, interrupt detached task processes, then stop all
  /// services. Jobs still running and services still stopping share one
  /// `shutdown_timeout_secs` deadline; exceeding it yields
  /// [`DaemonError::ShutdownTimeout`], which callers treat as fatal.
  pub async fn shutdown(self) -> Result<(), DaemonError> {
    let DaemonHandle {
      runtime,
      cancel,
      workers,
    } = self;
    info!(event = "daemon_shutdown_begin");
    let timeout = Duration::from_secs(runtime.config.shutdown_timeout_secs);
    let deadline = tokio::time::Instant::now() + timeout;

    cancel.cancel();
    let mut jobs_overran = false;
    match tokio::time::timeout_at(deadline, workers).await {
      Ok(Ok(result)) => result?,
      Ok(Err(e)) => return Err(DaemonError::WorkerPanic(e.to_string())),
      Err(_) => {
        // Queued jobs are already swept; the stragglers keep their tokens.
        let running = runtime.queue.jobs(Some(JobStatus::Running)).len();
        warn!(event = "daemon_jobs_overran", running);
        jobs_overran = true;
      }
    }

    let detached = runtime.tasks.stop_all().await;
    let clean_cancel = CancellationToken::new();
    match tokio::time::timeout_at(deadline, runtime.services.clean(&clean_cancel)).await {
      Ok(result) => result?,
      Err(_) => {
        clean_cancel.cancel();
        error!(event = "daemon_shutdown_timeout", timeout_secs = timeout.as_secs());
        return Err(DaemonError::ShutdownTimeout(timeout));
      }
    }
    if jobs_overran {
      error!(event = "daemon_shutdown_timeout", timeout_secs = timeout.as_secs());
      return Err(DaemonError::ShutdownTimeout(timeout));
    }

    info!(event = "daemon_shutdown_complete", detached);
    Ok(())
  }
}
