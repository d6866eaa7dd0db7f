//! Repository synchronisation for workspace projects.
//!
//! [`RepoSync`] is the backend seam; [`GitSync`] implements it with
//! `git2`. [`Syncer`] turns a sync into a queued job per project that
//! clones missing checkouts and fast-forwards existing ones.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use git2::Repository;
use git2::build::{CheckoutBuilder, RepoBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus};
use crate::domain::{Priority, Project, SyncStatus, Workspace};
use crate::queue::WorkQueue;
use crate::store::{EntityStore, Id, StoreError};

/// Repository operations consumed by the sync jobs. Blocking.
pub trait RepoSync: Send + Sync + 'static {
  fn clone_repo(&self, url: &str, reference: Option<&str>, dest: &Path) -> anyhow::Result<()>;

  /// Fetch `origin` and fast-forward the checked out branch.
  fn pull(&self, dest: &Path) -> anyhow::Result<()>;

  fn current_branch(&self, dest: &Path) -> anyhow::Result<String>;

  /// Whether commit `a` is an ancestor of (or equal to) commit `b`.
  fn ancestor_of(&self, dest: &Path, a: &str, b: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GitSync;

impl RepoSync for GitSync {
  fn clone_repo(&self, url: &str, reference: Option<&str>, dest: &Path) -> anyhow::Result<()> {
    let mut builder = RepoBuilder::new();
    if let Some(branch) = reference {
      builder.branch(branch);
    }
    builder
      .clone(url, dest)
      .with_context(|| format!("clone {} into {}", url, dest.display()))?;
    Ok(())
  }

  fn pull(&self, dest: &Path) -> anyhow::Result<()> {
    let repo = Repository::open(dest).with_context(|| format!("open {}", dest.display()))?;
    let branch = head_branch(&repo)?;
    let mut remote = repo.find_remote("origin").context("find remote origin")?;
    remote
      .fetch(&[branch.as_str()], None, None)
      .with_context(|| format!("fetch origin/{}", branch))?;

    let fetch_head = repo.find_reference("FETCH_HEAD")?;
    let incoming = repo.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = repo.merge_analysis(&[&incoming])?;
    if analysis.is_up_to_date() {
      debug!(event = "sync_up_to_date", path = %dest.display(), branch = %branch);
      return Ok(());
    }
    if !analysis.is_fast_forward() {
      bail!("{} cannot be fast-forwarded to origin/{}", dest.display(), branch);
    }
    let refname = format!("refs/heads/{}", branch);
    let mut local = repo.find_reference(&refname)?;
    local.set_target(incoming.id(), "workbench: fast-forward")?;
    repo.set_head(&refname)?;
    repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
    Ok(())
  }

  fn current_branch(&self, dest: &Path) -> anyhow::Result<String> {
    let repo = Repository::open(dest).with_context(|| format!("open {}", dest.display()))?;
    head_branch(&repo)
  }

  fn ancestor_of(&self, dest: &Path, a: &str, b: &str) -> anyhow::Result<bool> {
    let repo = Repository::open(dest).with_context(|| format!("open {}", dest.display()))?;
    let a = repo.revparse_single(a)?.peel_to_commit()?.id();
    let b = repo.revparse_single(b)?.peel_to_commit()?.id();
    Ok(a == b || repo.graph_descendant_of(b, a)?)
  }
}

fn head_branch(repo: &Repository) -> anyhow::Result<String> {
  let head = repo.head().context("resolve HEAD")?;
  if !head.is_branch() {
    bail!("HEAD is detached");
  }
  head
    .shorthand()
    .map(str::to_string)
    .ok_or_else(|| anyhow!("branch name is not valid UTF-8"))
}

/// Queues sync jobs and records their outcome on each [`Project`].
#[derive(Clone)]
pub struct Syncer {
  store: Arc<EntityStore>,
  bus: EventBus,
  queue: WorkQueue,
  backend: Arc<dyn RepoSync>,
}

impl Syncer {
  pub fn new(store: Arc<EntityStore>, bus: EventBus, queue: WorkQueue, backend: Arc<dyn RepoSync>) -> Self {
    Self {
      store,
      bus,
      queue,
      backend,
    }
  }

  /// Submit a sync job for one project. Returns `None` for projects
  /// without a remote.
  pub fn sync_project(&self, project_id: &Id) -> Result<Option<Id>, StoreError> {
    let project: Project = self.store.load(project_id)?;
    let Some(url) = project.url.clone() else {
      debug!(event = "sync_skipped", project = %project.name);
      return Ok(None);
    };
    let syncer = self.clone();
    let id = project.id.clone();
    let job_id = self.queue.submit(
      &format!("sync {}", project.name),
      project_id,
      Priority::Normal,
      move |cancel| async move { syncer.run(id, url, cancel).await },
    );
    Ok(Some(job_id))
  }

  /// Submit one sync job per project of the workspace.
  pub fn sync_workspace(&self, workspace_id: &Id) -> Result<Vec<Id>, StoreError> {
    let workspace: Workspace = self.store.load(workspace_id)?;
    let mut jobs = Vec::new();
    for project_id in &workspace.project_ids {
      if let Some(job) = self.sync_project(project_id)? {
        jobs.push(job);
      }
    }
    info!(event = "workspace_sync_submitted", workspace = %workspace.name, jobs = jobs.len());
    Ok(jobs)
  }

  /// Git itself cannot be interrupted; on cancellation the blocking work is
  /// abandoned and its outcome ignored.
  async fn run(&self, id: Id, url: String, cancel: CancellationToken) -> anyhow::Result<()> {
    if cancel.is_cancelled() {
      bail!("sync cancelled before it started");
    }
    let project = self.mark(&id, SyncStatus::Syncing).await?;
    let backend = Arc::clone(&self.backend);
    let path = project.path.clone();
    let reference = project.reference.clone();
    let blocking = tokio::task::spawn_blocking(move || {
      if path.exists() {
        backend.pull(&path)
      } else {
        backend.clone_repo(&url, reference.as_deref(), &path)
      }
    });
    let result = tokio::select! {
      joined = blocking => joined
        .map_err(|e| anyhow!("sync worker panicked: {}", e))
        .and_then(|r| r),
      _ = cancel.cancelled() => Err(anyhow!("sync cancelled")),
    };

    match &result {
      Ok(()) => {
        self.mark(&id, SyncStatus::Synced).await?;
        info!(event = "project_synced", project = %project.name);
      }
      Err(e) => {
        self.mark(&id, SyncStatus::Failed).await?;
        warn!(event = "project_sync_failed", project = %project.name, error = %format!("{:#}", e));
      }
    }
    result
  }

  async fn mark(&self, id: &Id, status: SyncStatus) -> Result<Project, StoreError> {
    let _guard = self.store.lock([id]).await;
    let mut project: Project = self.store.load(id)?;
    project.sync_status = status;
    self.store.store(project.clone());
    self.bus.publish(Event::Project(project.clone()));
    Ok(project)
  }
}
