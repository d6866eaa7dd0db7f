//! Bounded-concurrency worker pool over two priority lanes.
//!
//! [`WorkQueue::submit`] records a [`Job`] and returns immediately; a fixed
//! number of workers started by [`WorkQueue::work`] drain the lanes, high
//! priority first. Cancellation is cooperative: a job function receives a
//! token and the job only reaches a terminal status once the function
//! returns.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{Event, EventBus};
use crate::domain::{InvalidTransition, Job, JobStatus, Priority, Status};
use crate::metrics::StatusCounters;
use crate::store::{EntityStore, Id, StoreError};

mod lanes;

pub use lanes::JobFuture;
use lanes::{JobFn, Lanes, Pending};

const STOPPED_MESSAGE: &str = "work queue stopped before the job ran";

#[derive(Debug, Error)]
pub enum QueueError {
  #[error("job {0} is not running")]
  NotRunning(Id),
  #[error("work queue is already working")]
  AlreadyWorking,
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error(transparent)]
  Transition(#[from] InvalidTransition),
}

struct Inner {
  store: Arc<EntityStore>,
  bus: EventBus,
  workers: usize,
  max_jobs: usize,
  lanes: Mutex<Lanes>,
  ready: Notify,
  /// Cancellation tokens of jobs currently executing.
  running: DashMap<Id, CancellationToken>,
  /// Job IDs in submission order, for listing and truncation.
  retained: Mutex<VecDeque<Id>>,
  working: AtomicBool,
  counters: StatusCounters<JobStatus>,
}

#[derive(Clone)]
pub struct WorkQueue {
  inner: Arc<Inner>,
}

impl WorkQueue {
  pub fn new(store: Arc<EntityStore>, bus: EventBus, workers: usize, max_jobs: usize) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        bus,
        workers: workers.max(1),
        max_jobs,
        lanes: Mutex::new(Lanes::default()),
        ready: Notify::new(),
        running: DashMap::new(),
        retained: Mutex::new(VecDeque::new()),
        working: AtomicBool::new(false),
        counters: StatusCounters::new("jobs"),
      }),
    }
  }

  /// Record a job and enqueue `f` without waiting for it to run.
  ///
  /// After the pool has stopped the job is recorded as `failed` and `f` is
  /// dropped unrun.
  pub fn submit<F, Fut>(&self, name: &str, owner_id: &Id, priority: Priority, f: F) -> Id
  where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
  {
    let run: JobFn = Box::new(move |cancel| -> JobFuture { Box::pin(f(cancel)) });
    let inner = &self.inner;

    let mut lanes = inner.lanes.lock();
    let status = if lanes.closed {
      JobStatus::Failed
    } else {
      JobStatus::Queued
    };
    let mut job = Job::new(name, owner_id.clone(), priority, status);
    if lanes.closed {
      job.error = Some(STOPPED_MESSAGE.to_string());
    }
    let id = job.id.clone();
    inner.store.store(job.clone());
    inner.counters.record(&inner.bus, None, status);
    inner.bus.publish(Event::Job(job));
    let queued = !lanes.closed;
    if queued {
      lanes.push(priority, Pending { id: id.clone(), run });
    }
    drop(lanes);

    self.retain(&id);
    if queued {
      inner.ready.notify_one();
    }
    debug!(event = "job_submitted", job = %id, name, ?priority, status = status.as_str(), owner = %owner_id);
    id
  }

  /// Run the worker pool until `cancel` fires.
  ///
  /// On cancellation the lanes close and every job still queued is marked
  /// `failed` at once. Running jobs see the cancellation through their own
  /// token and finish on their own; `work` returns after the last of them.
  pub async fn work(&self, cancel: CancellationToken) -> Result<(), QueueError> {
    if self.inner.working.swap(true, Ordering::SeqCst) {
      return Err(QueueError::AlreadyWorking);
    }
    info!(event = "queue_started", workers = self.inner.workers);

    let mut workers = JoinSet::new();
    for n in 0..self.inner.workers {
      let queue = self.clone();
      let cancel = cancel.clone();
      workers.spawn(async move { queue.worker(n, cancel).await });
    }

    cancel.cancelled().await;
    let swept = self.sweep().await;
    info!(event = "queue_draining", swept, running = self.inner.running.len());

    while let Some(res) = workers.join_next().await {
      if let Err(e) = res {
        error!(event = "queue_worker_crashed", error = %e);
      }
    }
    info!(event = "queue_stopped", swept);
    Ok(())
  }

  /// Ask a running job to stop. The job moves to `stopping` and its token
  /// is cancelled; it becomes terminal when its function returns.
  pub async fn stop(&self, id: &Id) -> Result<(), QueueError> {
    let inner = &self.inner;
    let _guard = inner.store.lock([id]).await;
    let mut job: Job = inner.store.load(id)?;
    if job.status != JobStatus::Running {
      return Err(QueueError::NotRunning(id.clone()));
    }
    job.transition_to(JobStatus::Stopping)?;
    inner.store.store(job.clone());
    inner
      .counters
      .record(&inner.bus, Some(JobStatus::Running), JobStatus::Stopping);
    inner.bus.publish(Event::Job(job));
    if let Some(cancel) = inner.running.get(id) {
      cancel.cancel();
    }
    info!(event = "job_stop_requested", job = %id);
    Ok(())
  }

  pub fn job(&self, id: &Id) -> Result<Job, StoreError> {
    self.inner.store.load(id)
  }

  /// Retained jobs in submission order, optionally filtered by status.
  pub fn jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
    let ids: Vec<Id> = self.inner.retained.lock().iter().cloned().collect();
    ids
      .iter()
      .filter_map(|id| self.inner.store.load::<Job>(id).ok())
      .filter(|job| status.is_none_or(|s| job.status == s))
      .collect()
  }

  pub fn metrics(&self) -> BTreeMap<String, i64> {
    self.inner.counters.snapshot()
  }

  pub fn queued_len(&self) -> usize {
    self.inner.lanes.lock().len()
  }

  async fn worker(&self, n: usize, cancel: CancellationToken) {
    debug!(event = "queue_worker_started", worker = n);
    loop {
      let notified = self.inner.ready.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      let next = {
        let mut lanes = self.inner.lanes.lock();
        if lanes.closed || cancel.is_cancelled() {
          break;
        }
        lanes.pop()
      };
      match next {
        Some(pending) => self.execute(pending, &cancel).await,
        None => {
          tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut notified => {}
          }
        }
      }
    }
    debug!(event = "queue_worker_stopped", worker = n);
  }

  async fn execute(&self, pending: Pending, pool: &CancellationToken) {
    let Pending { id, run } = pending;
    let inner = &self.inner;
    let cancel = pool.child_token();

    let name = {
      let _guard = inner.store.lock([&id]).await;
      let mut job: Job = match inner.store.load(&id) {
        Ok(job) => job,
        Err(e) => {
          warn!(event = "job_lost", job = %id, error = %e);
          return;
        }
      };
      if pool.is_cancelled() {
        None
      } else {
        if let Err(e) = job.transition_to(JobStatus::Running) {
          warn!(event = "job_skipped", job = %id, error = %e);
          return;
        }
        inner.running.insert(id.clone(), cancel.clone());
        inner.store.store(job.clone());
        inner
          .counters
          .record(&inner.bus, Some(JobStatus::Queued), JobStatus::Running);
        let name = job.name.clone();
        inner.bus.publish(Event::Job(job));
        Some(name)
      }
    };
    // Popped just as the pool stopped; treat it like a swept job.
    let Some(name) = name else {
      drop(run);
      self
        .finish(&id, JobStatus::Failed, Some(STOPPED_MESSAGE.to_string()))
        .await;
      return;
    };
    info!(event = "job_started", job = %id, name = %name);

    // Run on its own task so a panicking job fails instead of killing the worker.
    let result = match tokio::spawn(run(cancel)).await {
      Ok(result) => result,
      Err(e) => Err(anyhow!("job panicked: {}", e)),
    };
    inner.running.remove(&id);

    match result {
      Ok(()) => self.finish(&id, JobStatus::Done, None).await,
      Err(e) => {
        warn!(event = "job_failed", job = %id, name = %name, error = %format!("{:#}", e));
        self.finish(&id, JobStatus::Failed, Some(format!("{:#}", e))).await
      }
    }
  }

  async fn finish(&self, id: &Id, to: JobStatus, error: Option<String>) {
    let inner = &self.inner;
    let _guard = inner.store.lock([id]).await;
    let mut job: Job = match inner.store.load(id) {
      Ok(job) => job,
      Err(e) => {
        warn!(event = "job_lost", job = %id, error = %e);
        return;
      }
    };
    let from = job.status;
    if let Err(e) = job.transition_to(to) {
      warn!(event = "job_transition_rejected", job = %id, error = %e);
      return;
    }
    job.error = error;
    inner.store.store(job.clone());
    inner.counters.record(&inner.bus, Some(from), to);
    inner.bus.publish(Event::Job(job));
    debug!(event = "job_finished", job = %id, status = to.as_str());
  }

  async fn sweep(&self) -> usize {
    // Drop the closures here; only the IDs cross the awaits below.
    let drained: Vec<Id> = self
      .inner
      .lanes
      .lock()
      .close()
      .into_iter()
      .map(|pending| pending.id)
      .collect();
    for id in &drained {
      self
        .finish(id, JobStatus::Failed, Some(STOPPED_MESSAGE.to_string()))
        .await;
    }
    drained.len()
  }

  /// Track a new job and drop the oldest terminal jobs beyond `max_jobs`.
  ///
  /// A job whose lock is currently held is skipped and reconsidered on the
  /// next submit.
  fn retain(&self, id: &Id) {
    let inner = &self.inner;
    let mut retained = inner.retained.lock();
    retained.push_back(id.clone());
    let mut excess = retained.len().saturating_sub(inner.max_jobs);
    if excess == 0 {
      return;
    }
    retained.retain(|id| {
      if excess == 0 {
        return true;
      }
      let Some(_guard) = inner.store.try_lock(id) else {
        return true;
      };
      match inner.store.load::<Job>(id) {
        Ok(job) if job.status.is_terminal() => {
          inner.store.delete(id);
          inner.counters.forget(job.status);
          excess -= 1;
          false
        }
        Ok(_) => true,
        Err(_) => {
          excess -= 1;
          false
        }
      }
    });
  }
}
