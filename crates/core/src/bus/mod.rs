//! Publish/subscribe by message kind with sequence numbers and a bounded,
//! replayable history.
//!
//! Waiting for the effect of an action without racing it:
//! take [`EventBus::last_sequence`] before acting, then subscribe with that
//! checkpoint as `since`. Anything published in between is replayed from
//! history, so delivery is at-least-once from the caller's point of view.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::domain::{Job, Process, Project, Service, Task};

mod history;

use history::History;

/// Message kinds published by the core.
pub mod kinds {
  pub const JOB: &str = "job";
  pub const SERVICE: &str = "service";
  pub const TASK: &str = "task";
  pub const PROCESS: &str = "process";
  pub const PROJECT: &str = "project";
  pub const METRICS_PREFIX: &str = "metrics.";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
  Job(Job),
  Service(Service),
  Task(Task),
  Process(Process),
  Project(Project),
  Metrics {
    subsystem: String,
    counts: BTreeMap<String, i64>,
  },
  /// Kinds defined outside the core.
  Custom {
    kind: String,
    payload: serde_json::Value,
  },
}

impl Event {
  pub fn kind(&self) -> String {
    match self {
      Event::Job(_) => kinds::JOB.to_string(),
      Event::Service(_) => kinds::SERVICE.to_string(),
      Event::Task(_) => kinds::TASK.to_string(),
      Event::Process(_) => kinds::PROCESS.to_string(),
      Event::Project(_) => kinds::PROJECT.to_string(),
      Event::Metrics { subsystem, .. } => format!("{}{}", kinds::METRICS_PREFIX, subsystem),
      Event::Custom { kind, .. } => kind.clone(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
  pub seq: u64,
  pub kind: String,
  pub event: Event,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
  #[error("invalid sequence checkpoint: {0:?}")]
  InvalidCheckpoint(String),
}

/// Parse the string form of a checkpoint used by API layers.
/// An empty string means "no replay".
pub fn parse_since(raw: &str) -> Result<Option<u64>, BusError> {
  let raw = raw.trim();
  if raw.is_empty() {
    return Ok(None);
  }
  raw
    .parse::<u64>()
    .map(Some)
    .map_err(|_| BusError::InvalidCheckpoint(raw.to_string()))
}

struct Subscriber {
  id: u64,
  kind: String,
  tx: UnboundedSender<Arc<Message>>,
  cancel: CancellationToken,
}

struct State {
  seq: u64,
  next_subscriber: u64,
  history: History,
  subscribers: Vec<Subscriber>,
}

struct Inner {
  state: Mutex<State>,
}

#[derive(Clone)]
pub struct EventBus {
  inner: Arc<Inner>,
}

impl EventBus {
  /// `capacity` is the number of messages reachable through replay.
  pub fn new(capacity: usize) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State {
          seq: 0,
          next_subscriber: 0,
          history: History::new(capacity),
          subscribers: Vec::new(),
        }),
      }),
    }
  }

  /// Assign the next sequence number, record and fan out. Never blocks on
  /// subscribers.
  pub fn publish(&self, event: Event) -> u64 {
    let mut state = self.inner.state.lock();
    state.seq += 1;
    let msg = Arc::new(Message {
      seq: state.seq,
      kind: event.kind(),
      event,
    });
    state.history.push(Arc::clone(&msg));
    state.subscribers.retain(|sub| {
      if sub.cancel.is_cancelled() {
        return false;
      }
      if sub.kind != msg.kind {
        return !sub.tx.is_closed();
      }
      sub.tx.send(Arc::clone(&msg)).is_ok()
    });
    trace!(event = "bus_publish", seq = msg.seq, kind = %msg.kind);
    msg.seq
  }

  /// Current watermark; pass it as `since` to a later subscription.
  pub fn last_sequence(&self) -> u64 {
    self.inner.state.lock().seq
  }

  /// Register for live messages of `kind`. With `since = Some(n)` every
  /// retained message of that kind with a sequence above `n` is queued
  /// first, in order. Registration and replay happen under the same lock
  /// as [`publish`](Self::publish), so no message falls between them.
  pub fn subscribe(&self, kind: &str, since: Option<u64>, cancel: CancellationToken) -> Subscription {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut state = self.inner.state.lock();
    state.next_subscriber += 1;
    let id = state.next_subscriber;
    let mut replayed = 0usize;
    if let Some(since) = since {
      for msg in state.history.since(kind, since) {
        let _ = tx.send(Arc::clone(msg));
        replayed += 1;
      }
    }
    state.subscribers.push(Subscriber {
      id,
      kind: kind.to_string(),
      tx,
      cancel: cancel.clone(),
    });
    trace!(event = "bus_subscribe", subscriber = id, kind, ?since, replayed);
    Subscription {
      id,
      rx,
      cancel,
      bus: Arc::clone(&self.inner),
    }
  }

  /// Callback form of [`subscribe`](Self::subscribe): messages are handed to
  /// `callback` on a spawned task until `cancel` fires.
  pub fn subscribe_with<F>(
    &self,
    kind: &str,
    since: Option<u64>,
    cancel: CancellationToken,
    mut callback: F,
  ) -> JoinHandle<()>
  where
    F: FnMut(&Message) + Send + 'static,
  {
    let mut sub = self.subscribe(kind, since, cancel);
    tokio::spawn(async move {
      while let Some(msg) = sub.recv().await {
        callback(&msg);
      }
    })
  }

  /// Retained messages of `kind` above `since`.
  pub fn history(&self, kind: &str, since: u64) -> Vec<Arc<Message>> {
    let state = self.inner.state.lock();
    state.history.since(kind, since).cloned().collect()
  }

  pub fn subscriber_count(&self) -> usize {
    self.inner.state.lock().subscribers.len()
  }
}

/// Live registration returned by [`EventBus::subscribe`]. Dropping it, or
/// cancelling its token, removes the registration.
pub struct Subscription {
  id: u64,
  rx: UnboundedReceiver<Arc<Message>>,
  cancel: CancellationToken,
  bus: Arc<Inner>,
}

impl Subscription {
  /// Next message, or `None` once the subscription was cancelled.
  pub async fn recv(&mut self) -> Option<Arc<Message>> {
    tokio::select! {
      biased;
      _ = self.cancel.cancelled() => None,
      msg = self.rx.recv() => msg,
    }
  }

  /// Next already-delivered message without waiting.
  pub fn try_recv(&mut self) -> Option<Arc<Message>> {
    if self.cancel.is_cancelled() {
      return None;
    }
    self.rx.try_recv().ok()
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    let id = self.id;
    self.bus.state.lock().subscribers.retain(|sub| sub.id != id);
  }
}
