use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::domain::Priority;
use crate::store::Id;

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub(crate) type JobFn = Box<dyn FnOnce(CancellationToken) -> JobFuture + Send>;

pub(crate) struct Pending {
  pub(crate) id: Id,
  pub(crate) run: JobFn,
}

/// Two FIFO lanes; `pop` always drains `high` first.
#[derive(Default)]
pub(crate) struct Lanes {
  high: VecDeque<Pending>,
  normal: VecDeque<Pending>,
  /// Set once the pool has stopped; nothing is queued afterwards.
  pub(crate) closed: bool,
}

impl Lanes {
  pub(crate) fn push(&mut self, priority: Priority, pending: Pending) {
    match priority {
      Priority::High => self.high.push_back(pending),
      Priority::Normal => self.normal.push_back(pending),
    }
  }

  pub(crate) fn pop(&mut self) -> Option<Pending> {
    self.high.pop_front().or_else(|| self.normal.pop_front())
  }

  /// Close the lanes and hand back everything still waiting.
  pub(crate) fn close(&mut self) -> Vec<Pending> {
    self.closed = true;
    let mut drained: Vec<Pending> = self.high.drain(..).collect();
    drained.extend(self.normal.drain(..));
    drained
  }

  pub(crate) fn len(&self) -> usize {
    self.high.len() + self.normal.len()
  }
}
