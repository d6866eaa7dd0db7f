//! Observational per-status counters, republished on every transition.
//! Never consulted for control flow.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::bus::{Event, EventBus};
use crate::domain::Status;

pub struct StatusCounters<S: Status> {
  subsystem: &'static str,
  counts: Vec<AtomicI64>,
  _status: PhantomData<S>,
}

impl<S: Status> StatusCounters<S> {
  pub fn new(subsystem: &'static str) -> Self {
    Self {
      subsystem,
      counts: S::ALL.iter().map(|_| AtomicI64::new(0)).collect(),
      _status: PhantomData,
    }
  }

  /// Move one entity from `from` (or from nowhere, for new entities) to
  /// `to`, then publish the recomputed snapshot.
  pub fn record(&self, bus: &EventBus, from: Option<S>, to: S) {
    if let Some(from) = from {
      self.counts[from.index()].fetch_sub(1, Ordering::SeqCst);
    }
    self.counts[to.index()].fetch_add(1, Ordering::SeqCst);
    bus.publish(Event::Metrics {
      subsystem: self.subsystem.to_string(),
      counts: self.snapshot(),
    });
  }

  /// Replace the counts with a fresh tally, without publishing.
  pub fn reset<I: IntoIterator<Item = S>>(&self, statuses: I) {
    for count in &self.counts {
      count.store(0, Ordering::SeqCst);
    }
    for status in statuses {
      self.counts[status.index()].fetch_add(1, Ordering::SeqCst);
    }
  }

  /// Remove one entity in `status` from the counts, e.g. on truncation.
  pub fn forget(&self, status: S) {
    self.counts[status.index()].fetch_sub(1, Ordering::SeqCst);
  }

  pub fn get(&self, status: S) -> i64 {
    self.counts[status.index()].load(Ordering::SeqCst)
  }

  pub fn snapshot(&self) -> BTreeMap<String, i64> {
    S::ALL
      .iter()
      .map(|s| (s.as_str().to_string(), self.get(*s)))
      .collect()
  }
}
