//! Concurrent entity map with an independent per-ID lock facility.
//!
//! Readers may [`load`](EntityStore::load) at any time; any
//! read-modify-store sequence must run while the ID's lock is held:
//!
//! ```ignore
//! let guard = store.lock([&id]).await;
//! let mut job: Job = store.load(&id)?;
//! job.transition_to(JobStatus::Running)?;
//! store.store(job);
//! store.unlock(guard);
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::domain::{Entity, Node};

mod id;

pub use id::Id;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
  #[error("not found: {0}")]
  NotFound(Id),
  #[error("entity {id} is a {found}, expected {expected}")]
  KindMismatch {
    id: Id,
    expected: &'static str,
    found: String,
  },
  #[error("invalid id: {0}")]
  InvalidId(String),
}

#[derive(Default)]
pub struct EntityStore {
  entities: DashMap<Id, Entity>,
  locks: DashMap<Id, Arc<Mutex<()>>>,
}

/// Locks held by one [`EntityStore::lock`] call; all are released on drop.
#[must_use = "dropping the guard releases the locks immediately"]
pub struct LockGuard {
  held: Vec<(Id, OwnedMutexGuard<()>)>,
}

impl LockGuard {
  pub fn ids(&self) -> impl Iterator<Item = &Id> {
    self.held.iter().map(|(id, _)| id)
  }
}

impl Drop for LockGuard {
  fn drop(&mut self) {
    // Release in reverse acquisition order.
    while let Some((id, guard)) = self.held.pop() {
      drop(guard);
      trace!(event = "entity_unlocked", id = %id);
    }
  }
}

impl EntityStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn store(&self, entity: impl Into<Entity>) {
    let entity = entity.into();
    self.entities.insert(entity.id().clone(), entity);
  }

  pub fn load_entity(&self, id: &Id) -> Option<Entity> {
    self.entities.get(id).map(|e| e.value().clone())
  }

  /// Load a typed entity, checking the kind tag encoded in `id` first.
  pub fn load<N: Node>(&self, id: &Id) -> Result<N, StoreError> {
    let kind = id.kind()?;
    if kind != N::KIND {
      return Err(StoreError::KindMismatch {
        id: id.clone(),
        expected: N::KIND,
        found: kind,
      });
    }
    let entity = self
      .load_entity(id)
      .ok_or_else(|| StoreError::NotFound(id.clone()))?;
    let found = entity.kind();
    N::from_entity(entity).ok_or_else(|| StoreError::KindMismatch {
      id: id.clone(),
      expected: N::KIND,
      found: found.to_string(),
    })
  }

  /// Like [`load`](Self::load) but treats absence as a programming error.
  pub fn must_load<N: Node>(&self, id: &Id) -> N {
    match self.load(id) {
      Ok(node) => node,
      Err(e) => panic!("must_load {}: {}", N::KIND, e),
    }
  }

  /// All entities of one kind, in no particular order.
  pub fn list<N: Node>(&self) -> Vec<N> {
    self
      .entities
      .iter()
      .filter_map(|e| N::from_entity(e.value().clone()))
      .collect()
  }

  pub fn contains(&self, id: &Id) -> bool {
    self.entities.contains_key(id)
  }

  /// Remove the entity. Its lock stays registered so late holders can
  /// still release it.
  pub fn delete(&self, id: &Id) {
    self.entities.remove(id);
  }

  /// Acquire the locks for every given ID.
  ///
  /// IDs are deduplicated and acquired in lexicographic order, so two
  /// callers locking overlapping sets can never deadlock on each other.
  pub async fn lock<'a, I>(&self, ids: I) -> LockGuard
  where
    I: IntoIterator<Item = &'a Id>,
  {
    let ordered: BTreeSet<&Id> = ids.into_iter().collect();
    let mut held = Vec::with_capacity(ordered.len());
    for id in ordered {
      let mutex = self.mutex_for(id);
      let guard = mutex.lock_owned().await;
      trace!(event = "entity_locked", id = %id);
      held.push((id.clone(), guard));
    }
    LockGuard { held }
  }

  /// Take the lock for `id` only if nobody holds it.
  pub fn try_lock(&self, id: &Id) -> Option<LockGuard> {
    let guard = self.mutex_for(id).try_lock_owned().ok()?;
    trace!(event = "entity_locked", id = %id);
    Some(LockGuard {
      held: vec![(id.clone(), guard)],
    })
  }

  /// Release locks taken by [`lock`](Self::lock).
  pub fn unlock(&self, guard: LockGuard) {
    drop(guard);
  }

  fn mutex_for(&self, id: &Id) -> Arc<Mutex<()>> {
    // Clone the Arc out so the map shard is not held across the await.
    self.locks.entry(id.clone()).or_default().value().clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{Command, Job, JobStatus, Priority};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn command(key: &str) -> Command {
    Command::new(Id::new(Command::KIND, [key]), "true")
  }

  #[test]
  fn typed_load_checks_kind() {
    let store = EntityStore::new();
    let cmd = command("a");
    store.store(cmd.clone());
    assert_eq!(store.load::<Command>(&cmd.id).unwrap(), cmd);
    match store.load::<Job>(&cmd.id).unwrap_err() {
      StoreError::KindMismatch {
        expected, found, ..
      } => {
        assert_eq!(expected, "Job");
        assert_eq!(found, "Command");
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn missing_entity_is_not_found() {
    let store = EntityStore::new();
    let id = Id::new(Command::KIND, ["nope"]);
    assert_eq!(store.load::<Command>(&id), Err(StoreError::NotFound(id)));
  }

  #[test]
  #[should_panic(expected = "must_load Command")]
  fn must_load_panics_when_absent() {
    let store = EntityStore::new();
    let _: Command = store.must_load(&Id::new(Command::KIND, ["gone"]));
  }

  #[tokio::test]
  async fn delete_keeps_lock_usable() {
    let store = EntityStore::new();
    let cmd = command("a");
    store.store(cmd.clone());
    let guard = store.lock([&cmd.id]).await;
    store.delete(&cmd.id);
    store.unlock(guard);
    assert!(!store.contains(&cmd.id));
    let again = store.lock([&cmd.id]).await;
    assert_eq!(again.ids().count(), 1);
  }

  #[tokio::test]
  async fn try_lock_fails_while_held() {
    let store = EntityStore::new();
    let id = Id::new("Job", ["busy"]);
    let guard = store.lock([&id]).await;
    assert!(store.try_lock(&id).is_none());
    drop(guard);
    assert!(store.try_lock(&id).is_some());
  }

  #[tokio::test]
  async fn duplicate_ids_lock_once() {
    let store = EntityStore::new();
    let id = command("a").id;
    let guard = store.lock([&id, &id, &id]).await;
    assert_eq!(guard.ids().count(), 1);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn overlapping_sets_do_not_deadlock() {
    let store = Arc::new(EntityStore::new());
    let a = command("a").id;
    let b = command("b").id;
    let c = command("c").id;
    let mut handles = Vec::new();
    for i in 0..50 {
      let store = Arc::clone(&store);
      let ids = match i % 3 {
        0 => vec![a.clone(), b.clone()],
        1 => vec![b.clone(), a.clone(), c.clone()],
        _ => vec![c.clone(), a.clone()],
      };
      handles.push(tokio::spawn(async move {
        let _guard = store.lock(&ids).await;
        tokio::task::yield_now().await;
      }));
    }
    let all = async {
      for h in handles {
        h.await.unwrap();
      }
    };
    tokio::time::timeout(Duration::from_secs(5), all)
      .await
      .expect("lock ordering deadlocked");
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn lock_serializes_read_modify_write() {
    let store = Arc::new(EntityStore::new());
    let job = Job::new("count", Id::new("Workspace", ["w"]), Priority::Normal, JobStatus::Queued);
    let id = job.id.clone();
    store.store(job);
    let concurrent = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..20 {
      let store = Arc::clone(&store);
      let id = id.clone();
      let concurrent = Arc::clone(&concurrent);
      handles.push(tokio::spawn(async move {
        let _guard = store.lock([&id]).await;
        assert_eq!(concurrent.fetch_add(1, Ordering::SeqCst), 0);
        let mut job: Job = store.load(&id).unwrap();
        tokio::task::yield_now().await;
        job.name.push('x');
        store.store(job);
        concurrent.fetch_sub(1, Ordering::SeqCst);
      }));
    }
    for h in handles {
      h.await.unwrap();
    }
    let job: Job = store.load(&id).unwrap();
    assert_eq!(job.name, format!("count{}", "x".repeat(20)));
  }
}
