use std::collections::HashSet;

use super::{ServiceError, ServiceResult};
use crate::domain::Service;
use crate::store::{EntityStore, Id};

/// Dependencies-first start order for `root`, ending with `root` itself.
///
/// Depth-first over `dependency_ids`; a service seen again while still on
/// the current path is a cycle. Only reads the store: the graph is static
/// once installed.
pub(super) fn dependency_order(store: &EntityStore, root: &Id) -> ServiceResult<Vec<Id>> {
  let mut walk = Walk {
    store,
    visiting: Vec::new(),
    visited: HashSet::new(),
    order: Vec::new(),
  };
  walk.visit(root)?;
  Ok(walk.order)
}

struct Walk<'a> {
  store: &'a EntityStore,
  /// Current path, root first.
  visiting: Vec<Id>,
  visited: HashSet<Id>,
  order: Vec<Id>,
}

impl Walk<'_> {
  fn visit(&mut self, id: &Id) -> ServiceResult<()> {
    if self.visited.contains(id) {
      return Ok(());
    }
    if let Some(pos) = self.visiting.iter().position(|v| v == id) {
      let mut cycle = self.visiting[pos..].to_vec();
      cycle.push(id.clone());
      return Err(ServiceError::CyclicDependency(cycle));
    }
    let service: Service = self.store.load(id)?;
    self.visiting.push(id.clone());
    for dep in &service.dependency_ids {
      self.visit(dep)?;
    }
    self.visiting.pop();
    self.visited.insert(id.clone());
    self.order.push(id.clone());
    Ok(())
  }
}
