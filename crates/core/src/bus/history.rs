use std::sync::Arc;

use super::Message;

/// Bounded message history.
///
/// The backing vector holds up to twice the capacity. When it fills, the
/// older half is dropped in one move and appending continues from the
/// midpoint, so compaction runs once per `capacity` inserts instead of on
/// every insert. Readers only see the newest `capacity` messages.
pub(crate) struct History {
  buf: Vec<Arc<Message>>,
  capacity: usize,
}

impl History {
  pub(crate) fn new(capacity: usize) -> Self {
    Self {
      buf: Vec::with_capacity(capacity.saturating_mul(2)),
      capacity,
    }
  }

  pub(crate) fn push(&mut self, msg: Arc<Message>) {
    if self.capacity == 0 {
      return;
    }
    if self.buf.len() == self.capacity * 2 {
      self.buf.drain(..self.capacity);
    }
    self.buf.push(msg);
  }

  /// Newest `capacity` messages, oldest first.
  pub(crate) fn window(&self) -> &[Arc<Message>] {
    let start = self.buf.len().saturating_sub(self.capacity);
    &self.buf[start..]
  }

  /// Retained messages of `kind` with a sequence strictly above `since`.
  pub(crate) fn since<'a>(&'a self, kind: &'a str, since: u64) -> impl Iterator<Item = &'a Arc<Message>> + 'a {
    let window = self.window();
    // Sequences are strictly increasing, so skip straight past the checkpoint.
    let start = window.partition_point(|m| m.seq <= since);
    window[start..].iter().filter(move |m| m.kind == kind)
  }

  #[cfg(test)]
  pub(crate) fn stored(&self) -> usize {
    self.buf.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bus::Event;
  use proptest::prelude::*;

  fn msg(seq: u64, kind: &str) -> Arc<Message> {
    Arc::new(Message {
      seq,
      kind: kind.to_string(),
      event: Event::Custom {
        kind: kind.to_string(),
        payload: serde_json::Value::from(seq),
      },
    })
  }

  #[test]
  fn compacts_once_full() {
    let mut h = History::new(4);
    for seq in 1..=8 {
      h.push(msg(seq, "t"));
    }
    assert_eq!(h.stored(), 8);
    h.push(msg(9, "t"));
    assert_eq!(h.stored(), 5);
    let seqs: Vec<u64> = h.window().iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![6, 7, 8, 9]);
  }

  #[test]
  fn since_filters_kind_and_sequence() {
    let mut h = History::new(10);
    for seq in 1..=6 {
      h.push(msg(seq, if seq % 2 == 0 { "even" } else { "odd" }));
    }
    let seqs: Vec<u64> = h.since("even", 2).map(|m| m.seq).collect();
    assert_eq!(seqs, vec![4, 6]);
    assert_eq!(h.since("odd", 6).count(), 0);
  }

  #[test]
  fn zero_capacity_keeps_nothing() {
    let mut h = History::new(0);
    h.push(msg(1, "t"));
    assert!(h.window().is_empty());
  }

  proptest! {
    #[test]
    fn window_is_newest_capacity(capacity in 1usize..32, total in 0u64..200) {
      let mut h = History::new(capacity);
      for seq in 1..=total {
        h.push(msg(seq, "t"));
      }
      let seqs: Vec<u64> = h.window().iter().map(|m| m.seq).collect();
      let first = total.saturating_sub(capacity as u64) + 1;
      let expected: Vec<u64> = (first..=total).collect();
      prop_assert_eq!(seqs, expected);
      prop_assert!(h.stored() <= capacity * 2);
    }
  }
}
