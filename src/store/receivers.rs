// Receiver variants registerable with the value store: a bounded value
// queue with optional blocking back-pressure, a payload-free event queue,
// and a single-slot event flag. Each doubles as a trigger source.

use std::{collections::VecDeque, time::Duration, time::Instant};

use crate::{
  rtsync::{PiCondvar, PriorityInheritanceMutex},
  store::trigger::TriggerList,
  value::ValueHandle,
};

/// The capability set the value store needs from anything that observes
/// publications. `receive` must not panic; a panicking receiver is dropped
/// from the topic.
pub trait ValueReceiver: Send + Sync {
  fn receive(&self, topic: &str, value: &ValueHandle);

  fn is_blocked(&self, _topic: &str) -> bool {
    false
  }

  /// Wait until this receiver can accept a write on `topic` again.
  ///
  /// Polls at ~10 ms so a changed abort predicate is observed within one
  /// polling interval even though nothing signals the condition variable.
  fn wait_blocked(&self, _topic: &str, _check_abort: &dyn Fn() -> bool) {}
}

const UNBLOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct QueueInner {
  queue: VecDeque<(ValueHandle, String)>,
  max_len: usize,
  blocking: bool,
}

impl QueueInner {
  fn is_blocked(&self) -> bool {
    self.blocking && self.max_len > 0 && self.queue.len() >= self.max_len
  }
}

/// FIFO of published values together with their originating topics.
///
/// `max_len == 0` means unbounded. A bounded, non-blocking queue drops its
/// oldest element on overflow; a bounded, blocking queue reports itself
/// blocked instead, which stalls blocking publishers until a consumer pops.
pub struct ValueQueue {
  inner: PriorityInheritanceMutex<QueueInner>,
  unblock_cv: PiCondvar,
  triggers: TriggerList,
}

impl ValueQueue {
  pub fn new(max_len: usize, blocking: bool) -> Self {
    ValueQueue {
      inner: PriorityInheritanceMutex::new(QueueInner {
        queue: VecDeque::new(),
        max_len,
        blocking,
      }),
      unblock_cv: PiCondvar::new(),
      triggers: TriggerList::new(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.inner.lock().queue.is_empty()
  }

  pub fn len(&self) -> usize {
    self.inner.lock().queue.len()
  }

  pub fn blocking(&self) -> bool {
    self.inner.lock().blocking
  }

  pub fn set_blocking(&self, blocking: bool) {
    self.inner.lock().blocking = blocking;
    self.unblock_cv.notify_all();
  }

  pub fn max_length(&self) -> usize {
    self.inner.lock().max_len
  }

  /// Shrinking below the current size drops the oldest entries.
  pub fn set_max_length(&self, max_len: usize) {
    {
      let mut inner = self.inner.lock();
      inner.max_len = max_len;
      while inner.max_len > 0 && inner.queue.len() > inner.max_len {
        inner.queue.pop_front();
      }
    }
    self.unblock_cv.notify_all();
  }

  pub fn peek(&self) -> Option<ValueHandle> {
    self.inner.lock().queue.front().map(|(v, _)| v.clone())
  }

  pub fn pop(&self) -> Option<ValueHandle> {
    self.pop_with_topic().map(|(v, _)| v)
  }

  pub fn pop_with_topic(&self) -> Option<(ValueHandle, String)> {
    let popped = self.inner.lock().queue.pop_front();
    if popped.is_some() {
      self.unblock_cv.notify_all();
    }
    popped
  }

  pub fn triggers(&self) -> &TriggerList {
    &self.triggers
  }
}

impl ValueReceiver for ValueQueue {
  fn receive(&self, topic: &str, value: &ValueHandle) {
    {
      let mut inner = self.inner.lock();
      if inner.max_len > 0 && inner.queue.len() >= inner.max_len {
        inner.queue.pop_front();
      }
      inner.queue.push_back((value.clone(), topic.to_string()));
    }
    self.triggers.notify();
  }

  fn is_blocked(&self, _topic: &str) -> bool {
    self.inner.lock().is_blocked()
  }

  fn wait_blocked(&self, _topic: &str, check_abort: &dyn Fn() -> bool) {
    let mut inner = self.inner.lock();
    while inner.is_blocked() && !check_abort() {
      inner = self.unblock_cv.wait_timeout(inner, UNBLOCK_POLL_INTERVAL);
    }
  }
}

/// Records only that something was published, and where. A bounded event
/// queue drops its oldest topic on overflow.
pub struct EventQueue {
  inner: PriorityInheritanceMutex<(VecDeque<String>, usize)>,
  triggers: TriggerList,
}

impl EventQueue {
  pub fn new(max_len: usize) -> Self {
    EventQueue {
      inner: PriorityInheritanceMutex::new((VecDeque::new(), max_len)),
      triggers: TriggerList::new(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.inner.lock().0.is_empty()
  }

  pub fn pop(&self) -> Option<String> {
    self.inner.lock().0.pop_front()
  }

  pub fn triggers(&self) -> &TriggerList {
    &self.triggers
  }
}

impl ValueReceiver for EventQueue {
  fn receive(&self, topic: &str, _value: &ValueHandle) {
    {
      let mut inner = self.inner.lock();
      let max_len = inner.1;
      if max_len > 0 && inner.0.len() >= max_len {
        inner.0.pop_front();
      }
      inner.0.push_back(topic.to_string());
    }
    self.triggers.notify();
  }
}

struct FlagState {
  active: bool,
  topic: String,
  time: Option<Instant>,
}

/// Latest-only receiver: a single activation slot plus the topic and time
/// of the most recent activation. Events arriving between two resets
/// collapse into one.
pub struct EventFlag {
  state: PriorityInheritanceMutex<FlagState>,
  triggers: TriggerList,
}

impl EventFlag {
  pub fn new() -> Self {
    EventFlag {
      state: PriorityInheritanceMutex::new(FlagState {
        active: false,
        topic: String::new(),
        time: None,
      }),
      triggers: TriggerList::new(),
    }
  }

  pub fn active(&self) -> bool {
    self.state.lock().active
  }

  pub fn reset(&self) {
    self.state.lock().active = false;
  }

  /// Topic of the current (if active) or previous activation.
  pub fn topic(&self) -> String {
    self.state.lock().topic.clone()
  }

  pub fn last_trigger(&self) -> (Option<Instant>, String) {
    let state = self.state.lock();
    (state.time, state.topic.clone())
  }

  pub fn triggers(&self) -> &TriggerList {
    &self.triggers
  }
}

impl Default for EventFlag {
  fn default() -> Self {
    Self::new()
  }
}

impl ValueReceiver for EventFlag {
  fn receive(&self, topic: &str, _value: &ValueHandle) {
    {
      let mut state = self.state.lock();
      state.active = true;
      state.topic = topic.to_string();
      // activation time is kept for statistics
      state.time = Some(Instant::now());
    }
    self.triggers.notify();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{sync::Arc, thread, time::Duration};

  fn handle(val: i32) -> ValueHandle {
    ValueHandle::new(val, 0)
  }

  #[test_case::test_case(0, false ; "unbounded")]
  #[test_case::test_case(4, false ; "bounded")]
  #[test_case::test_case(4, true ; "bounded blocking")]
  fn queue_preserves_fifo_order(max_len: usize, blocking: bool) {
    let queue = ValueQueue::new(max_len, blocking);
    queue.receive("/t", &handle(1));
    queue.receive("/t", &handle(2));
    queue.receive("/t", &handle(3));
    assert_eq!(*queue.pop().unwrap().downcast::<i32>().unwrap(), 1);
    assert_eq!(*queue.pop().unwrap().downcast::<i32>().unwrap(), 2);
    assert_eq!(*queue.pop().unwrap().downcast::<i32>().unwrap(), 3);
    assert!(queue.is_empty());
  }

  #[test]
  fn bounded_queue_drops_oldest_on_overflow() {
    let queue = ValueQueue::new(2, false);
    for i in 1..=4 {
      queue.receive("/t", &handle(i));
    }
    assert_eq!(*queue.pop().unwrap().downcast::<i32>().unwrap(), 3);
    assert_eq!(*queue.pop().unwrap().downcast::<i32>().unwrap(), 4);
    assert!(queue.is_empty());
  }

  #[test]
  fn shrinking_max_length_drops_oldest() {
    let queue = ValueQueue::new(3, false);
    for i in 1..=3 {
      queue.receive("/t", &handle(i));
    }
    queue.set_max_length(2);
    assert_eq!(queue.len(), 2);
    assert_eq!(*queue.pop().unwrap().downcast::<i32>().unwrap(), 2);
  }

  #[test]
  fn pop_with_topic_reports_origin() {
    let queue = ValueQueue::new(0, false);
    queue.receive("/a", &handle(1));
    queue.receive("/b", &handle(2));
    let (_, topic) = queue.pop_with_topic().unwrap();
    assert_eq!(topic, "/a");
    let (_, topic) = queue.pop_with_topic().unwrap();
    assert_eq!(topic, "/b");
  }

  #[test]
  fn full_blocking_queue_reports_blocked() {
    let queue = ValueQueue::new(1, true);
    assert!(!queue.is_blocked("/t"));
    queue.receive("/t", &handle(1));
    assert!(queue.is_blocked("/t"));
    queue.pop();
    assert!(!queue.is_blocked("/t"));
  }

  #[test]
  fn wait_blocked_returns_once_drained() {
    let queue = Arc::new(ValueQueue::new(1, true));
    queue.receive("/t", &handle(1));
    let q2 = Arc::clone(&queue);
    let popper = thread::spawn(move || {
      thread::sleep(Duration::from_millis(50));
      q2.pop();
    });
    let start = std::time::Instant::now();
    queue.wait_blocked("/t", &|| false);
    assert!(start.elapsed() >= Duration::from_millis(40));
    popper.join().unwrap();
  }

  #[test]
  fn wait_blocked_honors_abort_predicate() {
    let queue = ValueQueue::new(1, true);
    queue.receive("/t", &handle(1));
    let start = std::time::Instant::now();
    queue.wait_blocked("/t", &|| true);
    assert!(start.elapsed() < Duration::from_millis(100));
  }

  #[test]
  fn event_queue_stores_topics_only() {
    let queue = EventQueue::new(0);
    queue.receive("/t1", &handle(1));
    queue.receive("/t2", &handle(2));
    assert_eq!(queue.pop().as_deref(), Some("/t1"));
    assert_eq!(queue.pop().as_deref(), Some("/t2"));
    assert_eq!(queue.pop(), None);
  }

  #[test]
  fn flag_collapses_events_and_keeps_last_topic() {
    let flag = EventFlag::new();
    assert!(!flag.active());
    flag.receive("/t1", &handle(1));
    flag.receive("/t2", &handle(2));
    assert!(flag.active());
    assert_eq!(flag.topic(), "/t2");
    flag.reset();
    assert!(!flag.active());
    // topic of the previous activation stays queryable
    assert_eq!(flag.topic(), "/t2");
  }
}
