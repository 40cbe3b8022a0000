// Single-wakeup synchronization: a Trigger parks a worker thread until
// somebody fires it, a TriggerList fans one event out to a set of weakly
// referenced triggers.

use std::sync::{Condvar, Mutex, Weak};

use crate::rtsync::PriorityInheritanceMutex;

/// Anything that can be woken by a trigger source.
pub trait Triggerable: Send + Sync {
  fn trigger(&self);
}

/// A `(mutex, condvar, flag)` unit. `wait` blocks until the flag is set and
/// clears it; `trigger` sets the flag and wakes all waiters. Multiple
/// trigger calls between two waits collapse into one wake-up.
pub struct Trigger {
  active: Mutex<bool>,
  cv: Condvar,
}

impl Trigger {
  pub fn new() -> Self {
    Trigger {
      active: Mutex::new(false),
      cv: Condvar::new(),
    }
  }

  pub fn wait(&self) {
    let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
    while !*active {
      active = self
        .cv
        .wait(active)
        .unwrap_or_else(|e| e.into_inner());
    }
    *active = false;
  }
}

impl Default for Trigger {
  fn default() -> Self {
    Self::new()
  }
}

impl Triggerable for Trigger {
  fn trigger(&self) {
    let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
    *active = true;
    self.cv.notify_all();
  }
}

/// Set of weakly referenced subscribers notified when an event source (a
/// value queue, an event flag) observes something. Expired entries are
/// purged on the notification pass that discovers them.
pub struct TriggerList {
  subscribers: PriorityInheritanceMutex<Vec<Weak<dyn Triggerable>>>,
}

impl TriggerList {
  pub fn new() -> Self {
    TriggerList {
      subscribers: PriorityInheritanceMutex::new(Vec::new()),
    }
  }

  /// Idempotent: a trigger already on the list is not added again.
  pub fn add_trigger(&self, triggerable: &std::sync::Arc<dyn Triggerable>) {
    let mut subscribers = self.subscribers.lock();
    if !subscribers.iter().any(|w| same_subscriber(w, triggerable)) {
      subscribers.push(std::sync::Arc::downgrade(triggerable));
    }
  }

  pub fn remove_trigger(&self, triggerable: &std::sync::Arc<dyn Triggerable>) {
    self
      .subscribers
      .lock()
      .retain(|w| !same_subscriber(w, triggerable));
  }

  pub fn notify(&self) {
    let mut found_expired = false;
    let snapshot: Vec<Weak<dyn Triggerable>> = self.subscribers.lock().clone();
    for weak in &snapshot {
      match weak.upgrade() {
        Some(t) => t.trigger(),
        None => found_expired = true,
      }
    }
    if found_expired {
      self.subscribers.lock().retain(|w| w.upgrade().is_some());
    }
  }
}

impl Default for TriggerList {
  fn default() -> Self {
    Self::new()
  }
}

fn same_subscriber(weak: &Weak<dyn Triggerable>, target: &std::sync::Arc<dyn Triggerable>) -> bool {
  weak.upgrade().is_some_and(|a| {
    std::sync::Arc::as_ptr(&a) as *const () == std::sync::Arc::as_ptr(target) as *const ()
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
    thread,
    time::Duration,
  };

  struct CountingTarget(AtomicUsize);

  impl Triggerable for CountingTarget {
    fn trigger(&self) {
      self.0.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[test]
  fn trigger_wakes_waiting_thread() {
    let trigger = Arc::new(Trigger::new());
    let t2 = Arc::clone(&trigger);
    let waiter = thread::spawn(move || t2.wait());
    thread::sleep(Duration::from_millis(20));
    trigger.trigger();
    waiter.join().unwrap();
  }

  #[test]
  fn triggers_before_wait_collapse_into_one() {
    let trigger = Trigger::new();
    trigger.trigger();
    trigger.trigger();
    trigger.wait();
    // flag was cleared by wait, a second wait would block again
    assert!(!*trigger.active.lock().unwrap());
  }

  #[test]
  fn list_notifies_all_live_subscribers_once() {
    let list = TriggerList::new();
    let a = Arc::new(CountingTarget(AtomicUsize::new(0)));
    let b = Arc::new(CountingTarget(AtomicUsize::new(0)));
    let a_dyn: Arc<dyn Triggerable> = Arc::clone(&a) as Arc<dyn Triggerable>;
    let b_dyn: Arc<dyn Triggerable> = Arc::clone(&b) as Arc<dyn Triggerable>;
    list.add_trigger(&a_dyn);
    list.add_trigger(&a_dyn); // duplicate, ignored
    list.add_trigger(&b_dyn);
    list.notify();

    assert_eq!(a.0.load(Ordering::SeqCst), 1);
    assert_eq!(b.0.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn expired_subscribers_are_purged() {
    let list = TriggerList::new();
    {
      let ephemeral: Arc<dyn Triggerable> = Arc::new(CountingTarget(AtomicUsize::new(0)));
      list.add_trigger(&ephemeral);
    }
    list.notify(); // discovers the expired entry
    assert!(list.subscribers.lock().is_empty());
  }

  #[test]
  fn removed_subscriber_is_not_notified() {
    let list = TriggerList::new();
    let a = Arc::new(CountingTarget(AtomicUsize::new(0)));
    let a_dyn: Arc<dyn Triggerable> = Arc::clone(&a) as Arc<dyn Triggerable>;
    list.add_trigger(&a_dyn);
    list.remove_trigger(&a_dyn);
    list.notify();
    assert_eq!(a.0.load(Ordering::SeqCst), 0);
  }
}
