// The value store: a process-wide, type-erased map from topic to its latest
// value and registered receivers. Mediates every publication.

pub mod receivers;
pub mod trigger;

pub use receivers::{EventFlag, EventQueue, ValueQueue, ValueReceiver};
pub use trigger::{Trigger, TriggerList, Triggerable};

use std::{
  collections::HashMap,
  panic::{catch_unwind, AssertUnwindSafe},
  sync::{Arc, Mutex, RwLock, Weak},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::PublishError,
  rtsync::PriorityCeilingMutex,
  value::{messages, TypeEntry, TypeRegistry, ValueHandle, ValueType},
};

/// Ceiling priority for the store's internal locks.
pub const VALUE_STORE_PRIORITY: i32 = 32;

struct EntryState {
  value: Option<ValueHandle>,
  receivers: Vec<Weak<dyn ValueReceiver>>,
}

struct TopicEntry {
  /// Latest value and receiver list. Held only for short, bounded sections.
  state: PriorityCeilingMutex<EntryState>,
  /// Serializes publications on this topic, including fan-out, so receivers
  /// observe every topic's writes in one total order. Never held while a
  /// reader runs and never nested inside `state`.
  publish: Mutex<()>,
}

impl TopicEntry {
  fn new() -> Self {
    TopicEntry {
      state: PriorityCeilingMutex::new(
        VALUE_STORE_PRIORITY,
        EntryState {
          value: None,
          receivers: Vec::new(),
        },
      ),
      publish: Mutex::new(()),
    }
  }

  fn snapshot_receivers(&self) -> Vec<Weak<dyn ValueReceiver>> {
    self.state.lock().receivers.clone()
  }
}

struct StoreInner {
  map: HashMap<String, Arc<TopicEntry>>,
  all_topic_receivers: Vec<Weak<dyn ValueReceiver>>,
}

/// Typed topic registry with multi-receiver notification, bounded queues
/// and blocking back-pressure. See the module documentation of the crate
/// for the write protocol.
pub struct ValueStore {
  inner: PriorityCeilingMutex<StoreInner>,
  registry: RwLock<TypeRegistry>,
}

fn same_receiver(weak: &Weak<dyn ValueReceiver>, target: &Arc<dyn ValueReceiver>) -> bool {
  weak
    .upgrade()
    .is_some_and(|a| Arc::as_ptr(&a) as *const () == Arc::as_ptr(target) as *const ())
}

fn no_abort() -> bool {
  false
}

impl ValueStore {
  pub fn new() -> Self {
    let mut registry = TypeRegistry::new();
    messages::register_builtin_types(&mut registry);
    ValueStore {
      inner: PriorityCeilingMutex::new(
        VALUE_STORE_PRIORITY,
        StoreInner {
          map: HashMap::new(),
          all_topic_receivers: Vec::new(),
        },
      ),
      registry: RwLock::new(registry),
    }
  }

  // --- type registry access ---

  pub fn register_type<T: ValueType>(&self, type_id: &str) {
    self
      .registry
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .register_type::<T>(type_id);
  }

  pub fn register_ext_mem_type<T: ValueType + crate::value::ExtMemory>(&self, type_id: &str) {
    self
      .registry
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .register_ext_mem_type::<T>(type_id);
  }

  /// Serialization entry of a handle's concrete type, if registered.
  pub fn type_info(&self, handle: &ValueHandle) -> Option<TypeEntry> {
    self
      .registry
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .lookup(handle)
      .cloned()
  }

  pub fn type_info_by_name(&self, type_id: &str) -> Option<TypeEntry> {
    self
      .registry
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .lookup_name(type_id)
      .cloned()
  }

  // --- receiver registration ---

  /// Register a receiver for one topic. Idempotent.
  pub fn add_receiver(&self, key: &str, receiver: &Arc<dyn ValueReceiver>) {
    let entry = self.get_or_create_entry(key);
    let mut state = entry.state.lock();
    if !state.receivers.iter().any(|w| same_receiver(w, receiver)) {
      state.receivers.push(Arc::downgrade(receiver));
    }
  }

  /// Remove a receiver from one topic. Idempotent.
  pub fn remove_receiver(&self, key: &str, receiver: &Arc<dyn ValueReceiver>) {
    let entry = self.get_or_create_entry(key);
    entry
      .state
      .lock()
      .receivers
      .retain(|w| !same_receiver(w, receiver) && w.upgrade().is_some());
  }

  /// Register a receiver observing every publication on every topic.
  pub fn add_all_topic_receiver(&self, receiver: &Arc<dyn ValueReceiver>) {
    let mut inner = self.inner.lock();
    if !inner
      .all_topic_receivers
      .iter()
      .any(|w| same_receiver(w, receiver))
    {
      inner.all_topic_receivers.push(Arc::downgrade(receiver));
    }
  }

  pub fn remove_all_topic_receiver(&self, receiver: &Arc<dyn ValueReceiver>) {
    self
      .inner
      .lock()
      .all_topic_receivers
      .retain(|w| !same_receiver(w, receiver) && w.upgrade().is_some());
  }

  // --- write path ---

  /// Publish a value, blocking until no receiver on the topic is blocked.
  /// The value gets id 0; use a sender port for id-stamped publications.
  pub fn set_value<T: Send + Sync + 'static>(
    &self,
    key: &str,
    value: T,
  ) -> Result<(), PublishError> {
    self.set_value_handle(key, ValueHandle::new(value, 0), true, &no_abort)
  }

  /// Non-blocking publish: fails with [`PublishError::Again`] when any
  /// receiver on the topic is blocked.
  pub fn set_value_nonblocking<T: Send + Sync + 'static>(
    &self,
    key: &str,
    value: T,
  ) -> Result<(), PublishError> {
    self.set_value_handle(key, ValueHandle::new(value, 0), false, &no_abort)
  }

  /// Primary write path.
  ///
  /// With `blocking` set, waits while any receiver on the topic reports
  /// itself blocked, polling `check_abort` at the receivers' ~10 ms
  /// interval; an abort yields [`PublishError::Cancelled`] without
  /// publishing. Without `blocking`, a blocked receiver yields
  /// [`PublishError::Again`] immediately.
  pub fn set_value_handle(
    &self,
    key: &str,
    handle: ValueHandle,
    blocking: bool,
    check_abort: &dyn Fn() -> bool,
  ) -> Result<(), PublishError> {
    let entry = self.get_or_create_entry(key);
    loop {
      let publish_guard = entry.publish.lock().unwrap_or_else(|e| e.into_inner());
      let receivers = entry.snapshot_receivers();
      let blocked = receivers
        .iter()
        .filter_map(Weak::upgrade)
        .any(|r| r.is_blocked(key));
      if check_abort() {
        return Err(PublishError::Cancelled);
      }
      if !blocked {
        self.publish(&entry, key, handle, publish_guard);
        return Ok(());
      }
      if !blocking {
        return Err(PublishError::Again);
      }
      drop(publish_guard);
      for receiver in receivers.iter().filter_map(Weak::upgrade) {
        receiver.wait_blocked(key, check_abort);
        if check_abort() {
          return Err(PublishError::Cancelled);
        }
      }
    }
  }

  fn publish(
    &self,
    entry: &Arc<TopicEntry>,
    key: &str,
    handle: ValueHandle,
    publish_guard: std::sync::MutexGuard<'_, ()>,
  ) {
    // Swap in the new value under the short state lock; the previous value
    // is kept alive in `old_value` so its deallocation happens after the
    // critical section.
    let (receivers, old_value) = {
      let mut state = entry.state.lock();
      let old = state.value.replace(handle.clone());
      (state.receivers.clone(), old)
    };

    let all_topic = self.snapshot_all_topic_receivers();
    for receiver in &all_topic {
      if !deliver(receiver, key, &handle) {
        self
          .inner
          .lock()
          .all_topic_receivers
          .retain(|w| !same_receiver(w, receiver));
      }
    }

    let mut expired = false;
    for weak in &receivers {
      match weak.upgrade() {
        Some(receiver) => {
          if !deliver(&receiver, key, &handle) {
            // a panicking receiver is dropped from the topic
            entry
              .state
              .lock()
              .receivers
              .retain(|w| !same_receiver(w, &receiver));
          }
        }
        None => expired = true,
      }
    }
    if expired {
      entry
        .state
        .lock()
        .receivers
        .retain(|w| w.upgrade().is_some());
    }

    drop(publish_guard);
    drop(old_value);
  }

  /// Live all-topic receivers; expired entries are purged in the same pass.
  fn snapshot_all_topic_receivers(&self) -> Vec<Arc<dyn ValueReceiver>> {
    let mut inner = self.inner.lock();
    let live: Vec<_> = inner
      .all_topic_receivers
      .iter()
      .filter_map(Weak::upgrade)
      .collect();
    if live.len() != inner.all_topic_receivers.len() {
      inner.all_topic_receivers.retain(|w| w.upgrade().is_some());
    }
    live
  }

  // --- read path ---

  /// Current value of a topic, downcast to `T`. Returns a default `T` when
  /// the topic is absent or holds another type; check [`has_value`] first
  /// when the distinction matters. Never blocks on publishers.
  ///
  /// [`has_value`]: ValueStore::has_value
  pub fn get_value<T: ValueType>(&self, key: &str) -> Arc<T> {
    self
      .get_value_handle(key)
      .and_then(|h| h.downcast::<T>())
      .unwrap_or_default()
  }

  pub fn get_value_handle(&self, key: &str) -> Option<ValueHandle> {
    let entry = self.entry(key)?;
    let state = entry.state.lock();
    state.value.clone()
  }

  pub fn has_value(&self, key: &str) -> bool {
    self
      .entry(key)
      .is_some_and(|e| e.state.lock().value.is_some())
  }

  pub fn keys(&self) -> Vec<String> {
    self.inner.lock().map.keys().cloned().collect()
  }

  /// Current value of a topic packed with its registered serializer, for
  /// introspection. `None` when the topic is empty or the type unknown.
  pub fn get_serialized(&self, key: &str) -> Option<Vec<u8>> {
    let handle = self.get_value_handle(key)?;
    let entry = self.type_info(&handle)?;
    match (entry.pack)(&handle, false) {
      Ok(packed) => Some(packed.bytes),
      Err(e) => {
        warn!("could not serialize value on {key}: {e}");
        None
      }
    }
  }

  fn entry(&self, key: &str) -> Option<Arc<TopicEntry>> {
    self.inner.lock().map.get(key).cloned()
  }

  fn get_or_create_entry(&self, key: &str) -> Arc<TopicEntry> {
    let mut inner = self.inner.lock();
    Arc::clone(
      inner
        .map
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(TopicEntry::new())),
    )
  }
}

impl Default for ValueStore {
  fn default() -> Self {
    Self::new()
  }
}

/// Call a receiver, shielding the store from panics. Returns false when the
/// receiver panicked.
fn deliver(receiver: &Arc<dyn ValueReceiver>, key: &str, handle: &ValueHandle) -> bool {
  let result = catch_unwind(AssertUnwindSafe(|| receiver.receive(key, handle)));
  if result.is_err() {
    error!("receiver on topic {key} panicked and will be removed");
    return false;
  }
  true
}
