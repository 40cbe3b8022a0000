// Component-owned endpoints bound to topics. The untyped cores carry all
// behavior; the typed ports are thin wrappers that stamp ids on the way in
// and downcast on the way out.

pub mod handler;

pub use handler::PortTriggerHandler;

use std::{
  any::TypeId,
  marker::PhantomData,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
  },
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::PublishError,
  store::{EventFlag, ValueQueue, ValueReceiver, ValueStore},
  value::{IdGenerator, ValueHandle, ValueType},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
  Sender,
  Receiver,
}

/// State shared by every port flavor: name, topic binding, connection flag
/// and the store the port was set up with.
struct PortCore {
  name: String,
  topic: Mutex<String>,
  connected: AtomicBool,
  value_store: Mutex<Option<Arc<ValueStore>>>,
  /// Serializes connect/disconnect/remap so a remap is observed as one
  /// atomic reconnection.
  ops: Mutex<()>,
}

impl PortCore {
  fn new(name: &str) -> Arc<Self> {
    Arc::new(PortCore {
      name: name.to_string(),
      topic: Mutex::new(String::new()),
      connected: AtomicBool::new(false),
      value_store: Mutex::new(None),
      ops: Mutex::new(()),
    })
  }

  fn topic(&self) -> String {
    self.topic.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  fn store(&self) -> Option<Arc<ValueStore>> {
    self
      .value_store
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  fn is_connected(&self) -> bool {
    self.connected.load(Ordering::SeqCst)
  }
}

/// Object-safe port surface used by the component manager for registration,
/// connection control and topic remapping.
pub trait Port: Send + Sync {
  fn name(&self) -> String;
  fn direction(&self) -> PortDirection;
  fn topic(&self) -> String;
  fn is_connected(&self) -> bool;
  /// `TypeId` of the port's payload type, `None` for untyped ports.
  fn value_type(&self) -> Option<TypeId>;
  fn setup(&self, store: &Arc<ValueStore>);
  fn connect(&self);
  fn disconnect(&self);
  /// Atomically disconnect, rebind and (if previously connected) reconnect.
  fn map_to_topic(&self, topic: &str);
  fn clone_port(&self) -> Box<dyn Port>;
}

/// Ports that can carry a [`PortTriggerHandler`].
pub trait HandlerPort: Port {
  /// Swap the handler in, registering its flag under the current topic when
  /// connected. Returns the replaced handler, if any.
  fn attach_handler(&self, handler: Arc<PortTriggerHandler>) -> Option<Arc<PortTriggerHandler>>;
}

// ---------------------------------------------------------------------------
// sender side

/// Untyped write endpoint. Values pass through as pre-stamped handles; the
/// typed [`SenderPort`] stamps fresh ids.
#[derive(Clone)]
pub struct GenericSenderPort {
  core: Arc<PortCore>,
  id_generator: Arc<dyn IdGenerator>,
}

impl GenericSenderPort {
  pub fn new(name: &str, id_generator: Arc<dyn IdGenerator>) -> Self {
    GenericSenderPort {
      core: PortCore::new(name),
      id_generator,
    }
  }

  /// Write a handle to the bound topic.
  ///
  /// A blocking write aborts with [`PublishError::Cancelled`] within one
  /// polling interval once the port is disconnected.
  pub fn set_value_handle(
    &self,
    handle: ValueHandle,
    blocking: bool,
  ) -> Result<(), PublishError> {
    if !self.core.is_connected() {
      debug!("port {} is not connected, dropping write", self.core.name);
      return Err(PublishError::NotConnected);
    }
    let store = self.core.store().ok_or(PublishError::NotConnected)?;
    let topic = self.core.topic();
    if topic.is_empty() {
      return Err(PublishError::NotConnected);
    }
    let core = Arc::clone(&self.core);
    store.set_value_handle(&topic, handle, blocking, &move || !core.is_connected())
  }

  pub fn next_id(&self) -> u64 {
    self.id_generator.generate_id()
  }
}

impl Port for GenericSenderPort {
  fn name(&self) -> String {
    self.core.name.clone()
  }

  fn direction(&self) -> PortDirection {
    PortDirection::Sender
  }

  fn topic(&self) -> String {
    self.core.topic()
  }

  fn is_connected(&self) -> bool {
    self.core.is_connected()
  }

  fn value_type(&self) -> Option<TypeId> {
    None
  }

  fn setup(&self, store: &Arc<ValueStore>) {
    *self
      .core
      .value_store
      .lock()
      .unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(store));
  }

  fn connect(&self) {
    let _ops = self.core.ops.lock().unwrap_or_else(|e| e.into_inner());
    if self.core.store().is_some() && !self.core.topic().is_empty() {
      self.core.connected.store(true, Ordering::SeqCst);
    } else {
      debug!(
        "port {} is not mapped to a topic, connect() has no effect",
        self.core.name
      );
    }
  }

  fn disconnect(&self) {
    // no ops lock: an in-flight blocking write polls the flag and must be
    // able to observe the disconnect while the write is in progress
    self.core.connected.store(false, Ordering::SeqCst);
  }

  fn map_to_topic(&self, topic: &str) {
    let _ops = self.core.ops.lock().unwrap_or_else(|e| e.into_inner());
    let was_connected = self.core.is_connected();
    self.core.connected.store(false, Ordering::SeqCst);
    *self.core.topic.lock().unwrap_or_else(|e| e.into_inner()) = topic.to_string();
    if was_connected && self.core.store().is_some() && !topic.is_empty() {
      self.core.connected.store(true, Ordering::SeqCst);
    }
  }

  fn clone_port(&self) -> Box<dyn Port> {
    Box::new(self.clone())
  }
}

/// Typed write endpoint owned by one component.
pub struct SenderPort<T> {
  generic: GenericSenderPort,
  _ph: PhantomData<fn(T)>,
}

impl<T> Clone for SenderPort<T> {
  fn clone(&self) -> Self {
    SenderPort {
      generic: self.generic.clone(),
      _ph: PhantomData,
    }
  }
}

impl<T: Send + Sync + 'static> SenderPort<T> {
  pub fn new(name: &str, id_generator: Arc<dyn IdGenerator>) -> Self {
    SenderPort {
      generic: GenericSenderPort::new(name, id_generator),
      _ph: PhantomData,
    }
  }

  /// Publish an owned value under a fresh id. Taking the value by move is
  /// what keeps mutable aliases of published payloads impossible.
  pub fn set_value(&self, value: T, blocking: bool) -> Result<(), PublishError> {
    let id = self.generic.next_id();
    self.generic.set_value_handle(ValueHandle::new(value, id), blocking)
  }

  /// Publish an already shared, immutable payload under a fresh id.
  pub fn set_value_arc(&self, value: Arc<T>, blocking: bool) -> Result<(), PublishError> {
    let id = self.generic.next_id();
    self
      .generic
      .set_value_handle(ValueHandle::from_arc(value, id), blocking)
  }

  /// Publish a handle as-is, keeping its existing id.
  pub fn set_value_handle(&self, handle: ValueHandle, blocking: bool) -> Result<(), PublishError> {
    self.generic.set_value_handle(handle, blocking)
  }
}

impl<T: Send + Sync + 'static> Port for SenderPort<T> {
  fn name(&self) -> String {
    self.generic.name()
  }
  fn direction(&self) -> PortDirection {
    PortDirection::Sender
  }
  fn topic(&self) -> String {
    self.generic.topic()
  }
  fn is_connected(&self) -> bool {
    self.generic.is_connected()
  }
  fn value_type(&self) -> Option<TypeId> {
    Some(TypeId::of::<T>())
  }
  fn setup(&self, store: &Arc<ValueStore>) {
    self.generic.setup(store);
  }
  fn connect(&self) {
    self.generic.connect();
  }
  fn disconnect(&self) {
    self.generic.disconnect();
  }
  fn map_to_topic(&self, topic: &str) {
    self.generic.map_to_topic(topic);
  }
  fn clone_port(&self) -> Box<dyn Port> {
    Box::new(self.clone())
  }
}

// ---------------------------------------------------------------------------
// receiver side, latest-only

struct ReceiverPortInner {
  core: Arc<PortCore>,
  event_flag: Arc<EventFlag>,
  flag_receiver: Arc<dyn ValueReceiver>,
  handler: Mutex<Option<Arc<PortTriggerHandler>>>,
}

impl ReceiverPortInner {
  // The port's own flag is registered before the handler's flag, so the
  // event is already recorded when the handler runs. Disconnection removes
  // them in reverse order.
  fn connect_registrations(&self, store: &Arc<ValueStore>, topic: &str) {
    store.add_receiver(topic, &self.flag_receiver);
    if let Some(handler) = self.handler.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
      store.add_receiver(topic, handler.flag_receiver());
    }
  }

  fn disconnect_registrations(&self, store: &Arc<ValueStore>, topic: &str) {
    if let Some(handler) = self.handler.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
      store.remove_receiver(topic, handler.flag_receiver());
    }
    store.remove_receiver(topic, &self.flag_receiver);
  }
}

/// Typed latest-only read endpoint: an event flag plus access to the
/// topic's current value.
pub struct ReceiverPort<T> {
  inner: Arc<ReceiverPortInner>,
  _ph: PhantomData<fn() -> T>,
}

impl<T> Clone for ReceiverPort<T> {
  fn clone(&self) -> Self {
    ReceiverPort {
      inner: Arc::clone(&self.inner),
      _ph: PhantomData,
    }
  }
}

impl<T: ValueType> ReceiverPort<T> {
  pub fn new(name: &str) -> Self {
    let event_flag = Arc::new(EventFlag::new());
    let flag_receiver = Arc::clone(&event_flag) as Arc<dyn ValueReceiver>;
    ReceiverPort {
      inner: Arc::new(ReceiverPortInner {
        core: PortCore::new(name),
        event_flag,
        flag_receiver,
        handler: Mutex::new(None),
      }),
      _ph: PhantomData,
    }
  }

  /// True when a value arrived since the last flag reset.
  pub fn has_value(&self) -> bool {
    self.inner.core.is_connected() && self.inner.event_flag.active()
  }

  /// The topic's current value, a default `T` when unbound or mismatched.
  pub fn get_value(&self) -> Arc<T> {
    if !self.inner.core.is_connected() {
      return Arc::new(T::default());
    }
    match self.inner.core.store() {
      Some(store) => store.get_value::<T>(&self.inner.core.topic()),
      None => Arc::new(T::default()),
    }
  }

  pub fn event_flag(&self) -> &Arc<EventFlag> {
    &self.inner.event_flag
  }
}

impl<T: ValueType> Port for ReceiverPort<T> {
  fn name(&self) -> String {
    self.inner.core.name.clone()
  }
  fn direction(&self) -> PortDirection {
    PortDirection::Receiver
  }
  fn topic(&self) -> String {
    self.inner.core.topic()
  }
  fn is_connected(&self) -> bool {
    self.inner.core.is_connected()
  }
  fn value_type(&self) -> Option<TypeId> {
    Some(TypeId::of::<T>())
  }
  fn setup(&self, store: &Arc<ValueStore>) {
    *self
      .inner
      .core
      .value_store
      .lock()
      .unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(store));
  }
  fn connect(&self) {
    let _ops = self.inner.core.ops.lock().unwrap_or_else(|e| e.into_inner());
    let topic = self.inner.core.topic();
    if let (Some(store), false) = (self.inner.core.store(), topic.is_empty()) {
      self.inner.connect_registrations(&store, &topic);
      self.inner.core.connected.store(true, Ordering::SeqCst);
    } else {
      debug!(
        "port {} is not mapped to a topic, connect() has no effect",
        self.inner.core.name
      );
    }
  }
  fn disconnect(&self) {
    let _ops = self.inner.core.ops.lock().unwrap_or_else(|e| e.into_inner());
    self.inner.core.connected.store(false, Ordering::SeqCst);
    let topic = self.inner.core.topic();
    if let Some(store) = self.inner.core.store() {
      self.inner.disconnect_registrations(&store, &topic);
    }
  }
  fn map_to_topic(&self, topic: &str) {
    let _ops = self.inner.core.ops.lock().unwrap_or_else(|e| e.into_inner());
    let was_connected = self.inner.core.is_connected();
    let old_topic = self.inner.core.topic();
    if was_connected {
      self.inner.core.connected.store(false, Ordering::SeqCst);
      if let Some(store) = self.inner.core.store() {
        self.inner.disconnect_registrations(&store, &old_topic);
      }
    }
    *self
      .inner
      .core
      .topic
      .lock()
      .unwrap_or_else(|e| e.into_inner()) = topic.to_string();
    if was_connected && !topic.is_empty() {
      if let Some(store) = self.inner.core.store() {
        self.inner.connect_registrations(&store, topic);
        self.inner.core.connected.store(true, Ordering::SeqCst);
      }
    }
  }
  fn clone_port(&self) -> Box<dyn Port> {
    Box::new(self.clone())
  }
}

impl<T: ValueType> HandlerPort for ReceiverPort<T> {
  fn attach_handler(&self, handler: Arc<PortTriggerHandler>) -> Option<Arc<PortTriggerHandler>> {
    let _ops = self.inner.core.ops.lock().unwrap_or_else(|e| e.into_inner());
    let mut slot = self
      .inner
      .handler
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    let old = slot.take();
    if self.inner.core.is_connected() {
      let topic = self.inner.core.topic();
      if let Some(store) = self.inner.core.store() {
        if let Some(old) = old.as_ref() {
          store.remove_receiver(&topic, old.flag_receiver());
        }
        store.add_receiver(&topic, handler.flag_receiver());
      }
    }
    *slot = Some(handler);
    old
  }
}

// ---------------------------------------------------------------------------
// receiver side, queued

struct QueuedPortInner {
  core: Arc<PortCore>,
  queue: Arc<ValueQueue>,
  queue_receiver: Arc<dyn ValueReceiver>,
  handler: Mutex<Option<Arc<PortTriggerHandler>>>,
}

impl QueuedPortInner {
  fn connect_registrations(&self, store: &Arc<ValueStore>, topic: &str) {
    store.add_receiver(topic, &self.queue_receiver);
    if let Some(handler) = self.handler.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
      store.add_receiver(topic, handler.flag_receiver());
    }
  }

  fn disconnect_registrations(&self, store: &Arc<ValueStore>, topic: &str) {
    if let Some(handler) = self.handler.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
      store.remove_receiver(topic, handler.flag_receiver());
    }
    store.remove_receiver(topic, &self.queue_receiver);
  }
}

/// Untyped queued read endpoint.
///
/// Disconnecting keeps already queued elements poppable but delivers no
/// further events for them; drain the queue first when that matters.
#[derive(Clone)]
pub struct GenericQueuedReceiverPort {
  inner: Arc<QueuedPortInner>,
}

impl GenericQueuedReceiverPort {
  pub fn new(name: &str, queue_size: usize, blocking: bool) -> Self {
    let queue = Arc::new(ValueQueue::new(queue_size, blocking));
    let queue_receiver = Arc::clone(&queue) as Arc<dyn ValueReceiver>;
    GenericQueuedReceiverPort {
      inner: Arc::new(QueuedPortInner {
        core: PortCore::new(name),
        queue,
        queue_receiver,
        handler: Mutex::new(None),
      }),
    }
  }

  pub fn has_value(&self) -> bool {
    self.inner.core.is_connected() && !self.inner.queue.is_empty()
  }

  pub fn queue_size(&self) -> usize {
    self.inner.queue.len()
  }

  pub fn peek_handle(&self) -> Option<ValueHandle> {
    self.inner.queue.peek()
  }

  pub fn pop_handle(&self) -> Option<ValueHandle> {
    self.inner.queue.pop()
  }

  pub fn blocking(&self) -> bool {
    self.inner.queue.blocking()
  }

  pub fn set_blocking(&self, blocking: bool) {
    self.inner.queue.set_blocking(blocking);
  }

  pub fn max_queue_length(&self) -> usize {
    self.inner.queue.max_length()
  }

  pub fn set_max_queue_length(&self, max_len: usize) {
    self.inner.queue.set_max_length(max_len);
  }

  pub fn queue(&self) -> &Arc<ValueQueue> {
    &self.inner.queue
  }
}

impl Port for GenericQueuedReceiverPort {
  fn name(&self) -> String {
    self.inner.core.name.clone()
  }
  fn direction(&self) -> PortDirection {
    PortDirection::Receiver
  }
  fn topic(&self) -> String {
    self.inner.core.topic()
  }
  fn is_connected(&self) -> bool {
    self.inner.core.is_connected()
  }
  fn value_type(&self) -> Option<TypeId> {
    None
  }
  fn setup(&self, store: &Arc<ValueStore>) {
    *self
      .inner
      .core
      .value_store
      .lock()
      .unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(store));
  }
  fn connect(&self) {
    let _ops = self.inner.core.ops.lock().unwrap_or_else(|e| e.into_inner());
    let topic = self.inner.core.topic();
    if let (Some(store), false) = (self.inner.core.store(), topic.is_empty()) {
      self.inner.connect_registrations(&store, &topic);
      self.inner.core.connected.store(true, Ordering::SeqCst);
    } else {
      debug!(
        "port {} is not mapped to a topic, connect() has no effect",
        self.inner.core.name
      );
    }
  }
  fn disconnect(&self) {
    let _ops = self.inner.core.ops.lock().unwrap_or_else(|e| e.into_inner());
    self.inner.core.connected.store(false, Ordering::SeqCst);
    let topic = self.inner.core.topic();
    if let Some(store) = self.inner.core.store() {
      self.inner.disconnect_registrations(&store, &topic);
    }
  }
  fn map_to_topic(&self, topic: &str) {
    let _ops = self.inner.core.ops.lock().unwrap_or_else(|e| e.into_inner());
    let was_connected = self.inner.core.is_connected();
    let old_topic = self.inner.core.topic();
    if was_connected {
      self.inner.core.connected.store(false, Ordering::SeqCst);
      if let Some(store) = self.inner.core.store() {
        self.inner.disconnect_registrations(&store, &old_topic);
      }
    }
    *self
      .inner
      .core
      .topic
      .lock()
      .unwrap_or_else(|e| e.into_inner()) = topic.to_string();
    if was_connected && !topic.is_empty() {
      if let Some(store) = self.inner.core.store() {
        self.inner.connect_registrations(&store, topic);
        self.inner.core.connected.store(true, Ordering::SeqCst);
      }
    }
  }
  fn clone_port(&self) -> Box<dyn Port> {
    Box::new(self.clone())
  }
}

impl HandlerPort for GenericQueuedReceiverPort {
  fn attach_handler(&self, handler: Arc<PortTriggerHandler>) -> Option<Arc<PortTriggerHandler>> {
    let _ops = self.inner.core.ops.lock().unwrap_or_else(|e| e.into_inner());
    let mut slot = self
      .inner
      .handler
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    let old = slot.take();
    if self.inner.core.is_connected() {
      let topic = self.inner.core.topic();
      if let Some(store) = self.inner.core.store() {
        if let Some(old) = old.as_ref() {
          store.remove_receiver(&topic, old.flag_receiver());
        }
        store.add_receiver(&topic, handler.flag_receiver());
      }
    }
    *slot = Some(handler);
    old
  }
}

/// Typed queued read endpoint parameterized by queue length and blocking
/// behavior.
pub struct QueuedReceiverPort<T> {
  generic: GenericQueuedReceiverPort,
  _ph: PhantomData<fn() -> T>,
}

impl<T> Clone for QueuedReceiverPort<T> {
  fn clone(&self) -> Self {
    QueuedReceiverPort {
      generic: self.generic.clone(),
      _ph: PhantomData,
    }
  }
}

impl<T: ValueType> QueuedReceiverPort<T> {
  pub fn new(name: &str, queue_size: usize, blocking: bool) -> Self {
    QueuedReceiverPort {
      generic: GenericQueuedReceiverPort::new(name, queue_size, blocking),
      _ph: PhantomData,
    }
  }

  pub fn has_value(&self) -> bool {
    self.generic.has_value()
  }

  pub fn queue_size(&self) -> usize {
    self.generic.queue_size()
  }

  /// Head of the queue without removing it.
  pub fn peek_value(&self) -> Option<Arc<T>> {
    self.generic.peek_handle().and_then(|h| h.downcast::<T>())
  }

  /// Pop and return the next value.
  pub fn get_value(&self) -> Option<Arc<T>> {
    self.generic.pop_handle().and_then(|h| h.downcast::<T>())
  }

  pub fn blocking(&self) -> bool {
    self.generic.blocking()
  }

  pub fn set_blocking(&self, blocking: bool) {
    self.generic.set_blocking(blocking);
  }

  pub fn max_queue_length(&self) -> usize {
    self.generic.max_queue_length()
  }

  pub fn set_max_queue_length(&self, max_len: usize) {
    self.generic.set_max_queue_length(max_len);
  }
}

impl<T: ValueType> Port for QueuedReceiverPort<T> {
  fn name(&self) -> String {
    self.generic.name()
  }
  fn direction(&self) -> PortDirection {
    PortDirection::Receiver
  }
  fn topic(&self) -> String {
    self.generic.topic()
  }
  fn is_connected(&self) -> bool {
    self.generic.is_connected()
  }
  fn value_type(&self) -> Option<TypeId> {
    Some(TypeId::of::<T>())
  }
  fn setup(&self, store: &Arc<ValueStore>) {
    self.generic.setup(store);
  }
  fn connect(&self) {
    self.generic.connect();
  }
  fn disconnect(&self) {
    self.generic.disconnect();
  }
  fn map_to_topic(&self, topic: &str) {
    self.generic.map_to_topic(topic);
  }
  fn clone_port(&self) -> Box<dyn Port> {
    Box::new(self.clone())
  }
}

impl<T: ValueType> HandlerPort for QueuedReceiverPort<T> {
  fn attach_handler(&self, handler: Arc<PortTriggerHandler>) -> Option<Arc<PortTriggerHandler>> {
    self.generic.attach_handler(handler)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::value::CountingIdGenerator;
  use serde::{Deserialize, Serialize};
  use std::{thread, time::Duration};

  #[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
  struct TestValue {
    val: i32,
  }

  fn id_generator() -> Arc<dyn IdGenerator> {
    Arc::new(CountingIdGenerator::new())
  }

  fn bound_sender(store: &Arc<ValueStore>, topic: &str) -> SenderPort<TestValue> {
    let port = SenderPort::<TestValue>::new("Out", id_generator());
    port.setup(store);
    port.map_to_topic(topic);
    port.connect();
    port
  }

  #[test]
  fn unconnected_sender_reports_not_connected() {
    let port = SenderPort::<TestValue>::new("Out", id_generator());
    assert_eq!(
      port.set_value(TestValue { val: 1 }, true),
      Err(PublishError::NotConnected)
    );
  }

  #[test]
  fn sender_stamps_fresh_ids() {
    let store = Arc::new(ValueStore::new());
    let port = bound_sender(&store, "/t");
    port.set_value(TestValue { val: 1 }, true).unwrap();
    let first = store.get_value_handle("/t").unwrap().id();
    port.set_value(TestValue { val: 2 }, true).unwrap();
    let second = store.get_value_handle("/t").unwrap().id();
    assert_ne!(first, 0);
    assert_ne!(first, second);
  }

  #[test]
  fn latest_only_receiver_sees_current_value() {
    let store = Arc::new(ValueStore::new());
    let receiver = ReceiverPort::<TestValue>::new("In");
    receiver.setup(&store);
    receiver.map_to_topic("/t");
    receiver.connect();

    let sender = bound_sender(&store, "/t");
    assert!(!receiver.has_value());
    sender.set_value(TestValue { val: 5 }, true).unwrap();
    sender.set_value(TestValue { val: 6 }, true).unwrap();
    assert!(receiver.has_value());
    assert_eq!(receiver.get_value().val, 6);
    receiver.event_flag().reset();
    assert!(!receiver.has_value());
  }

  #[test]
  fn queued_receiver_drains_in_order() {
    let store = Arc::new(ValueStore::new());
    let receiver = QueuedReceiverPort::<TestValue>::new("In", 2, false);
    receiver.setup(&store);
    receiver.map_to_topic("/t");
    receiver.connect();

    let sender = bound_sender(&store, "/t");
    for val in 1..=4 {
      sender.set_value(TestValue { val }, true).unwrap();
    }
    assert_eq!(receiver.peek_value().unwrap().val, 3);
    assert_eq!(receiver.get_value().unwrap().val, 3);
    assert_eq!(receiver.get_value().unwrap().val, 4);
    assert_eq!(receiver.get_value(), None);
  }

  #[test]
  fn disconnect_cancels_blocking_write() {
    let store = Arc::new(ValueStore::new());
    let receiver = QueuedReceiverPort::<TestValue>::new("In", 1, true);
    receiver.setup(&store);
    receiver.map_to_topic("/t");
    receiver.connect();

    let sender = bound_sender(&store, "/t");
    sender.set_value(TestValue { val: 1 }, true).unwrap();

    let sender2 = sender.clone();
    let writer = thread::spawn(move || sender2.set_value(TestValue { val: 2 }, true));
    thread::sleep(Duration::from_millis(50));
    sender.disconnect();
    // within two polling intervals the write must give up
    let result = writer.join().unwrap();
    assert_eq!(result, Err(PublishError::Cancelled));
  }

  #[test]
  fn remap_moves_registration_to_new_topic() {
    let store = Arc::new(ValueStore::new());
    let receiver = QueuedReceiverPort::<TestValue>::new("In", 0, false);
    receiver.setup(&store);
    receiver.map_to_topic("/a");
    receiver.connect();

    store.set_value("/a", TestValue { val: 1 }).unwrap();
    receiver.map_to_topic("/b");
    store.set_value("/a", TestValue { val: 2 }).unwrap();
    store.set_value("/b", TestValue { val: 3 }).unwrap();

    assert_eq!(receiver.get_value().unwrap().val, 1);
    assert_eq!(receiver.get_value().unwrap().val, 3);
    assert_eq!(receiver.get_value(), None);
  }

  #[test]
  fn handler_flag_is_set_by_publication() {
    let store = Arc::new(ValueStore::new());
    let receiver = ReceiverPort::<TestValue>::new("In");
    receiver.setup(&store);
    receiver.map_to_topic("/t");
    receiver.connect();
    let handler = PortTriggerHandler::new(|| {});
    receiver.attach_handler(Arc::clone(&handler));

    store.set_value("/t", TestValue { val: 1 }).unwrap();
    assert!(handler.event_flag().active());
  }
}
