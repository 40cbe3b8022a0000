use std::sync::Arc;

use crate::store::{EventFlag, ValueReceiver};

/// A handler invoked by a component thread when its event flag is active.
///
/// The flag belongs to the handler. Registering the same handler object
/// with several ports shares the flag: values arriving on any of the ports
/// between two dispatches collapse into a single invocation.
pub struct PortTriggerHandler {
  func: Box<dyn Fn() + Send + Sync>,
  event_flag: Arc<EventFlag>,
  flag_receiver: Arc<dyn ValueReceiver>,
  name: String,
}

impl PortTriggerHandler {
  pub fn new<F: Fn() + Send + Sync + 'static>(func: F) -> Arc<Self> {
    Self::with_name("", func)
  }

  pub fn with_name<F: Fn() + Send + Sync + 'static>(name: &str, func: F) -> Arc<Self> {
    let event_flag = Arc::new(EventFlag::new());
    let flag_receiver = Arc::clone(&event_flag) as Arc<dyn ValueReceiver>;
    Arc::new(PortTriggerHandler {
      func: Box::new(func),
      event_flag,
      flag_receiver,
      name: name.to_string(),
    })
  }

  pub fn call(&self) {
    (self.func)();
  }

  pub fn event_flag(&self) -> &Arc<EventFlag> {
    &self.event_flag
  }

  /// The flag pre-coerced for value store registration.
  pub fn flag_receiver(&self) -> &Arc<dyn ValueReceiver> {
    &self.flag_receiver
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}
