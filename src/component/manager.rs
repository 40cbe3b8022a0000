// Owns the registered components: wires their ports to the value store at
// configure time, drives the lifecycle sweep (configure / start / run /
// stop) and gives external control over port-to-topic mappings.

use std::{
  path::PathBuf,
  sync::{atomic::Ordering, Arc, Mutex},
  thread,
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  component::{component_main, Component, ComponentState, LogSeverity},
  port::{Port, PortTriggerHandler},
  store::ValueStore,
  topics,
};

struct ManagedComponent {
  component: Arc<dyn Component>,
  instance_name: String,
  ports: Vec<Box<dyn Port>>,
  thread: Option<thread::JoinHandle<()>>,
}

/// Port registration surface handed to [`Component::configure`].
///
/// Registered ports become externally visible: the manager can remap them
/// to other topics while the component runs.
pub struct ComponentConfig<'a> {
  store: &'a Arc<ValueStore>,
  instance_name: &'a str,
  ports: &'a mut Vec<Box<dyn Port>>,
}

impl ComponentConfig<'_> {
  pub fn instance_name(&self) -> &str {
    self.instance_name
  }

  /// Register a port without binding it; it stays disconnected until it is
  /// mapped to a topic from outside.
  pub fn register_port(&mut self, port: &dyn Port) {
    port.setup(self.store);
    self.ports.push(port.clone_port());
  }

  /// Register a port and bind it to a topic. The mapping is a default; it
  /// can be changed from outside afterwards.
  pub fn register_port_with_topic(&mut self, port: &dyn Port, topic: &str) {
    port.setup(self.store);
    port.map_to_topic(topic);
    port.connect();
    self.ports.push(port.clone_port());
  }
}

/// Registry and lifecycle driver for a set of components sharing one value
/// store.
///
/// `start` and `run` are separate sweeps so every component reaches
/// `Started` before any of them executes its main loop.
pub struct ComponentManager {
  value_store: Arc<ValueStore>,
  entries: Mutex<Vec<ManagedComponent>>,
  config_dirs: Mutex<Vec<PathBuf>>,
}

impl ComponentManager {
  pub fn new(value_store: Arc<ValueStore>) -> Self {
    ComponentManager {
      value_store,
      entries: Mutex::new(Vec::new()),
      config_dirs: Mutex::new(vec![PathBuf::from(".")]),
    }
  }

  pub fn value_store(&self) -> &Arc<ValueStore> {
    &self.value_store
  }

  pub fn set_config_dirs(&self, dirs: Vec<PathBuf>) {
    *self.config_dirs.lock().unwrap_or_else(|e| e.into_inner()) = dirs;
  }

  /// Register a component under its own name.
  pub fn register_component(&self, component: Arc<dyn Component>) {
    let instance = component.core().name().to_string();
    self.register_component_as(component, &instance);
  }

  /// Register a component under an explicit instance name, allowing several
  /// instances of the same component type.
  pub fn register_component_as(&self, component: Arc<dyn Component>, instance_name: &str) {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    assert!(
      !entries.iter().any(|e| e.instance_name == instance_name),
      "component instance {instance_name:?} registered twice"
    );
    entries.push(ManagedComponent {
      component,
      instance_name: instance_name.to_string(),
      ports: Vec::new(),
      thread: None,
    });
  }

  /// Configure every component: auto-bind the reserved log and config
  /// topics, then let the component register its own ports and handlers.
  pub fn configure(&self) {
    let config_dirs = self.config_dirs.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    for entry in entries.iter_mut() {
      let core = Arc::clone(entry.component.core());
      let instance = entry.instance_name.clone();
      core.set_value_store(&self.value_store);
      core.set_instance_name(&instance);
      core.set_config_dirs(config_dirs.clone());

      let mut ports = Vec::new();
      let mut config = ComponentConfig {
        store: &self.value_store,
        instance_name: &instance,
        ports: &mut ports,
      };
      config.register_port_with_topic(&core.log_message_port, &topics::log_message_topic(&instance));
      config.register_port_with_topic(&core.log_control_port, &topics::log_control_topic(&instance));
      config.register_port_with_topic(&core.config_out_port, &topics::config_topic(&instance));
      config.register_port_with_topic(&core.config_in_port, &topics::config_topic(&instance));

      let weak_core = Arc::downgrade(&core);
      core.register_port_handler(
        &core.log_control_port,
        PortTriggerHandler::with_name("LogControl", move || {
          if let Some(core) = weak_core.upgrade() {
            let level = core.log_control_port.get_value().level;
            core.logger().set_store_level(LogSeverity::from_i32(level));
          }
        }),
      );

      entry.component.configure(&mut config);
      entry.ports = ports;
    }
  }

  /// Spawn the worker thread of every component that is startable.
  pub fn start(&self) {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    for entry in entries.iter_mut() {
      start_entry(entry);
    }
  }

  /// Let every started component enter its main loop.
  pub fn run(&self) {
    let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    for entry in entries.iter() {
      run_entry(entry);
    }
  }

  /// Stop every component and join its worker thread.
  pub fn stop(&self) {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    for entry in entries.iter_mut() {
      stop_entry(entry);
    }
  }

  pub fn start_component(&self, instance_name: &str) -> bool {
    self.with_entry_mut(instance_name, start_entry)
  }

  pub fn run_component(&self, instance_name: &str) -> bool {
    self.with_entry_mut(instance_name, |e| run_entry(e))
  }

  pub fn stop_component(&self, instance_name: &str) -> bool {
    self.with_entry_mut(instance_name, stop_entry)
  }

  pub fn component_state(&self, instance_name: &str) -> Option<ComponentState> {
    let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    entries
      .iter()
      .find(|e| e.instance_name == instance_name)
      .map(|e| e.component.core().state())
  }

  /// Block until a component reaches `state`, up to `timeout`.
  pub fn wait_for_state(
    &self,
    instance_name: &str,
    state: ComponentState,
    timeout: Duration,
  ) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
      if self.component_state(instance_name) == Some(state) {
        return true;
      }
      thread::sleep(Duration::from_millis(5));
    }
    false
  }

  /// Rebind a registered port to another topic, atomically disconnecting
  /// and reconnecting its receiver registration.
  pub fn remap_port(&self, instance_name: &str, port_name: &str, topic: &str) -> bool {
    self.with_port(instance_name, port_name, |port| port.map_to_topic(topic))
  }

  pub fn connect_port(&self, instance_name: &str, port_name: &str) -> bool {
    self.with_port(instance_name, port_name, |port| port.connect())
  }

  pub fn disconnect_port(&self, instance_name: &str, port_name: &str) -> bool {
    self.with_port(instance_name, port_name, |port| port.disconnect())
  }

  /// Names and current topics of a component's registered ports.
  pub fn port_mappings(&self, instance_name: &str) -> Vec<(String, String)> {
    let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    entries
      .iter()
      .find(|e| e.instance_name == instance_name)
      .map(|e| e.ports.iter().map(|p| (p.name(), p.topic())).collect())
      .unwrap_or_default()
  }

  fn with_entry_mut(&self, instance_name: &str, f: impl FnOnce(&mut ManagedComponent)) -> bool {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    match entries.iter_mut().find(|e| e.instance_name == instance_name) {
      Some(entry) => {
        f(entry);
        true
      }
      None => false,
    }
  }

  fn with_port(
    &self,
    instance_name: &str,
    port_name: &str,
    f: impl FnOnce(&dyn Port),
  ) -> bool {
    let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    let Some(entry) = entries.iter().find(|e| e.instance_name == instance_name) else {
      return false;
    };
    match entry.ports.iter().find(|p| p.name() == port_name) {
      Some(port) => {
        f(port.as_ref());
        true
      }
      None => false,
    }
  }
}

impl Drop for ComponentManager {
  fn drop(&mut self) {
    self.stop();
  }
}

fn start_entry(entry: &mut ManagedComponent) {
  let core = entry.component.core();
  let state = core.state();
  if state != ComponentState::Init && state != ComponentState::Stopped {
    return;
  }
  core.run_request.store(false, Ordering::SeqCst);
  core.stop_request.store(false, Ordering::SeqCst);
  core.state.store(ComponentState::StartingUp);
  let component = Arc::clone(&entry.component);
  let thread = thread::Builder::new()
    .name(entry.instance_name.clone())
    .spawn(move || component_main(component))
    .expect("could not spawn component thread");
  entry.thread = Some(thread);
}

fn run_entry(entry: &ManagedComponent) {
  let core = entry.component.core();
  let state = core.state();
  if state == ComponentState::StartingUp || state == ComponentState::Started {
    core.run_request.store(true, Ordering::SeqCst);
  }
}

fn stop_entry(entry: &mut ManagedComponent) {
  let core = entry.component.core();
  let state = core.state();
  if state == ComponentState::Init || state == ComponentState::Stopped {
    return;
  }
  core.request_stop();
  if let Some(thread) = entry.thread.take() {
    if thread.join().is_err() {
      error!(
        "component thread of {} terminated with a panic",
        entry.instance_name
      );
    }
  }
  core.state.store(ComponentState::Stopped);
}
