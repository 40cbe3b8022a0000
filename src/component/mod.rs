// Component runtime: the lifecycle state machine, the per-component worker
// thread with its trigger and handler dispatch, runtime statistics, the
// configuration bridge and the component logger.

pub mod config;
pub mod logger;
pub mod manager;

pub use logger::{ComponentLogger, LogSeverity};
pub use manager::{ComponentConfig, ComponentManager};

use std::{
  path::PathBuf,
  sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc, Mutex,
  },
  time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::{ConfigError, SchedulingError},
  port::{HandlerPort, Port, PortTriggerHandler, ReceiverPort, SenderPort},
  rtsync::{self, SchedulingParameters, SchedulingPolicy, ThreadHandle},
  store::{Trigger, Triggerable, ValueStore},
  topics,
  value::{
    messages::{LogControl, LogMessage, RuntimeStats, RuntimeStatsEntry, StringValue},
    CountingIdGenerator, IdGenerator, ValueHandle,
  },
};

const DEFAULT_CONFIG_NAME_SUFFIX: &str = ".json";

/// Lifecycle states of a component. The worker thread is alive in every
/// state from `StartingUp` to `WaitStop` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
  Init = 0,
  StartingUp = 1,
  Started = 2,
  Running = 3,
  ShuttingDown = 4,
  WaitStop = 5,
  Stopped = 6,
}

impl ComponentState {
  fn from_u8(raw: u8) -> Self {
    match raw {
      0 => ComponentState::Init,
      1 => ComponentState::StartingUp,
      2 => ComponentState::Started,
      3 => ComponentState::Running,
      4 => ComponentState::ShuttingDown,
      5 => ComponentState::WaitStop,
      _ => ComponentState::Stopped,
    }
  }
}

struct AtomicState(AtomicU8);

impl AtomicState {
  fn new(state: ComponentState) -> Self {
    AtomicState(AtomicU8::new(state as u8))
  }
  fn load(&self) -> ComponentState {
    ComponentState::from_u8(self.0.load(Ordering::SeqCst))
  }
  fn store(&self, state: ComponentState) {
    self.0.store(state as u8, Ordering::SeqCst);
  }
}

struct TriggerHandlerEntry {
  name: String,
  handler: Box<dyn Fn() + Send + Sync>,
  stats: RuntimeStatsEntry,
}

/// State every component carries: identity, lifecycle, trigger, handler
/// lists, scheduling, statistics, the framework ports and the logger.
///
/// Component implementations hold this in an `Arc` and return it from
/// [`Component::core`]; everything lifecycle-related goes through it.
pub struct ComponentCore {
  name: String,
  instance_name: Mutex<String>,
  state: AtomicState,
  run_request: AtomicBool,
  stop_request: AtomicBool,
  trigger: Arc<Trigger>,
  trigger_dyn: Arc<dyn Triggerable>,
  trigger_handlers: Mutex<Vec<TriggerHandlerEntry>>,
  port_trigger_handlers: Mutex<Vec<Arc<PortTriggerHandler>>>,
  scheduling: Mutex<SchedulingParameters>,
  thread_handle: Mutex<Option<ThreadHandle>>,
  id_generator: Arc<dyn IdGenerator>,
  value_store: Mutex<Option<Arc<ValueStore>>>,
  stats: Mutex<RuntimeStats>,
  config: Mutex<Option<serde_json::Value>>,
  config_name: Mutex<String>,
  config_dirs: Mutex<Vec<PathBuf>>,
  logger: ComponentLogger,
  log_message_port: SenderPort<LogMessage>,
  log_control_port: ReceiverPort<LogControl>,
  config_out_port: SenderPort<StringValue>,
  config_in_port: ReceiverPort<StringValue>,
}

impl ComponentCore {
  /// Default scheduling is FIFO at priority 1, degrading to the OS default
  /// class when the process lacks real-time capability.
  pub fn new(name: &str) -> Arc<Self> {
    Self::with_priority(name, 1)
  }

  pub fn with_priority(name: &str, priority: i32) -> Arc<Self> {
    let id_generator: Arc<dyn IdGenerator> = Arc::new(CountingIdGenerator::new());
    let trigger = Arc::new(Trigger::new());
    let trigger_dyn = Arc::clone(&trigger) as Arc<dyn Triggerable>;
    let log_message_port = SenderPort::new("LogMessage", Arc::clone(&id_generator));
    Arc::new(ComponentCore {
      name: name.to_string(),
      instance_name: Mutex::new(name.to_string()),
      state: AtomicState::new(ComponentState::Init),
      run_request: AtomicBool::new(false),
      stop_request: AtomicBool::new(false),
      trigger,
      trigger_dyn,
      trigger_handlers: Mutex::new(Vec::new()),
      port_trigger_handlers: Mutex::new(Vec::new()),
      scheduling: Mutex::new(SchedulingParameters::new(SchedulingPolicy::Fifo, priority)),
      thread_handle: Mutex::new(None),
      id_generator: Arc::clone(&id_generator),
      value_store: Mutex::new(None),
      stats: Mutex::new(RuntimeStats::default()),
      config: Mutex::new(None),
      config_name: Mutex::new(format!("{name}{DEFAULT_CONFIG_NAME_SUFFIX}")),
      config_dirs: Mutex::new(vec![PathBuf::from(".")]),
      logger: ComponentLogger::new(name, log_message_port.clone()),
      log_message_port,
      log_control_port: ReceiverPort::new("LogControl"),
      config_out_port: SenderPort::new("ConfigOut", id_generator),
      config_in_port: ReceiverPort::new("ConfigIn"),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn instance_name(&self) -> String {
    self
      .instance_name
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  pub fn state(&self) -> ComponentState {
    self.state.load()
  }

  pub fn id_generator(&self) -> Arc<dyn IdGenerator> {
    Arc::clone(&self.id_generator)
  }

  pub fn value_store(&self) -> Option<Arc<ValueStore>> {
    self
      .value_store
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  pub fn logger(&self) -> &ComponentLogger {
    &self.logger
  }

  pub fn log(&self, severity: LogSeverity, message: &str) {
    self.logger.log(severity, message);
  }

  pub fn statistics(&self) -> RuntimeStats {
    self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  /// Wake the component's worker thread.
  pub fn trigger(&self) {
    self.trigger.trigger();
  }

  /// Register a handler running on every trigger of the worker thread.
  pub fn register_trigger_handler<F: Fn() + Send + Sync + 'static>(&self, handler: F) {
    self.register_named_trigger_handler("*", handler);
  }

  pub fn register_named_trigger_handler<F: Fn() + Send + Sync + 'static>(
    &self,
    name: &str,
    handler: F,
  ) {
    self
      .trigger_handlers
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(TriggerHandlerEntry {
        name: name.to_string(),
        handler: Box::new(handler),
        stats: RuntimeStatsEntry::default(),
      });
  }

  /// Attach a port trigger handler to a receiver port and register it for
  /// dispatch by this component's worker thread. A handler previously
  /// attached to the port is unregistered.
  pub fn register_port_handler(&self, port: &dyn HandlerPort, handler: Arc<PortTriggerHandler>) {
    if let Some(old) = port.attach_handler(Arc::clone(&handler)) {
      self.unregister_handler(&old);
    }
    let mut handlers = self
      .port_trigger_handlers
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    if !handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
      handlers.push(Arc::clone(&handler));
    }
    handler.event_flag().triggers().add_trigger(&self.trigger_dyn);
  }

  fn unregister_handler(&self, handler: &Arc<PortTriggerHandler>) {
    self
      .port_trigger_handlers
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .retain(|h| !Arc::ptr_eq(h, handler));
    handler
      .event_flag()
      .triggers()
      .remove_trigger(&self.trigger_dyn);
  }

  /// Change the component thread's scheduling, validating first. Takes
  /// effect immediately on a live thread, otherwise at the next startup.
  pub fn set_scheduling_parameters(
    &self,
    params: SchedulingParameters,
  ) -> Result<(), SchedulingError> {
    params.validate()?;
    *self.scheduling.lock().unwrap_or_else(|e| e.into_inner()) = params;
    let state = self.state();
    if state == ComponentState::Started || state == ComponentState::Running {
      if let Some(handle) = *self.thread_handle.lock().unwrap_or_else(|e| e.into_inner()) {
        rtsync::apply_to_thread(handle, params)?;
      }
    }
    Ok(())
  }

  pub fn scheduling_parameters(&self) -> SchedulingParameters {
    *self.scheduling.lock().unwrap_or_else(|e| e.into_inner())
  }

  // --- configuration bridge ---

  pub fn set_config_name(&self, name: &str) {
    *self.config_name.lock().unwrap_or_else(|e| e.into_inner()) = name.to_string();
  }

  pub fn set_config_dirs(&self, dirs: Vec<PathBuf>) {
    *self.config_dirs.lock().unwrap_or_else(|e| e.into_inner()) = dirs;
  }

  /// Read and merge the config file from every config directory, republish
  /// the merged document on the config-out topic and apply log levels.
  pub fn read_config(&self) -> Result<serde_json::Value, ConfigError> {
    let name = self.config_name.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let paths: Vec<PathBuf> = self
      .config_dirs
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .map(|dir| dir.join(&name))
      .collect();
    let merged = config::merge_files(&paths, true)?;
    let _ = self
      .config_out_port
      .set_value(StringValue::new(merged.to_string()), true);
    self.logger.set_levels_from_config(&merged);
    *self.config.lock().unwrap_or_else(|e| e.into_inner()) = Some(merged.clone());
    Ok(merged)
  }

  /// The component configuration, reading it on first access.
  pub fn get_config(&self) -> Result<serde_json::Value, ConfigError> {
    if let Some(config) = self.config.lock().unwrap_or_else(|e| e.into_inner()).clone() {
      self.logger.set_levels_from_config(&config);
      return Ok(config);
    }
    self.read_config()
  }

  /// Configuration pushed on the config-in port, if any. Does not
  /// republish on the config-out topic.
  pub fn get_config_from_port(&self) -> Result<Option<serde_json::Value>, ConfigError> {
    if !self.config_in_port.has_value() {
      return Ok(None);
    }
    let text = self.config_in_port.get_value().value.clone();
    let config: serde_json::Value =
      serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
        path: self.config_in_port.topic(),
        source: e,
      })?;
    self.logger.set_levels_from_config(&config);
    Ok(Some(config))
  }

  pub fn config_in_port(&self) -> &ReceiverPort<StringValue> {
    &self.config_in_port
  }

  // --- lifecycle requests, driven by the manager ---

  fn request_stop(&self) {
    self.stop_request.store(true, Ordering::SeqCst);
    self.trigger.trigger();
  }

  fn stop_requested(&self) -> bool {
    self.stop_request.load(Ordering::SeqCst)
  }

  fn set_value_store(&self, store: &Arc<ValueStore>) {
    *self
      .value_store
      .lock()
      .unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(store));
  }

  fn set_instance_name(&self, instance: &str) {
    *self
      .instance_name
      .lock()
      .unwrap_or_else(|e| e.into_inner()) = instance.to_string();
    self.logger.set_name(instance);
  }

  fn record_handler_stats(&self, entry_stats: &mut RuntimeStatsEntry, key: &str, start: Instant) {
    let duration_us = start.elapsed().as_micros() as u64;
    let now_ms = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_millis() as u64;
    if entry_stats.start == 0 {
      entry_stats.start = now_ms;
    }
    entry_stats.count += 1;
    entry_stats.total += duration_us;
    if entry_stats.count == 1 || (duration_us as i64) < entry_stats.min {
      entry_stats.min = duration_us as i64;
    }
    if duration_us as i64 > entry_stats.max {
      entry_stats.max = duration_us as i64;
    }
    if now_ms > entry_stats.start {
      entry_stats.rate = (entry_stats.count * 1000 / (now_ms - entry_stats.start)) as i64;
    }
    entry_stats.avg = (entry_stats.total / entry_stats.count) as i64;
    self
      .stats
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .entries
      .insert(key.to_string(), *entry_stats);
  }

  fn publish_stats(&self) {
    let Some(store) = self.value_store() else {
      return;
    };
    let stats = self.statistics();
    let topic = format!("{}{}", topics::STATS_PREFIX, self.instance_name());
    let id = self.id_generator.generate_id();
    let _ = store.set_value_handle(&topic, ValueHandle::new(stats, id), false, &|| false);
  }
}

/// A unit of the pipeline: user code hooked into a [`ComponentCore`].
///
/// `configure` registers ports and handlers; `startup` and `shutdown` run
/// first and last on the worker thread. All hooks take `&self`; components
/// keep mutable state behind their own locks.
pub trait Component: Send + Sync + 'static {
  fn core(&self) -> &Arc<ComponentCore>;

  fn configure(&self, config: &mut ComponentConfig<'_>) {
    let _ = config;
  }

  fn startup(&self) {}

  fn shutdown(&self) {}
}

const STATS_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// Worker thread body. Runs startup, parks on the trigger until the run
/// request arrives, dispatches handlers per wake-up, runs shutdown.
pub(crate) fn component_main(component: Arc<dyn Component>) {
  let core = Arc::clone(component.core());
  let instance = core.instance_name();
  rtsync::set_thread_name(&instance);
  *core
    .thread_handle
    .lock()
    .unwrap_or_else(|e| e.into_inner()) = Some(rtsync::current_thread_handle());
  if let Err(e) = rtsync::apply_to_current_thread(core.scheduling_parameters()) {
    error!("[{instance}] could not set scheduling parameters: {e}");
  }

  info!("component [{instance}]: startup");
  component.startup();
  core.state.store(ComponentState::Started);

  while !core.stop_requested() && !core.run_request.load(Ordering::SeqCst) {
    std::thread::sleep(Duration::from_millis(10));
  }

  if core.run_request.load(Ordering::SeqCst) {
    core.state.store(ComponentState::Running);
    let mut last_stats = Instant::now();
    while !core.stop_requested() {
      core.trigger.wait();
      if !core.stop_requested() {
        let mut handlers = core
          .trigger_handlers
          .lock()
          .unwrap_or_else(|e| e.into_inner());
        for entry in handlers.iter_mut() {
          let start = Instant::now();
          (entry.handler)();
          let name = entry.name.clone();
          let mut stats = entry.stats;
          core.record_handler_stats(&mut stats, &name, start);
          entry.stats = stats;
        }
      }
      let port_handlers = core
        .port_trigger_handlers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
      for handler in port_handlers {
        if !core.stop_requested() && handler.event_flag().active() {
          handler.event_flag().reset();
          let start = Instant::now();
          handler.call();
          let key = if handler.name().is_empty() {
            handler.event_flag().topic()
          } else {
            handler.name().to_string()
          };
          let mut stats = core
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .get(&key)
            .copied()
            .unwrap_or_default();
          core.record_handler_stats(&mut stats, &key, start);
        }
      }
      if last_stats.elapsed() >= STATS_PUBLISH_INTERVAL {
        core.publish_stats();
        last_stats = Instant::now();
      }
    }
  }

  core.state.store(ComponentState::ShuttingDown);
  info!("component [{instance}]: shutting down");
  component.shutdown();
  core.state.store(ComponentState::WaitStop);
}
