// The bridge component: mirrors declared topics between two processes.
// Send rules drain local queued ports towards the peer; receive rules
// inject peer values through local sender ports. Three auxiliary threads
// keep the cycle alive, pump the transport and retry blocked injections.

use std::{
  collections::BTreeMap,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex, Weak,
  },
  thread,
  time::Duration,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  component::{Component, ComponentConfig, ComponentCore, ComponentState},
  port::{GenericQueuedReceiverPort, GenericSenderPort, PortTriggerHandler},
  remote::{
    endpoint::RemoteResponse,
    pair::{RemoteEndpoint, RemotePair},
  },
  rtsync::{self, SchedulingPolicy},
  store::ValueStore,
  value::ValueHandle,
};

const STATE_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(1000);
const PENDING_RETRY_INTERVAL: Duration = Duration::from_millis(1);

struct SendRule {
  local_topic: String,
  priority: u8,
  port: GenericQueuedReceiverPort,
  /// Send the store's latest value even though the queue is empty, set by
  /// the peer's `sendAll`.
  forced_send: bool,
  /// A value was answered with RECEIVED and awaits the peer's
  /// injected/rejected command.
  send_pending: bool,
}

struct ReceiveRule {
  local_topic: String,
  port: GenericSenderPort,
  /// A value the local store could not take yet; retried by the pending
  /// values thread.
  pending_value: Option<ValueHandle>,
}

#[derive(Default)]
struct Outcomes {
  injected: Vec<String>,
  rejected: Vec<String>,
}

struct ServiceState {
  core: Weak<ComponentCore>,
  store: Arc<ValueStore>,
  pair: Arc<RemotePair>,
  /// Keyed by remote topic; at most one rule per remote topic and
  /// direction.
  send_rules: Mutex<BTreeMap<String, SendRule>>,
  receive_rules: Mutex<BTreeMap<String, ReceiveRule>>,
  pending_cv: Condvar,
  outcomes: Mutex<Outcomes>,
  initialized: AtomicBool,
  receive_timeout: Mutex<Duration>,
}

/// Component mirroring selected topics to a peer process through a
/// [`RemotePair`].
pub struct RemoteService {
  core: Arc<ComponentCore>,
  state: Arc<ServiceState>,
  aux_threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl RemoteService {
  pub fn new(store: Arc<ValueStore>, pair: RemotePair) -> Arc<Self> {
    let pair = Arc::new(pair);
    let name = format!("RemoteService{}", pair.connection_str());
    let core = ComponentCore::with_priority(&name, 30);
    let state = Arc::new(ServiceState {
      core: Arc::downgrade(&core),
      store,
      pair,
      send_rules: Mutex::new(BTreeMap::new()),
      receive_rules: Mutex::new(BTreeMap::new()),
      pending_cv: Condvar::new(),
      outcomes: Mutex::new(Outcomes::default()),
      initialized: AtomicBool::new(false),
      receive_timeout: Mutex::new(DEFAULT_RECEIVE_TIMEOUT),
    });
    Arc::new(RemoteService {
      core,
      state,
      aux_threads: Mutex::new(Vec::new()),
    })
  }

  /// Forward `topic_local` to the peer as `topic_remote`. Must be called
  /// before the component is configured. A rule's queue buffers values
  /// until the peer accepts them; with `blocking` the queue back-pressures
  /// local publishers instead of dropping.
  pub fn add_send_rule(
    &self,
    topic_local: &str,
    topic_remote: &str,
    queue_length: usize,
    blocking: bool,
    priority: u8,
  ) {
    let mut rules = self.state.lock_send_rules();
    assert!(
      !rules.contains_key(topic_remote),
      "a send rule for remote topic {topic_remote:?} is already defined"
    );
    rules.insert(
      topic_remote.to_string(),
      SendRule {
        local_topic: topic_local.to_string(),
        priority,
        port: GenericQueuedReceiverPort::new(
          &format!("Send[{topic_local}]"),
          queue_length,
          blocking,
        ),
        forced_send: false,
        send_pending: false,
      },
    );
  }

  /// Inject the peer's `topic_remote` locally as `topic_local`. Must be
  /// called before the component is configured.
  pub fn add_receive_rule(&self, topic_local: &str, topic_remote: &str) {
    let mut rules = self
      .state
      .receive_rules
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    assert!(
      !rules.contains_key(topic_remote),
      "a receive rule for remote topic {topic_remote:?} is already defined"
    );
    rules.insert(
      topic_remote.to_string(),
      ReceiveRule {
        local_topic: topic_local.to_string(),
        port: GenericSenderPort::new(
          &format!("Receive[{topic_local}]"),
          self.core.id_generator(),
        ),
        pending_value: None,
      },
    );
  }

  /// How long the receiver thread polls its transport per pass. Also
  /// bounds how quickly the thread observes a stop request.
  pub fn set_receive_timeout(&self, timeout: Duration) {
    *self
      .state
      .receive_timeout
      .lock()
      .unwrap_or_else(|e| e.into_inner()) = timeout;
  }

  pub fn connected(&self) -> bool {
    self.state.initialized.load(Ordering::SeqCst) && self.state.pair.connected()
  }

  pub fn remote_state(&self) -> crate::remote::RemoteState {
    self.state.pair.remote_state()
  }
}

impl Component for RemoteService {
  fn core(&self) -> &Arc<ComponentCore> {
    &self.core
  }

  fn configure(&self, config: &mut ComponentConfig<'_>) {
    {
      let rules = self.state.lock_send_rules();
      for rule in rules.values() {
        config.register_port_with_topic(&rule.port, &rule.local_topic);
        // an empty handler: its event flag wakes the worker, the send
        // cycle in the trigger handler does the actual work
        self
          .core
          .register_port_handler(&rule.port, PortTriggerHandler::new(|| {}));
      }
    }
    {
      let rules = self
        .state
        .receive_rules
        .lock()
        .unwrap_or_else(|e| e.into_inner());
      for rule in rules.values() {
        config.register_port_with_topic(&rule.port, &rule.local_topic);
      }
    }
    let state = Arc::clone(&self.state);
    self.core.register_trigger_handler(move || {
      state.handle_triggers();
    });
  }

  fn startup(&self) {
    rtsync::set_thread_name("RS");
    self.state.pair.connect_sender();

    let component_sched = rtsync::current_thread_scheduling();
    let mut aux_sched = component_sched;
    if aux_sched.policy == SchedulingPolicy::Fifo {
      aux_sched.priority += 1;
    }

    let mut aux_threads = self.aux_threads.lock().unwrap_or_else(|e| e.into_inner());

    let state = Arc::clone(&self.state);
    aux_threads.push(
      thread::Builder::new()
        .name("RC".to_string())
        .spawn(move || state.trigger_cyclic())
        .expect("could not spawn remote cyclic thread"),
    );

    let state = Arc::clone(&self.state);
    aux_threads.push(
      thread::Builder::new()
        .name("RR".to_string())
        .spawn(move || state.receive_loop(aux_sched))
        .expect("could not spawn remote receiver thread"),
    );

    let state = Arc::clone(&self.state);
    aux_threads.push(
      thread::Builder::new()
        .name("RP".to_string())
        .spawn(move || state.pending_values_loop(aux_sched))
        .expect("could not spawn remote pending values thread"),
    );
  }

  fn shutdown(&self) {
    // wake the pending values thread so it observes the state change
    self.state.pending_cv.notify_all();
    let threads: Vec<_> = self
      .aux_threads
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .drain(..)
      .collect();
    for thread in threads {
      if thread.join().is_err() {
        error!("remote bridge worker terminated with a panic");
      }
    }
    self.state.pair.disconnect_sender();
    self.state.initialized.store(false, Ordering::SeqCst);
  }
}

impl ServiceState {
  fn lock_send_rules(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, SendRule>> {
    self.send_rules.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn component_state(&self) -> ComponentState {
    self
      .core
      .upgrade()
      .map_or(ComponentState::Stopped, |core| core.state())
  }

  fn trigger(&self) {
    if let Some(core) = self.core.upgrade() {
      core.trigger();
    }
  }

  fn wait_until_running(&self) -> bool {
    loop {
      match self.component_state() {
        ComponentState::Init | ComponentState::StartingUp | ComponentState::Started => {
          thread::sleep(STATE_POLL_INTERVAL);
        }
        ComponentState::Running => return true,
        _ => return false,
      }
    }
  }

  /// Keeps the worker cycling so pings go out even when no port events
  /// arrive.
  fn trigger_cyclic(&self) {
    if !self.wait_until_running() {
      return;
    }
    while self.component_state() == ComponentState::Running {
      self.trigger();
      self.pair.wait_for_event();
    }
  }

  fn receive_loop(&self, sched: rtsync::SchedulingParameters) {
    rtsync::set_thread_name("RR");
    if let Err(e) = rtsync::apply_to_current_thread(sched) {
      debug!("could not raise receiver thread priority: {e}");
    }
    self.pair.connect_receiver();
    if !self.wait_until_running() {
      self.pair.disconnect_receiver();
      return;
    }
    while self.component_state() == ComponentState::Running {
      let timeout = *self
        .receive_timeout
        .lock()
        .unwrap_or_else(|e| e.into_inner());
      self.pair.receive(timeout, self);
    }
    self.pair.disconnect_receiver();
  }

  /// Retries values the local store could not take immediately and queues
  /// the outcome commands for the worker thread.
  fn pending_values_loop(&self, sched: rtsync::SchedulingParameters) {
    rtsync::set_thread_name("RP");
    if let Err(e) = rtsync::apply_to_current_thread(sched) {
      debug!("could not raise pending values thread priority: {e}");
    }
    if !self.wait_until_running() {
      return;
    }
    while self.component_state() == ComponentState::Running {
      let mut injected = Vec::new();
      let mut rejected = Vec::new();
      {
        let mut rules = self
          .receive_rules
          .lock()
          .unwrap_or_else(|e| e.into_inner());
        while !rules.values().any(|r| r.pending_value.is_some())
          && self.component_state() == ComponentState::Running
        {
          rules = self
            .pending_cv
            .wait_timeout(rules, Duration::from_millis(100))
            .unwrap_or_else(|e| e.into_inner())
            .0;
        }
        for (remote_topic, rule) in rules.iter_mut() {
          let Some(value) = rule.pending_value.clone() else {
            continue;
          };
          match rule.port.set_value_handle(value, false) {
            Ok(()) => {
              rule.pending_value = None;
              injected.push(remote_topic.clone());
            }
            Err(crate::error::PublishError::Again) => {
              // still blocked, retried on the next pass
            }
            Err(_) => {
              rule.pending_value = None;
              rejected.push(remote_topic.clone());
            }
          }
        }
      }
      if !injected.is_empty() || !rejected.is_empty() {
        let mut outcomes = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
        outcomes.injected.extend(injected);
        outcomes.rejected.extend(rejected);
        drop(outcomes);
        // the worker owns the transport, it reports the outcomes back
        self.trigger();
      }
      thread::sleep(PENDING_RETRY_INTERVAL);
    }
  }

  /// Main worker-cycle body, run per component trigger.
  fn handle_triggers(&self) {
    self.pair.observe_state_change(self);

    if !self.initialized.load(Ordering::SeqCst) && self.pair.connected() {
      self.initialized.store(true, Ordering::SeqCst);
      // pull one value per remote send rule to prime the mirror
      self.pair.send_request_all();
    }

    self.handle_send();
    self.handle_injected_rejected();

    self.pair.cycle();
  }

  fn handle_send(&self) {
    if !self.initialized.load(Ordering::SeqCst) {
      return;
    }
    loop {
      let mut more_values_to_send = false;
      {
        let mut rules = self.lock_send_rules();
        let mut ordered: Vec<(&String, &mut SendRule)> = rules.iter_mut().collect();
        ordered.sort_by(|a, b| b.1.priority.cmp(&a.1.priority));
        for (remote_topic, rule) in ordered {
          if !self.pair.connected() {
            return;
          }
          self.handle_send_topic(remote_topic, rule);
          if rule.forced_send || rule.port.has_value() {
            more_values_to_send = true;
          }
        }
      }
      if !more_values_to_send {
        return;
      }
    }
  }

  fn handle_send_topic(&self, remote_topic: &str, rule: &mut SendRule) {
    // nothing goes out while an earlier value awaits its ack
    if rule.send_pending {
      return;
    }
    if let Some(value) = rule.port.peek_handle() {
      let response = self.pair.send_value(remote_topic, &value);
      match response {
        RemoteResponse::Injected | RemoteResponse::Rejected | RemoteResponse::Received => {
          rule.port.pop_handle();
          rule.forced_send = false;
          if response == RemoteResponse::Received {
            rule.send_pending = true;
          }
        }
        RemoteResponse::Timeout | RemoteResponse::Empty => {
          // keep the value queued; the liveness tracker saw the timeout
        }
      }
    } else if rule.forced_send {
      if rule.port.has_value() {
        // a value arrived in the meantime, the queue path sends it next
        rule.forced_send = false;
        return;
      }
      let Some(value) = self.store.get_value_handle(&rule.local_topic) else {
        rule.forced_send = false;
        return;
      };
      let response = self.pair.send_value(remote_topic, &value);
      match response {
        RemoteResponse::Injected | RemoteResponse::Rejected | RemoteResponse::Received => {
          rule.forced_send = false;
          if response == RemoteResponse::Received {
            rule.send_pending = true;
          }
        }
        RemoteResponse::Timeout | RemoteResponse::Empty => {}
      }
    }
  }

  /// Report the outcome of previously blocked injections back to the peer.
  fn handle_injected_rejected(&self) {
    let outcomes = {
      let mut outcomes = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
      std::mem::take(&mut *outcomes)
    };
    for topic in outcomes.injected {
      self.pair.send_blocked_value_injected(&topic);
    }
    for topic in outcomes.rejected {
      self.pair.send_blocked_value_rejected(&topic);
    }
  }
}

impl RemoteEndpoint for ServiceState {
  fn value_received(&self, topic: &str, value: ValueHandle) -> RemoteResponse {
    if !self.initialized.load(Ordering::SeqCst) {
      return RemoteResponse::Rejected;
    }
    let mut rules = self
      .receive_rules
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    let Some(rule) = rules.get_mut(topic) else {
      return RemoteResponse::Rejected;
    };
    if rule.pending_value.is_some() {
      return RemoteResponse::Rejected;
    }
    match rule.port.set_value_handle(value.clone(), false) {
      Ok(()) => RemoteResponse::Injected,
      Err(crate::error::PublishError::Again) => {
        // the local receiver is blocked; accept and inject later
        rule.pending_value = Some(value);
        self.pending_cv.notify_all();
        RemoteResponse::Received
      }
      Err(_) => RemoteResponse::Rejected,
    }
  }

  fn send_all(&self) {
    let mut rules = self.lock_send_rules();
    for rule in rules.values_mut() {
      rule.forced_send = true;
    }
    drop(rules);
    self.trigger();
  }

  fn reset_pending_values(&self) {
    let mut rules = self.lock_send_rules();
    for rule in rules.values_mut() {
      rule.send_pending = false;
    }
  }

  fn trigger_send_cycle(&self) {
    self.trigger();
  }

  fn blocked_value_injected_received(&self, topic: &str) {
    let mut rules = self.lock_send_rules();
    if let Some(rule) = rules.get_mut(topic) {
      rule.send_pending = false;
    }
    drop(rules);
    self.trigger();
  }

  fn blocked_value_rejected_received(&self, topic: &str) {
    // the peer dropped the value; locally it is already popped
    let mut rules = self.lock_send_rules();
    if let Some(rule) = rules.get_mut(topic) {
      rule.send_pending = false;
    }
    drop(rules);
    self.trigger();
  }
}
