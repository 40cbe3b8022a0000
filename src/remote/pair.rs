// A matched sender/receiver endpoint pair with liveness tracking. The pair
// owns the transport halves; the service drives it from its worker and
// receiver threads and reacts to the events forwarded here.

use std::{
  collections::VecDeque,
  sync::{Mutex, MutexGuard},
  time::Duration,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  remote::{
    endpoint::{ComEventListener, RemoteReceiver, RemoteResponse, RemoteSender},
    status::{RemoteState, RemoteStatusTracker},
  },
  value::ValueHandle,
};

/// Consumer surface of a remote pair: everything the owning service must
/// provide so received messages and state changes take effect locally.
pub trait RemoteEndpoint: Sync {
  /// A value arrived from the peer; attempt a local, non-blocking publish.
  fn value_received(&self, topic: &str, value: ValueHandle) -> RemoteResponse;

  /// The peer asked for one value per send rule.
  fn send_all(&self);

  /// The pair left UP; un-acked sends must be rearmed.
  fn reset_pending_values(&self);

  /// Wake the sending cycle.
  fn trigger_send_cycle(&self);

  /// A previously blocked value was injected on the peer side.
  fn blocked_value_injected_received(&self, topic: &str);

  /// A previously blocked value was rejected on the peer side.
  fn blocked_value_rejected_received(&self, topic: &str);
}

pub struct RemotePair {
  sender: Mutex<Box<dyn RemoteSender>>,
  receiver: Mutex<Box<dyn RemoteReceiver>>,
  tracker: RemoteStatusTracker,
  pong_queue: Mutex<VecDeque<u64>>,
  observed_state: Mutex<RemoteState>,
  connection_str: String,
}

impl RemotePair {
  pub fn new(sender: Box<dyn RemoteSender>, receiver: Box<dyn RemoteReceiver>) -> Self {
    Self::with_tracker(sender, receiver, RemoteStatusTracker::new())
  }

  pub fn with_tracker(
    sender: Box<dyn RemoteSender>,
    receiver: Box<dyn RemoteReceiver>,
    tracker: RemoteStatusTracker,
  ) -> Self {
    let connection_str = sender.connection_str();
    RemotePair {
      sender: Mutex::new(sender),
      receiver: Mutex::new(receiver),
      tracker,
      pong_queue: Mutex::new(VecDeque::new()),
      observed_state: Mutex::new(RemoteState::Unsure),
      connection_str,
    }
  }

  pub fn connection_str(&self) -> &str {
    &self.connection_str
  }

  pub fn remote_state(&self) -> RemoteState {
    self.tracker.state()
  }

  /// True while the peer is assumed up; only then are values forwarded.
  pub fn connected(&self) -> bool {
    self.tracker.state() == RemoteState::Up
  }

  pub fn ping_interval(&self) -> Duration {
    self.tracker.ping_interval()
  }

  pub fn connect_sender(&self) {
    if let Err(e) = self.sender().connect() {
      warn!("{}: sender connect failed: {e}", self.connection_str);
    }
  }

  pub fn disconnect_sender(&self) {
    self.sender().disconnect();
  }

  pub fn connect_receiver(&self) {
    if let Err(e) = self.receiver().connect() {
      warn!("{}: receiver connect failed: {e}", self.connection_str);
    }
  }

  pub fn disconnect_receiver(&self) {
    self.receiver().disconnect();
  }

  /// Forward one value; a transport timeout degrades the liveness state.
  pub fn send_value(&self, topic: &str, value: &ValueHandle) -> RemoteResponse {
    let response = self.sender().send_value(topic, value);
    if response == RemoteResponse::Timeout {
      self.tracker.sending_timeout();
    }
    response
  }

  pub fn send_blocked_value_injected(&self, topic: &str) -> RemoteResponse {
    let response = self.sender().send_blocked_value_injected(topic);
    if response == RemoteResponse::Timeout {
      self.tracker.sending_timeout();
    }
    response
  }

  pub fn send_blocked_value_rejected(&self, topic: &str) -> RemoteResponse {
    let response = self.sender().send_blocked_value_rejected(topic);
    if response == RemoteResponse::Timeout {
      self.tracker.sending_timeout();
    }
    response
  }

  pub fn send_request_all(&self) {
    self.sender().send_request_all();
  }

  /// Receive and dispatch at most one message, forwarding events to
  /// `endpoint`. Any reception while DOWN revives the liveness tracking.
  pub fn receive(&self, timeout: Duration, endpoint: &dyn RemoteEndpoint) -> bool {
    let listener = PairListener {
      pair: self,
      endpoint,
    };
    let received = self.receiver().receive(timeout, &listener);
    if received && self.tracker.state() == RemoteState::Down {
      self.tracker.message_received_in_down();
    }
    received
  }

  /// Periodic sender-side work: due pings and queued pongs.
  pub fn cycle(&self) {
    let mut sender = self.sender();
    self.tracker.run_cyclic(&mut |freshness| {
      sender.send_ping(freshness);
    });
    loop {
      let Some(freshness) = self
        .pong_queue
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .pop_front()
      else {
        break;
      };
      sender.send_pong(freshness);
    }
  }

  /// Park the calling thread until a liveness event or ping deadline.
  pub fn wait_for_event(&self) {
    self.tracker.wait_for_event();
  }

  /// Detect state transitions since the last call. Leaving UP resets the
  /// transport connection and rearms un-acked sends.
  pub fn observe_state_change(&self, endpoint: &dyn RemoteEndpoint) {
    let current = self.tracker.state();
    let mut observed = self
      .observed_state
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    if *observed != current {
      info!(
        "{}: remote state {} -> {}",
        self.connection_str,
        observed.as_str(),
        current.as_str()
      );
      if *observed == RemoteState::Up {
        let mut sender = self.sender();
        sender.disconnect();
        if let Err(e) = sender.connect() {
          debug!("{}: sender reconnect failed: {e}", self.connection_str);
        }
        drop(sender);
        endpoint.reset_pending_values();
      }
      *observed = current;
    }
  }

  fn sender(&self) -> MutexGuard<'_, Box<dyn RemoteSender>> {
    self.sender.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn receiver(&self) -> MutexGuard<'_, Box<dyn RemoteReceiver>> {
    self.receiver.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Adapter wiring transport events into the pair (liveness, pong queue)
/// and the endpoint (values, commands).
struct PairListener<'a> {
  pair: &'a RemotePair,
  endpoint: &'a dyn RemoteEndpoint,
}

impl ComEventListener for PairListener<'_> {
  fn value_received(&self, topic: &str, value: ValueHandle) -> RemoteResponse {
    self.endpoint.value_received(topic, value)
  }

  fn ping_received(&self, freshness: u64) {
    // answered from the sending cycle, replies and pings share one thread
    self
      .pair
      .pong_queue
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push_back(freshness);
    self.endpoint.trigger_send_cycle();
  }

  fn pong_received(&self, freshness: u64) {
    self.pair.tracker.pong_received(freshness);
  }

  fn request_all_received(&self) {
    self.endpoint.send_all();
  }

  fn blocked_value_injected_received(&self, topic: &str) {
    self.endpoint.blocked_value_injected_received(topic);
  }

  fn blocked_value_rejected_received(&self, topic: &str) {
    self.endpoint.blocked_value_rejected_received(topic);
  }
}
