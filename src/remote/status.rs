// Liveness tracking for one remote pair. Pings carry a freshness value;
// only a pong echoing the latest freshness counts as an answer.
//
// In DOWN no pings are sent; any received message moves the state to
// UNSURE. In UNSURE the ping interval doubles per sent ping, starting at
// the minimum; reaching the maximum without a matching pong means DOWN, a
// matching pong means UP. In UP pings go out at the maximum interval; a
// missing pong within the pong timeout means DOWN, and a send timeout
// reported from outside means UNSURE.

use std::{
  sync::{Condvar, Mutex},
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// Assumed state of the other side of a remote pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
  Down,
  Unsure,
  Up,
}

impl RemoteState {
  pub fn as_str(self) -> &'static str {
    match self {
      RemoteState::Down => "DOWN",
      RemoteState::Unsure => "UNSURE",
      RemoteState::Up => "UP",
    }
  }
}

struct TrackerState {
  remote_state: RemoteState,
  ping_interval: Duration,
  last_ping: Option<Instant>,
  last_pong: Option<Instant>,
  freshness: u64,
}

pub struct RemoteStatusTracker {
  state: Mutex<TrackerState>,
  event_cv: Condvar,
  ping_interval_min: Duration,
  ping_interval_max: Duration,
  pong_timeout: Duration,
}

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_PING_INTERVAL_MAX: Duration = Duration::from_millis(3000);
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_millis(5000);

impl RemoteStatusTracker {
  pub fn new() -> Self {
    Self::with_timing(
      DEFAULT_PING_INTERVAL,
      DEFAULT_PING_INTERVAL_MAX,
      DEFAULT_PONG_TIMEOUT,
    )
  }

  pub fn with_timing(
    ping_interval: Duration,
    ping_interval_max: Duration,
    pong_timeout: Duration,
  ) -> Self {
    RemoteStatusTracker {
      state: Mutex::new(TrackerState {
        remote_state: RemoteState::Unsure,
        ping_interval,
        last_ping: None,
        last_pong: None,
        // random start so freshness values do not collide across restarts
        freshness: rand::random::<u64>(),
      }),
      event_cv: Condvar::new(),
      ping_interval_min: ping_interval,
      ping_interval_max,
      pong_timeout,
    }
  }

  pub fn state(&self) -> RemoteState {
    self.lock().remote_state
  }

  pub fn ping_interval(&self) -> Duration {
    self.lock().ping_interval
  }

  /// Handle a received pong. Stale freshness values are ignored.
  pub fn pong_received(&self, freshness: u64) {
    let mut state = self.lock();
    if freshness != state.freshness {
      return;
    }
    if state.remote_state == RemoteState::Unsure {
      self.set_state(&mut state, RemoteState::Up);
    }
    if state.remote_state == RemoteState::Up {
      state.last_pong = Some(Instant::now());
    }
  }

  /// Periodic driver: decides whether a ping is due and whether timeouts
  /// expired. Due pings are sent through `ping_sink` outside the lock.
  pub fn run_cyclic(&self, ping_sink: &mut dyn FnMut(u64)) {
    let mut due_ping = None;
    {
      let mut state = self.lock();
      match state.remote_state {
        RemoteState::Unsure => {
          if ping_elapsed(&state) {
            due_ping = Some(self.arm_ping(&mut state));
            state.ping_interval *= 2;
            if state.ping_interval > self.ping_interval_max {
              self.set_state(&mut state, RemoteState::Down);
            }
          }
        }
        RemoteState::Up => {
          if ping_elapsed(&state) {
            due_ping = Some(self.arm_ping(&mut state));
            let pong_expired = state
              .last_pong
              .is_none_or(|t| t.elapsed() > self.pong_timeout);
            if pong_expired {
              self.set_state(&mut state, RemoteState::Down);
            }
          }
        }
        RemoteState::Down => {}
      }
    }
    if let Some(freshness) = due_ping {
      ping_sink(freshness);
    }
  }

  /// To be called when any message arrives while the state is DOWN.
  pub fn message_received_in_down(&self) {
    let mut state = self.lock();
    self.set_state(&mut state, RemoteState::Unsure);
  }

  /// To be called when any sent message timed out.
  pub fn sending_timeout(&self) {
    let mut state = self.lock();
    self.set_state(&mut state, RemoteState::Unsure);
  }

  /// Park until a state change or the expiry of the ping interval.
  pub fn wait_for_event(&self) {
    let state = self.lock();
    let interval = state.ping_interval;
    let _ = self
      .event_cv
      .wait_timeout(state, interval)
      .unwrap_or_else(|e| e.into_inner());
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn arm_ping(&self, state: &mut TrackerState) -> u64 {
    state.last_ping = Some(Instant::now());
    state.freshness = state.freshness.wrapping_add(1);
    state.freshness
  }

  fn set_state(&self, state: &mut TrackerState, new_state: RemoteState) {
    if new_state == RemoteState::Unsure {
      state.ping_interval = self.ping_interval_min;
      state.last_ping = None;
    }
    if new_state == RemoteState::Up {
      state.ping_interval = self.ping_interval_max;
    }
    state.remote_state = new_state;
    self.event_cv.notify_all();
  }
}

impl Default for RemoteStatusTracker {
  fn default() -> Self {
    Self::new()
  }
}

fn ping_elapsed(state: &TrackerState) -> bool {
  state
    .last_ping
    .is_none_or(|t| t.elapsed() > state.ping_interval)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
  };
  use std::thread;

  /// Loopback sink recording the last sent freshness value.
  struct PingRecorder(AtomicU64);

  impl PingRecorder {
    fn reply_to(&self, tracker: &RemoteStatusTracker) {
      tracker.pong_received(self.0.load(Ordering::SeqCst));
    }
  }

  fn cyclic(tracker: &RemoteStatusTracker, recorder: &PingRecorder) {
    tracker.run_cyclic(&mut |f| recorder.0.store(f, Ordering::SeqCst));
  }

  #[test]
  fn reaches_up_on_matching_pong_and_down_on_silence() {
    let tracker = RemoteStatusTracker::with_timing(
      Duration::from_millis(10),
      Duration::from_millis(300),
      Duration::from_millis(10),
    );
    let recorder = PingRecorder(AtomicU64::new(0));

    assert_eq!(tracker.state(), RemoteState::Unsure);

    // a pong with a stale freshness value is ignored
    tracker.pong_received(77);
    assert_eq!(tracker.state(), RemoteState::Unsure);

    cyclic(&tracker, &recorder);
    assert_eq!(tracker.state(), RemoteState::Unsure);

    recorder.reply_to(&tracker);
    assert_eq!(tracker.state(), RemoteState::Up);

    cyclic(&tracker, &recorder);
    assert_eq!(tracker.state(), RemoteState::Up);

    thread::sleep(Duration::from_millis(400));
    cyclic(&tracker, &recorder);
    assert_eq!(tracker.state(), RemoteState::Down);

    tracker.message_received_in_down();
    assert_eq!(tracker.state(), RemoteState::Unsure);

    cyclic(&tracker, &recorder);
    recorder.reply_to(&tracker);
    assert_eq!(tracker.state(), RemoteState::Up);
  }

  #[test]
  fn unsure_decays_to_down_without_answers() {
    let tracker = RemoteStatusTracker::with_timing(
      Duration::from_millis(1),
      Duration::from_millis(8),
      Duration::from_millis(5),
    );
    let recorder = PingRecorder(AtomicU64::new(0));
    for _ in 0..16 {
      cyclic(&tracker, &recorder);
      if tracker.state() == RemoteState::Down {
        break;
      }
      thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(tracker.state(), RemoteState::Down);
  }

  #[test]
  fn send_timeout_degrades_up_to_unsure() {
    let tracker = RemoteStatusTracker::with_timing(
      Duration::from_millis(1),
      Duration::from_millis(100),
      Duration::from_millis(100),
    );
    let recorder = PingRecorder(AtomicU64::new(0));
    thread::sleep(Duration::from_millis(5));
    cyclic(&tracker, &recorder);
    recorder.reply_to(&tracker);
    assert_eq!(tracker.state(), RemoteState::Up);

    tracker.sending_timeout();
    assert_eq!(tracker.state(), RemoteState::Unsure);
  }

  #[test]
  fn concurrent_cyclic_runner_tracks_state() {
    let tracker = Arc::new(RemoteStatusTracker::with_timing(
      Duration::from_millis(100),
      Duration::from_millis(1000),
      Duration::from_millis(100),
    ));
    let recorder = Arc::new(PingRecorder(AtomicU64::new(0)));
    let running = Arc::new(AtomicBool::new(true));

    let (t2, r2, run2) = (
      Arc::clone(&tracker),
      Arc::clone(&recorder),
      Arc::clone(&running),
    );
    let runner = thread::spawn(move || {
      while run2.load(Ordering::SeqCst) {
        cyclic(&t2, &r2);
        thread::sleep(Duration::from_millis(10));
      }
    });

    assert_eq!(tracker.state(), RemoteState::Unsure);
    thread::sleep(Duration::from_millis(150));
    recorder.reply_to(&tracker);
    let deadline = Instant::now() + Duration::from_secs(1);
    while tracker.state() != RemoteState::Up && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(tracker.state(), RemoteState::Up);

    // silence: pings keep going out but nothing answers
    thread::sleep(Duration::from_millis(2500));
    assert_eq!(tracker.state(), RemoteState::Down);

    running.store(false, Ordering::SeqCst);
    runner.join().unwrap();
  }
}
