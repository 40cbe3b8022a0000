// Lock flavors for priority-protected critical sections.
//
// `PriorityCeilingMutex` raises a default-class locker into SCHED_FIFO for
// the duration of the critical section, so a preempted low-priority thread
// cannot hold up a real-time one longer than the section itself.
// `PriorityInheritanceMutex` maps to a PTHREAD_PRIO_INHERIT pthread mutex
// and comes with a matching condition variable, because receiver queues
// block on it with timed waits. Without real-time capability both behave
// like plain mutexes with unchanged interfaces.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::sync::{Mutex, MutexGuard};

use super::{
  apply_to_current_thread, current_thread_scheduling, priority_range,
  realtime_capability_available, SchedulingParameters, SchedulingPolicy,
};

/// Restores the scheduling class a thread had before a ceiling elevation.
struct ElevationReset {
  saved: SchedulingParameters,
}

impl Drop for ElevationReset {
  fn drop(&mut self) {
    if let Err(e) = apply_to_current_thread(self.saved) {
      debug!("could not restore scheduling class after ceiling unlock: {e}");
    }
  }
}

fn elevate_to_ceiling(ceiling: i32) -> Option<ElevationReset> {
  if !realtime_capability_available() {
    return None;
  }
  let current = current_thread_scheduling();
  if current.policy != SchedulingPolicy::Default {
    // already real-time, the ceiling does not apply
    return None;
  }
  let (min, max) = priority_range(SchedulingPolicy::Fifo);
  let params = SchedulingParameters::new(SchedulingPolicy::Fifo, ceiling.clamp(min, max));
  match apply_to_current_thread(params) {
    Ok(()) => Some(ElevationReset { saved: current }),
    Err(e) => {
      debug!("ceiling elevation failed, locking without it: {e}");
      None
    }
  }
}

/// A mutex that elevates a default-class locking thread to SCHED_FIFO at the
/// configured ceiling priority for the time it owns the lock.
pub struct PriorityCeilingMutex<T: ?Sized> {
  ceiling: i32,
  inner: Mutex<T>,
}

pub struct CeilingGuard<'a, T: ?Sized> {
  // field order matters: the lock is released before the class is restored
  inner: MutexGuard<'a, T>,
  _restore: Option<ElevationReset>,
}

impl<T> PriorityCeilingMutex<T> {
  pub fn new(ceiling: i32, value: T) -> Self {
    PriorityCeilingMutex {
      ceiling,
      inner: Mutex::new(value),
    }
  }
}

impl<T: ?Sized> PriorityCeilingMutex<T> {
  pub fn lock(&self) -> CeilingGuard<'_, T> {
    let restore = elevate_to_ceiling(self.ceiling);
    let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    CeilingGuard {
      inner,
      _restore: restore,
    }
  }
}

impl<T: ?Sized> std::ops::Deref for CeilingGuard<'_, T> {
  type Target = T;
  fn deref(&self) -> &T {
    &self.inner
  }
}

impl<T: ?Sized> std::ops::DerefMut for CeilingGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    &mut self.inner
  }
}

#[cfg(unix)]
pub use posix::{PiCondvar, PiMutexGuard, PriorityInheritanceMutex};
#[cfg(not(unix))]
pub use portable::{PiCondvar, PiMutexGuard, PriorityInheritanceMutex};

#[cfg(unix)]
mod posix {
  use std::{cell::UnsafeCell, marker::PhantomData, mem, time::Duration};

  #[allow(unused_imports)]
  use log::{debug, error, info, trace, warn};

  struct RawMutex(UnsafeCell<libc::pthread_mutex_t>);
  struct RawCondvar(UnsafeCell<libc::pthread_cond_t>);

  /// A pthread mutex initialized with the priority-inheritance protocol
  /// where the platform offers one.
  pub struct PriorityInheritanceMutex<T: ?Sized> {
    raw: Box<RawMutex>,
    data: UnsafeCell<T>,
  }

  unsafe impl<T: ?Sized + Send> Send for PriorityInheritanceMutex<T> {}
  unsafe impl<T: ?Sized + Send> Sync for PriorityInheritanceMutex<T> {}

  pub struct PiMutexGuard<'a, T: ?Sized> {
    lock: &'a PriorityInheritanceMutex<T>,
    // guards must stay on their locking thread
    _not_send: PhantomData<*const ()>,
  }

  impl<T> PriorityInheritanceMutex<T> {
    pub fn new(value: T) -> Self {
      let raw = Box::new(RawMutex(UnsafeCell::new(unsafe { mem::zeroed() })));
      unsafe {
        let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
        libc::pthread_mutexattr_init(&mut attr);
        #[cfg(target_os = "linux")]
        libc::pthread_mutexattr_setprotocol(&mut attr, libc::PTHREAD_PRIO_INHERIT);
        libc::pthread_mutex_init(raw.0.get(), &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
      }
      PriorityInheritanceMutex {
        raw,
        data: UnsafeCell::new(value),
      }
    }
  }

  impl<T: ?Sized> PriorityInheritanceMutex<T> {
    pub fn lock(&self) -> PiMutexGuard<'_, T> {
      let rc = unsafe { libc::pthread_mutex_lock(self.raw.0.get()) };
      assert_eq!(rc, 0, "pthread_mutex_lock failed: {rc}");
      PiMutexGuard {
        lock: self,
        _not_send: PhantomData,
      }
    }
  }

  impl<T: ?Sized> Drop for PriorityInheritanceMutex<T> {
    fn drop(&mut self) {
      unsafe {
        libc::pthread_mutex_destroy(self.raw.0.get());
      }
    }
  }

  impl<T: ?Sized> std::ops::Deref for PiMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
      unsafe { &*self.lock.data.get() }
    }
  }

  impl<T: ?Sized> std::ops::DerefMut for PiMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
      unsafe { &mut *self.lock.data.get() }
    }
  }

  impl<T: ?Sized> Drop for PiMutexGuard<'_, T> {
    fn drop(&mut self) {
      unsafe {
        libc::pthread_mutex_unlock(self.lock.raw.0.get());
      }
    }
  }

  /// Condition variable usable with [`PriorityInheritanceMutex`], with timed
  /// waits against the monotonic clock.
  pub struct PiCondvar {
    raw: Box<RawCondvar>,
  }

  unsafe impl Send for PiCondvar {}
  unsafe impl Sync for PiCondvar {}

  impl Default for PiCondvar {
    fn default() -> Self {
      Self::new()
    }
  }

  impl PiCondvar {
    pub fn new() -> Self {
      let raw = Box::new(RawCondvar(UnsafeCell::new(unsafe { mem::zeroed() })));
      unsafe {
        let mut attr: libc::pthread_condattr_t = mem::zeroed();
        libc::pthread_condattr_init(&mut attr);
        #[cfg(target_os = "linux")]
        libc::pthread_condattr_setclock(&mut attr, libc::CLOCK_MONOTONIC);
        libc::pthread_cond_init(raw.0.get(), &attr);
        libc::pthread_condattr_destroy(&mut attr);
      }
      PiCondvar { raw }
    }

    pub fn notify_all(&self) {
      unsafe {
        libc::pthread_cond_broadcast(self.raw.0.get());
      }
    }

    /// Wait on the guard's mutex until notified or the timeout elapses.
    /// Spurious wake-ups are possible; callers re-check their predicate.
    pub fn wait_timeout<'a, T: ?Sized>(
      &self,
      guard: PiMutexGuard<'a, T>,
      timeout: Duration,
    ) -> PiMutexGuard<'a, T> {
      #[cfg(target_os = "linux")]
      const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
      #[cfg(not(target_os = "linux"))]
      const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

      let mut ts: libc::timespec = unsafe { mem::zeroed() };
      unsafe {
        libc::clock_gettime(WAIT_CLOCK, &mut ts);
      }
      ts.tv_sec += timeout.as_secs() as libc::time_t;
      ts.tv_nsec += timeout.subsec_nanos() as libc::c_long;
      if ts.tv_nsec >= 1_000_000_000 {
        ts.tv_sec += 1;
        ts.tv_nsec -= 1_000_000_000;
      }
      let rc = unsafe {
        libc::pthread_cond_timedwait(self.raw.0.get(), guard.lock.raw.0.get(), &ts)
      };
      if rc != 0 && rc != libc::ETIMEDOUT {
        error!("unexpected return value from pthread_cond_timedwait: {rc}");
      }
      guard
    }
  }

  impl Drop for PiCondvar {
    fn drop(&mut self) {
      unsafe {
        libc::pthread_cond_destroy(self.raw.0.get());
      }
    }
  }
}

#[cfg(not(unix))]
mod portable {
  use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::Duration,
  };

  pub struct PriorityInheritanceMutex<T: ?Sized> {
    inner: Mutex<T>,
  }

  pub struct PiMutexGuard<'a, T: ?Sized> {
    inner: MutexGuard<'a, T>,
  }

  impl<T> PriorityInheritanceMutex<T> {
    pub fn new(value: T) -> Self {
      PriorityInheritanceMutex {
        inner: Mutex::new(value),
      }
    }
  }

  impl<T: ?Sized> PriorityInheritanceMutex<T> {
    pub fn lock(&self) -> PiMutexGuard<'_, T> {
      PiMutexGuard {
        inner: self.inner.lock().unwrap_or_else(|e| e.into_inner()),
      }
    }
  }

  impl<T: ?Sized> std::ops::Deref for PiMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
      &self.inner
    }
  }

  impl<T: ?Sized> std::ops::DerefMut for PiMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
      &mut self.inner
    }
  }

  #[derive(Default)]
  pub struct PiCondvar {
    cv: Condvar,
  }

  impl PiCondvar {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn notify_all(&self) {
      self.cv.notify_all();
    }

    pub fn wait_timeout<'a, T: ?Sized>(
      &self,
      guard: PiMutexGuard<'a, T>,
      timeout: Duration,
    ) -> PiMutexGuard<'a, T> {
      let (inner, _) = self
        .cv
        .wait_timeout(guard.inner, timeout)
        .unwrap_or_else(|e| e.into_inner());
      PiMutexGuard { inner }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{sync::Arc, thread, time::Duration};

  #[test]
  fn ceiling_mutex_provides_exclusion() {
    let m = Arc::new(PriorityCeilingMutex::new(32, 0u32));
    let mut handles = Vec::new();
    for _ in 0..4 {
      let m = Arc::clone(&m);
      handles.push(thread::spawn(move || {
        for _ in 0..1000 {
          *m.lock() += 1;
        }
      }));
    }
    for h in handles {
      h.join().unwrap();
    }
    assert_eq!(*m.lock(), 4000);
  }

  #[test]
  fn pi_mutex_provides_exclusion() {
    let m = Arc::new(PriorityInheritanceMutex::new(0u32));
    let mut handles = Vec::new();
    for _ in 0..4 {
      let m = Arc::clone(&m);
      handles.push(thread::spawn(move || {
        for _ in 0..1000 {
          *m.lock() += 1;
        }
      }));
    }
    for h in handles {
      h.join().unwrap();
    }
    assert_eq!(*m.lock(), 4000);
  }

  #[test]
  fn pi_condvar_times_out() {
    let m = PriorityInheritanceMutex::new(());
    let cv = PiCondvar::new();
    let start = std::time::Instant::now();
    let guard = m.lock();
    let _guard = cv.wait_timeout(guard, Duration::from_millis(20));
    assert!(start.elapsed() >= Duration::from_millis(15));
  }

  #[test]
  fn pi_condvar_wakes_waiter() {
    let m = Arc::new(PriorityInheritanceMutex::new(false));
    let cv = Arc::new(PiCondvar::new());
    let (m2, cv2) = (Arc::clone(&m), Arc::clone(&cv));
    let waiter = thread::spawn(move || {
      let mut guard = m2.lock();
      while !*guard {
        guard = cv2.wait_timeout(guard, Duration::from_millis(10));
      }
    });
    thread::sleep(Duration::from_millis(30));
    *m.lock() = true;
    cv.notify_all();
    waiter.join().unwrap();
  }
}
