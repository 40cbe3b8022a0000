// Real-time scheduling support: policy selection and validation for worker
// threads, a one-shot capability probe, and mutexes that keep their
// priority-protection semantics when the process is allowed to use the
// real-time scheduling classes and degrade to plain mutexes when it is not.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

mod mutex;

pub use mutex::{
  PiCondvar, PiMutexGuard, PriorityCeilingMutex, PriorityInheritanceMutex,
};

use std::sync::OnceLock;

use crate::error::SchedulingError;

/// Scheduling classes supported for component worker threads.
///
/// `Fifo` and `RoundRobin` map to the POSIX real-time policies of the same
/// name; `Default` is the operating system's best-effort policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicy {
  Default,
  Fifo,
  RoundRobin,
}

/// A scheduling policy together with its static priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingParameters {
  pub policy: SchedulingPolicy,
  pub priority: i32,
}

impl Default for SchedulingParameters {
  fn default() -> Self {
    SchedulingParameters {
      policy: SchedulingPolicy::Default,
      priority: 0,
    }
  }
}

impl SchedulingParameters {
  pub fn new(policy: SchedulingPolicy, priority: i32) -> Self {
    SchedulingParameters { policy, priority }
  }

  /// Check the parameters against what the kernel accepts for the policy.
  ///
  /// `Default` only admits priority 0. Real-time policies admit the kernel's
  /// `[min, max]` priority range.
  pub fn validate(&self) -> Result<(), SchedulingError> {
    match self.policy {
      SchedulingPolicy::Default => {
        if self.priority != 0 {
          return Err(SchedulingError::InvalidPriority {
            priority: self.priority,
            min: 0,
            max: 0,
          });
        }
        Ok(())
      }
      SchedulingPolicy::Fifo | SchedulingPolicy::RoundRobin => {
        let (min, max) = priority_range(self.policy);
        if self.priority < min || self.priority > max {
          return Err(SchedulingError::InvalidPriority {
            priority: self.priority,
            min,
            max,
          });
        }
        Ok(())
      }
    }
  }
}

#[cfg(unix)]
fn policy_to_raw(policy: SchedulingPolicy) -> libc::c_int {
  match policy {
    SchedulingPolicy::Default => libc::SCHED_OTHER,
    SchedulingPolicy::Fifo => libc::SCHED_FIFO,
    SchedulingPolicy::RoundRobin => libc::SCHED_RR,
  }
}

/// Kernel priority range for a policy, `(0, 0)` for the default class.
#[cfg(unix)]
pub fn priority_range(policy: SchedulingPolicy) -> (i32, i32) {
  let raw = policy_to_raw(policy);
  unsafe {
    (
      libc::sched_get_priority_min(raw),
      libc::sched_get_priority_max(raw),
    )
  }
}

#[cfg(not(unix))]
pub fn priority_range(_policy: SchedulingPolicy) -> (i32, i32) {
  (0, 0)
}

/// Opaque handle of an OS thread, used to re-schedule it while it runs.
#[derive(Debug, Clone, Copy)]
pub struct ThreadHandle(#[cfg(unix)] libc::pthread_t, #[cfg(not(unix))] ());

pub fn current_thread_handle() -> ThreadHandle {
  #[cfg(unix)]
  {
    ThreadHandle(unsafe { libc::pthread_self() })
  }
  #[cfg(not(unix))]
  {
    ThreadHandle(())
  }
}

/// Probe whether this process may enter a real-time scheduling class.
///
/// The probe briefly switches the calling thread to SCHED_FIFO and back;
/// the result is computed once and cached for the process lifetime.
pub fn realtime_capability_available() -> bool {
  static AVAILABLE: OnceLock<bool> = OnceLock::new();
  *AVAILABLE.get_or_init(probe_realtime_capability)
}

#[cfg(unix)]
fn probe_realtime_capability() -> bool {
  unsafe {
    let thread = libc::pthread_self();
    let mut policy: libc::c_int = 0;
    let mut param: libc::sched_param = std::mem::zeroed();
    if libc::pthread_getschedparam(thread, &mut policy, &mut param) != 0 {
      return false;
    }
    let probe = libc::sched_param {
      sched_priority: libc::sched_get_priority_min(libc::SCHED_FIFO),
    };
    if libc::pthread_setschedparam(thread, libc::SCHED_FIFO, &probe) != 0 {
      return false;
    }
    // restore whatever was in effect before the probe
    libc::pthread_setschedparam(thread, policy, &param);
    true
  }
}

#[cfg(not(unix))]
fn probe_realtime_capability() -> bool {
  false
}

fn warn_realtime_unavailable() {
  static WARNED: OnceLock<()> = OnceLock::new();
  WARNED.get_or_init(|| {
    warn!("real-time scheduling not available, falling back to the default policy");
  });
}

/// Apply scheduling parameters to a running thread.
///
/// A real-time selection without real-time capability degrades to a no-op
/// with a one-time warning. Parameters are assumed validated.
pub fn apply_to_thread(
  handle: ThreadHandle,
  params: SchedulingParameters,
) -> Result<(), SchedulingError> {
  if params.policy != SchedulingPolicy::Default && !realtime_capability_available() {
    warn_realtime_unavailable();
    return Ok(());
  }
  #[cfg(unix)]
  {
    let param = libc::sched_param {
      sched_priority: params.priority,
    };
    let result =
      unsafe { libc::pthread_setschedparam(handle.0, policy_to_raw(params.policy), &param) };
    if result != 0 {
      return Err(SchedulingError::SetFailed {
        errno: result,
        priority: params.priority,
      });
    }
  }
  #[cfg(not(unix))]
  let _ = handle;
  Ok(())
}

pub fn apply_to_current_thread(params: SchedulingParameters) -> Result<(), SchedulingError> {
  apply_to_thread(current_thread_handle(), params)
}

/// Read back the calling thread's current scheduling parameters.
pub fn current_thread_scheduling() -> SchedulingParameters {
  #[cfg(unix)]
  unsafe {
    let mut policy: libc::c_int = 0;
    let mut param: libc::sched_param = std::mem::zeroed();
    if libc::pthread_getschedparam(libc::pthread_self(), &mut policy, &mut param) == 0 {
      let policy = match policy {
        libc::SCHED_FIFO => SchedulingPolicy::Fifo,
        libc::SCHED_RR => SchedulingPolicy::RoundRobin,
        _ => SchedulingPolicy::Default,
      };
      return SchedulingParameters::new(policy, param.sched_priority);
    }
  }
  SchedulingParameters::default()
}

/// Name the calling thread. Names longer than 15 bytes are truncated, which
/// is the limit `pthread_setname_np` imposes.
pub fn set_thread_name(name: &str) {
  #[cfg(target_os = "linux")]
  {
    let truncated: String = name.chars().take(15).collect();
    if let Ok(cname) = std::ffi::CString::new(truncated) {
      unsafe {
        libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr());
      }
    }
  }
  #[cfg(not(target_os = "linux"))]
  let _ = name;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_policy_rejects_nonzero_priority() {
    assert!(SchedulingParameters::new(SchedulingPolicy::Default, 0)
      .validate()
      .is_ok());
    assert!(SchedulingParameters::new(SchedulingPolicy::Default, 3)
      .validate()
      .is_err());
  }

  #[test]
  fn fifo_priority_range_is_enforced() {
    let (min, max) = priority_range(SchedulingPolicy::Fifo);
    assert!(SchedulingParameters::new(SchedulingPolicy::Fifo, min)
      .validate()
      .is_ok());
    assert!(SchedulingParameters::new(SchedulingPolicy::Fifo, max)
      .validate()
      .is_ok());
    assert!(SchedulingParameters::new(SchedulingPolicy::Fifo, max + 1)
      .validate()
      .is_err());
  }

  #[test]
  fn capability_probe_is_stable() {
    // whatever the answer is in the test environment, it must not change
    let first = realtime_capability_available();
    assert_eq!(first, realtime_capability_available());
  }

  #[test]
  fn applying_default_parameters_succeeds() {
    apply_to_current_thread(SchedulingParameters::default()).unwrap();
  }
}
