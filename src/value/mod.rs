// Typed, immutable value carrier and its supporting machinery: id
// generation, the out-of-band buffer extension, the type registry used for
// serialization, and the framework's built-in message types.

pub mod extmem;
pub mod messages;
pub mod registry;

pub use extmem::{ExtMemBuffer, ExtMemory};
pub use registry::{PackedValue, TypeEntry, TypeRegistry};

use std::{
  any::{Any, TypeId},
  fmt,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
};

use serde::{de::DeserializeOwned, Serialize};

/// Marker for payload types that can travel through the value store.
///
/// Blanket-implemented; a payload type only needs serde derives, `Default`
/// (returned on reads of absent or mismatched topics) and thread safety.
pub trait ValueType: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

impl<T> ValueType for T where T: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

/// A published value: a shared, immutable payload tagged with a 64-bit id.
///
/// The id is assigned exactly once, when the payload is wrapped into a
/// handle; republishing "the same" data means wrapping it again under a new
/// id. Handles are cheap to clone and may be held by any number of
/// receivers.
#[derive(Clone)]
pub struct ValueHandle {
  id: u64,
  payload: Arc<dyn Any + Send + Sync>,
}

impl ValueHandle {
  pub fn new<T: Send + Sync + 'static>(payload: T, id: u64) -> Self {
    ValueHandle {
      id,
      payload: Arc::new(payload),
    }
  }

  /// Wrap an already shared payload. The payload is immutable from here on.
  pub fn from_arc<T: Send + Sync + 'static>(payload: Arc<T>, id: u64) -> Self {
    ValueHandle { id, payload }
  }

  /// Wrap a type-erased payload, typically one rebuilt by a registered
  /// unpack function.
  pub fn from_erased(payload: Arc<dyn Any + Send + Sync>, id: u64) -> Self {
    ValueHandle { id, payload }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  /// `TypeId` of the concrete payload type.
  pub fn payload_type_id(&self) -> TypeId {
    self.payload.as_ref().type_id()
  }

  pub fn is<T: Send + Sync + 'static>(&self) -> bool {
    self.payload.as_ref().is::<T>()
  }

  pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
    Arc::clone(&self.payload).downcast::<T>().ok()
  }

  pub fn downcast_ref<T: Send + Sync + 'static>(&self) -> Option<&T> {
    self.payload.downcast_ref::<T>()
  }
}

impl fmt::Debug for ValueHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ValueHandle")
      .field("id", &self.id)
      .field("payload_type", &self.payload_type_id())
      .finish()
  }
}

/// Source of value ids. One generator per component keeps sender ports from
/// ever reusing an id within a process.
pub trait IdGenerator: Send + Sync {
  fn generate_id(&self) -> u64;
}

/// Default id generator: process id in the upper 32 bits, a monotonic
/// counter in the lower 32. The counter is shared by all instances, so no
/// two values stamped anywhere in the process ever share an id. Thread
/// safe, not unique across host reboots.
pub struct CountingIdGenerator {
  base: u64,
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl CountingIdGenerator {
  pub fn new() -> Self {
    CountingIdGenerator {
      base: (std::process::id() as u64) << 32,
    }
  }
}

impl Default for CountingIdGenerator {
  fn default() -> Self {
    Self::new()
  }
}

impl IdGenerator for CountingIdGenerator {
  fn generate_id(&self) -> u64 {
    self.base | (ID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xffff_ffff)
  }
}

/// Fixed id generator, used when re-publishing a value received from a peer
/// process so that the originating id survives the transfer.
pub struct FixedIdGenerator(pub u64);

impl IdGenerator for FixedIdGenerator {
  fn generate_id(&self) -> u64 {
    self.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{collections::HashSet, thread};

  #[derive(serde::Serialize, serde::Deserialize, Default, Debug, PartialEq)]
  struct TestValue {
    val: i32,
  }

  #[test]
  fn handle_downcasts_to_payload_type() {
    let handle = ValueHandle::new(TestValue { val: 5 }, 17);
    assert_eq!(handle.id(), 17);
    assert!(handle.is::<TestValue>());
    assert_eq!(handle.downcast::<TestValue>().unwrap().val, 5);
    assert!(handle.downcast::<String>().is_none());
  }

  #[test]
  fn counting_generators_never_repeat_under_concurrency() {
    // several generator instances across several threads, one id space
    let mut handles = Vec::new();
    for _ in 0..8 {
      handles.push(thread::spawn(move || {
        let generator = CountingIdGenerator::new();
        (0..1000).map(|_| generator.generate_id()).collect::<Vec<_>>()
      }));
    }
    let mut seen = HashSet::new();
    for h in handles {
      for id in h.join().unwrap() {
        assert!(seen.insert(id), "id {id} issued twice");
      }
    }
  }

  #[test]
  fn generated_ids_carry_the_process_id() {
    let generator = CountingIdGenerator::new();
    assert_eq!(
      generator.generate_id() >> 32,
      std::process::id() as u64
    );
  }
}
