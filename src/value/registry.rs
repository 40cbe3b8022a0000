// Registry of value types known to the process. Each registration pairs a
// stable type-id string with monomorphized pack/unpack functions, so the
// store, recorder and remote bridge can serialize type-erased handles.

use std::{
  any::{Any, TypeId},
  collections::HashMap,
  sync::Arc,
};

use crate::{
  error::CodecError,
  value::{ExtMemory, ValueHandle, ValueType},
};

/// Result of packing a value: the msgpack body plus, for ext-mem types, a
/// borrow of the out-of-band bytes. The borrow ties the packed form to the
/// handle so no copy of a potentially large buffer is made.
pub struct PackedValue<'a> {
  pub bytes: Vec<u8>,
  pub ext_mem: Option<&'a [u8]>,
}

/// Pack a handle. The flag selects whether ext-mem bytes are requested.
pub type PackFn = for<'a> fn(&'a ValueHandle, bool) -> Result<PackedValue<'a>, CodecError>;

/// Rebuild a payload from a packed body and optional ext-mem bytes.
pub type UnpackFn = fn(&[u8], Option<&[u8]>) -> Result<Arc<dyn Any + Send + Sync>, CodecError>;

#[derive(Clone)]
pub struct TypeEntry {
  pub type_id: String,
  pub pack: PackFn,
  pub unpack: UnpackFn,
}

#[derive(Default)]
pub struct TypeRegistry {
  by_rust_type: HashMap<TypeId, TypeEntry>,
  by_name: HashMap<String, TypeEntry>,
}

impl TypeRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a plain value type under a type-id string.
  ///
  /// Panics if either the Rust type or the string is already registered;
  /// duplicate registrations are a wiring bug.
  pub fn register_type<T: ValueType>(&mut self, type_id: &str) {
    self.insert(
      TypeId::of::<T>(),
      TypeEntry {
        type_id: type_id.to_string(),
        pack: pack_plain::<T>,
        unpack: unpack_plain::<T>,
      },
    );
  }

  /// Register a value type carrying an ext-mem buffer.
  pub fn register_ext_mem_type<T: ValueType + ExtMemory>(&mut self, type_id: &str) {
    self.insert(
      TypeId::of::<T>(),
      TypeEntry {
        type_id: type_id.to_string(),
        pack: pack_ext::<T>,
        unpack: unpack_ext::<T>,
      },
    );
  }

  fn insert(&mut self, rust_type: TypeId, entry: TypeEntry) {
    assert!(
      !self.by_rust_type.contains_key(&rust_type),
      "value type registered twice"
    );
    assert!(
      !self.by_name.contains_key(&entry.type_id),
      "type id string {:?} registered twice",
      entry.type_id
    );
    self.by_name.insert(entry.type_id.clone(), entry.clone());
    self.by_rust_type.insert(rust_type, entry);
  }

  /// Find the entry for a handle's concrete payload type.
  pub fn lookup(&self, handle: &ValueHandle) -> Option<&TypeEntry> {
    self.by_rust_type.get(&handle.payload_type_id())
  }

  pub fn lookup_name(&self, type_id: &str) -> Option<&TypeEntry> {
    self.by_name.get(type_id)
  }
}

fn pack_plain<T: ValueType>(
  handle: &ValueHandle,
  _with_ext_mem: bool,
) -> Result<PackedValue<'_>, CodecError> {
  let value = handle.downcast_ref::<T>().ok_or(CodecError::TypeMismatch)?;
  Ok(PackedValue {
    bytes: rmp_serde::to_vec(value)?,
    ext_mem: None,
  })
}

fn unpack_plain<T: ValueType>(
  body: &[u8],
  _ext_mem: Option<&[u8]>,
) -> Result<Arc<dyn Any + Send + Sync>, CodecError> {
  let value: T = rmp_serde::from_slice(body)?;
  Ok(Arc::new(value))
}

fn pack_ext<T: ValueType + ExtMemory>(
  handle: &ValueHandle,
  with_ext_mem: bool,
) -> Result<PackedValue<'_>, CodecError> {
  let value = handle.downcast_ref::<T>().ok_or(CodecError::TypeMismatch)?;
  Ok(PackedValue {
    bytes: rmp_serde::to_vec(value)?,
    ext_mem: if with_ext_mem {
      value.ext_mem().as_slice()
    } else {
      None
    },
  })
}

fn unpack_ext<T: ValueType + ExtMemory>(
  body: &[u8],
  ext_mem: Option<&[u8]>,
) -> Result<Arc<dyn Any + Send + Sync>, CodecError> {
  let mut value: T = rmp_serde::from_slice(body)?;
  if let Some(bytes) = ext_mem {
    if !bytes.is_empty() {
      value.ext_mem_mut().init_from(bytes);
    }
  }
  Ok(Arc::new(value))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::value::ExtMemBuffer;
  use serde::{Deserialize, Serialize};

  #[derive(Serialize, Deserialize, Default, Debug, PartialEq)]
  struct Sample {
    val: i32,
    name: String,
  }

  #[derive(Serialize, Deserialize, Default, Debug)]
  struct SampleExtMem {
    val: i32,
    #[serde(skip)]
    ext: ExtMemBuffer,
  }

  impl ExtMemory for SampleExtMem {
    fn ext_mem(&self) -> &ExtMemBuffer {
      &self.ext
    }
    fn ext_mem_mut(&mut self) -> &mut ExtMemBuffer {
      &mut self.ext
    }
  }

  #[test]
  fn plain_round_trip() {
    let mut registry = TypeRegistry::new();
    registry.register_type::<Sample>("Sample");

    let handle = ValueHandle::new(
      Sample {
        val: 42,
        name: "x".to_string(),
      },
      1,
    );
    let entry = registry.lookup(&handle).unwrap();
    let packed = (entry.pack)(&handle, false).unwrap();
    assert!(packed.ext_mem.is_none());

    let unpacked = (entry.unpack)(&packed.bytes, None).unwrap();
    let value = unpacked.downcast_ref::<Sample>().unwrap();
    assert_eq!(value.val, 42);
    assert_eq!(value.name, "x");
  }

  #[test]
  fn ext_mem_round_trip_carries_the_buffer() {
    let mut registry = TypeRegistry::new();
    registry.register_ext_mem_type::<SampleExtMem>("SampleExtMem");

    let mut value = SampleExtMem {
      val: 7,
      ext: ExtMemBuffer::new(),
    };
    value.ext.init_from(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    let handle = ValueHandle::new(value, 2);

    let entry = registry.lookup(&handle).unwrap();
    let packed = (entry.pack)(&handle, true).unwrap();
    let ext = packed.ext_mem.expect("ext mem bytes requested");
    assert_eq!(ext, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);

    let unpacked = (entry.unpack)(&packed.bytes, Some(ext)).unwrap();
    let value = unpacked.downcast_ref::<SampleExtMem>().unwrap();
    assert_eq!(value.val, 7);
    assert_eq!(value.ext.as_slice().unwrap(), ext);
  }

  #[test]
  fn ext_mem_bytes_withheld_unless_requested() {
    let mut registry = TypeRegistry::new();
    registry.register_ext_mem_type::<SampleExtMem>("SampleExtMem");

    let mut value = SampleExtMem::default();
    value.ext.init(4);
    let handle = ValueHandle::new(value, 3);
    let entry = registry.lookup(&handle).unwrap();
    assert!((entry.pack)(&handle, false).unwrap().ext_mem.is_none());
  }

  #[test]
  fn unknown_type_has_no_entry() {
    let registry = TypeRegistry::new();
    let handle = ValueHandle::new(Sample::default(), 4);
    assert!(registry.lookup(&handle).is_none());
    assert!(registry.lookup_name("Sample").is_none());
  }

  #[test]
  #[should_panic]
  fn duplicate_registration_is_a_bug() {
    let mut registry = TypeRegistry::new();
    registry.register_type::<Sample>("Sample");
    registry.register_type::<Sample>("Sample2");
  }
}
