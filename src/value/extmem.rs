// Out-of-band byte buffer carried by a value next to its serialized fields.
// The buffer travels separately from the packed representation so large
// payloads (images, point clouds) are never run through the serializer.

/// A heap-allocated, fixed-size byte region owned by exactly one value.
///
/// The region is allocated once by [`init`](ExtMemBuffer::init); its size
/// never changes afterwards. Re-initializing before publication discards the
/// previous contents. Publication freezes the buffer together with the rest
/// of the value, so there is no thread protection here.
///
/// The payload field holding the buffer is excluded from serialization
/// (`#[serde(skip)]`); the store, recorder and remote bridge move the raw
/// bytes out of band.
#[derive(Debug, Default)]
pub struct ExtMemBuffer {
  data: Option<Box<[u8]>>,
}

impl ExtMemBuffer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Allocate a zero-filled region of `len` bytes. `len` must be non-zero.
  pub fn init(&mut self, len: u64) {
    assert!(len > 0, "ext mem region must not be empty");
    self.data = Some(vec![0u8; len as usize].into_boxed_slice());
  }

  /// Allocate the region and fill it with a copy of `src`.
  pub fn init_from(&mut self, src: &[u8]) {
    assert!(!src.is_empty(), "ext mem region must not be empty");
    self.data = Some(src.to_vec().into_boxed_slice());
  }

  pub fn is_initialized(&self) -> bool {
    self.data.is_some()
  }

  /// Size of the region in bytes, 0 if not initialized.
  pub fn size(&self) -> u64 {
    self.data.as_ref().map_or(0, |d| d.len() as u64)
  }

  pub fn as_slice(&self) -> Option<&[u8]> {
    self.data.as_deref()
  }

  pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
    self.data.as_deref_mut()
  }
}

/// Implemented by value types that carry an [`ExtMemBuffer`].
///
/// Registering such a type with
/// [`TypeRegistry::register_ext_mem_type`](crate::value::TypeRegistry::register_ext_mem_type)
/// makes the buffer visible to the recorder and the remote bridge.
pub trait ExtMemory {
  fn ext_mem(&self) -> &ExtMemBuffer;
  fn ext_mem_mut(&mut self) -> &mut ExtMemBuffer;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn buffer_starts_uninitialized() {
    let buffer = ExtMemBuffer::new();
    assert!(!buffer.is_initialized());
    assert_eq!(buffer.size(), 0);
    assert!(buffer.as_slice().is_none());
  }

  #[test]
  fn init_allocates_zeroed_region() {
    let mut buffer = ExtMemBuffer::new();
    buffer.init(10);
    assert!(buffer.is_initialized());
    assert_eq!(buffer.size(), 10);
    assert_eq!(buffer.as_slice().unwrap(), &[0u8; 10]);
  }

  #[test]
  fn reinit_discards_previous_contents() {
    let mut buffer = ExtMemBuffer::new();
    buffer.init_from(&[1, 2, 3]);
    buffer.init(2);
    assert_eq!(buffer.as_slice().unwrap(), &[0, 0]);
  }

  #[test]
  #[should_panic]
  fn zero_length_region_is_forbidden() {
    let mut buffer = ExtMemBuffer::new();
    buffer.init(0);
  }

  #[test]
  fn region_is_writable_before_publication() {
    let mut buffer = ExtMemBuffer::new();
    buffer.init(4);
    buffer.as_mut_slice().unwrap()[3] = 9;
    assert_eq!(buffer.as_slice().unwrap(), &[0, 0, 0, 9]);
  }
}
