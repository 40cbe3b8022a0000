// Recorder file format checks, including the ext-mem round trip with and
// without compression. Records are parsed back by streaming msgpack
// decoding of the three packed sections per record.

use std::{
  io::Read,
  sync::Arc,
  thread,
  time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use mcf::{
  recorder::{ExtMemHeader, RecordHeader},
  ExtMemBuffer, ExtMemory, ValueRecorder, ValueStore,
};

#[derive(Serialize, Deserialize, Default, Debug)]
struct Frame {
  val: i32,
  #[serde(skip)]
  pixels: ExtMemBuffer,
}

impl ExtMemory for Frame {
  fn ext_mem(&self) -> &ExtMemBuffer {
    &self.pixels
  }
  fn ext_mem_mut(&mut self) -> &mut ExtMemBuffer {
    &mut self.pixels
  }
}

fn frame_with_bytes(val: i32, bytes: &[u8]) -> Frame {
  let mut frame = Frame {
    val,
    pixels: ExtMemBuffer::new(),
  };
  frame.pixels.init_from(bytes);
  frame
}

fn wait_drained(recorder: &ValueRecorder) {
  let deadline = Instant::now() + Duration::from_secs(5);
  while !recorder.write_queue_empty() && Instant::now() < deadline {
    thread::sleep(Duration::from_millis(20));
  }
}

#[test]
fn ext_mem_record_round_trips_through_compression() {
  let store = Arc::new(ValueStore::new());
  store.register_ext_mem_type::<Frame>("Frame");
  let recorder = ValueRecorder::new(Arc::clone(&store));
  recorder.enable_ext_mem_serialization("/t");
  recorder.enable_ext_mem_compression("/t");

  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("record.bin");
  recorder.start(&path).unwrap();

  let payload: Vec<u8> = (0u8..10).collect();
  store.set_value("/t", frame_with_bytes(5, &payload)).unwrap();
  wait_drained(&recorder);
  recorder.stop();

  let data = std::fs::read(&path).unwrap();
  let mut cursor = std::io::Cursor::new(&data[..]);

  let header: RecordHeader = rmp_serde::decode::from_read(&mut cursor).unwrap();
  assert_eq!(header.topic, "/t");
  assert_eq!(header.type_id, "Frame");

  let body: Frame = rmp_serde::decode::from_read(&mut cursor).unwrap();
  assert_eq!(body.val, 5);
  // the body never contains the out-of-band bytes
  assert!(!body.pixels.is_initialized());

  let ext: ExtMemHeader = rmp_serde::decode::from_read(&mut cursor).unwrap();
  assert!(ext.present);
  assert_eq!(ext.size, 10);
  assert!(ext.compressed_size > 0);

  let start = cursor.position() as usize;
  let compressed = &data[start..start + ext.compressed_size as usize];
  let mut decompressed = Vec::new();
  flate2::read::ZlibDecoder::new(compressed)
    .read_to_end(&mut decompressed)
    .unwrap();
  assert_eq!(decompressed, payload);
  assert_eq!(start + ext.compressed_size as usize, data.len());
}

#[test]
fn ext_mem_record_without_compression_stores_raw_bytes() {
  let store = Arc::new(ValueStore::new());
  store.register_ext_mem_type::<Frame>("Frame");
  let recorder = ValueRecorder::new(Arc::clone(&store));
  recorder.enable_ext_mem_serialization("/t");

  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("record.bin");
  recorder.start(&path).unwrap();

  let mut payload = vec![0u8; 100];
  payload[0] = 0xff;
  payload[99] = 0xff;
  store.set_value("/t", frame_with_bytes(7, &payload)).unwrap();
  wait_drained(&recorder);
  recorder.stop();

  let data = std::fs::read(&path).unwrap();
  let mut cursor = std::io::Cursor::new(&data[..]);
  let _header: RecordHeader = rmp_serde::decode::from_read(&mut cursor).unwrap();
  let _body: Frame = rmp_serde::decode::from_read(&mut cursor).unwrap();
  let ext: ExtMemHeader = rmp_serde::decode::from_read(&mut cursor).unwrap();
  assert!(ext.present);
  assert_eq!(ext.size, 100);
  assert_eq!(ext.compressed_size, 0);

  let start = cursor.position() as usize;
  assert_eq!(&data[start..start + 100], &payload[..]);
  assert_eq!(start + 100, data.len());
}

#[test]
fn ext_mem_bytes_are_omitted_unless_enabled() {
  let store = Arc::new(ValueStore::new());
  store.register_ext_mem_type::<Frame>("Frame");
  let recorder = ValueRecorder::new(Arc::clone(&store));

  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("record.bin");
  recorder.start(&path).unwrap();
  store
    .set_value("/t", frame_with_bytes(1, &[1, 2, 3]))
    .unwrap();
  wait_drained(&recorder);
  recorder.stop();

  let data = std::fs::read(&path).unwrap();
  let mut cursor = std::io::Cursor::new(&data[..]);
  let _header: RecordHeader = rmp_serde::decode::from_read(&mut cursor).unwrap();
  let _body: Frame = rmp_serde::decode::from_read(&mut cursor).unwrap();
  let ext: ExtMemHeader = rmp_serde::decode::from_read(&mut cursor).unwrap();
  assert!(!ext.present);
  assert_eq!(ext.size, 0);
  assert_eq!(cursor.position() as usize, data.len());
}
