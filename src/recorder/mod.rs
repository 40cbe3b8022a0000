// Value recorder: captures every publication into an append-only file
// without back-pressuring producers. An all-topics receiver feeds an
// internal queue; a single writer thread serializes entries and accounts
// for latency, throughput and drops.

use std::{
  collections::{HashMap, HashSet, VecDeque},
  fs::File,
  hash::{Hash, Hasher},
  io::Write,
  path::Path,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
  },
  thread,
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use flate2::{write::ZlibEncoder, Compression};
use serde::{Deserialize, Serialize};

use crate::{
  rtsync::{self, PriorityInheritanceMutex},
  store::{ValueReceiver, ValueStore},
  topics,
  value::{messages::RecorderStatus, ValueHandle},
};

/// Leading header of every record in the file.
#[derive(Serialize, Deserialize, Debug)]
pub struct RecordHeader {
  /// Wall-clock publication time, milliseconds since the epoch.
  pub time: u64,
  pub topic: String,
  pub type_id: String,
  pub value_id: u64,
}

/// Trailing header describing the record's ext-mem section.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ExtMemHeader {
  pub size: u32,
  pub present: bool,
  /// Non-zero when the section was zlib-compressed.
  pub compressed_size: u32,
}

struct QueuedValue {
  record_time_ms: u64,
  enqueued: Instant,
  topic_id: u64,
  value: ValueHandle,
}

struct PoppedValue {
  record_time_ms: u64,
  enqueued: Instant,
  topic: String,
  value: ValueHandle,
}

struct QueueState {
  deque: VecDeque<QueuedValue>,
  topic_names: HashMap<u64, String>,
}

/// All-topics receiver feeding the writer thread. Topic strings are
/// interned by hash so the receive path allocates as little as possible.
struct RecorderQueue {
  state: PriorityInheritanceMutex<QueueState>,
}

impl RecorderQueue {
  fn new() -> Self {
    RecorderQueue {
      state: PriorityInheritanceMutex::new(QueueState {
        deque: VecDeque::new(),
        topic_names: HashMap::new(),
      }),
    }
  }

  fn len(&self) -> usize {
    self.state.lock().deque.len()
  }

  /// Pop the oldest entry; also reports the queue size left behind, which
  /// feeds the drop decision and the status statistics.
  fn pop(&self) -> Option<(PoppedValue, usize)> {
    let mut state = self.state.lock();
    let entry = state.deque.pop_front()?;
    let remaining = state.deque.len();
    let topic = state
      .topic_names
      .get(&entry.topic_id)
      .cloned()
      .unwrap_or_default();
    Some((
      PoppedValue {
        record_time_ms: entry.record_time_ms,
        enqueued: entry.enqueued,
        topic,
        value: entry.value,
      },
      remaining,
    ))
  }
}

fn topic_hash(topic: &str) -> u64 {
  let mut hasher = std::collections::hash_map::DefaultHasher::new();
  topic.hash(&mut hasher);
  hasher.finish()
}

impl ValueReceiver for RecorderQueue {
  fn receive(&self, topic: &str, value: &ValueHandle) {
    let topic_id = topic_hash(topic);
    let record_time_ms = chrono::Utc::now().timestamp_millis() as u64;
    let enqueued = Instant::now();
    let mut state = self.state.lock();
    state
      .topic_names
      .entry(topic_id)
      .or_insert_with(|| topic.to_string());
    state.deque.push_back(QueuedValue {
      record_time_ms,
      enqueued,
      topic_id,
      value: value.clone(),
    });
  }
}

/// Per-topic recording controls, shared between the control surface and the
/// writer thread.
#[derive(Default)]
struct TopicControl {
  disabled: HashSet<String>,
  ext_mem_enabled: HashSet<String>,
  ext_mem_compressed: HashSet<String>,
  queue_size_limit: usize,
}

/// Records every topic write to a log file. See the crate documentation
/// for the file format.
pub struct ValueRecorder {
  store: Arc<ValueStore>,
  queue: Arc<RecorderQueue>,
  queue_receiver: Arc<dyn ValueReceiver>,
  control: Arc<Mutex<TopicControl>>,
  stop_request: Arc<AtomicBool>,
  writer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ValueRecorder {
  pub fn new(store: Arc<ValueStore>) -> Self {
    let queue = Arc::new(RecorderQueue::new());
    let queue_receiver = Arc::clone(&queue) as Arc<dyn ValueReceiver>;
    ValueRecorder {
      store,
      queue,
      queue_receiver,
      control: Arc::new(Mutex::new(TopicControl {
        queue_size_limit: usize::MAX,
        ..TopicControl::default()
      })),
      stop_request: Arc::new(AtomicBool::new(false)),
      writer: Mutex::new(None),
    }
  }

  /// Start recording all topics into `path`. An existing file is
  /// truncated.
  pub fn start<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
    let mut writer_slot = self.writer.lock().unwrap_or_else(|e| e.into_inner());
    if writer_slot.is_some() {
      error!("value recorder already started");
      return Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "value recorder already started",
      ));
    }
    let file = File::create(path)?;
    self.stop_request.store(false, Ordering::SeqCst);
    self.store.add_all_topic_receiver(&self.queue_receiver);

    let store = Arc::clone(&self.store);
    let queue = Arc::clone(&self.queue);
    let control = Arc::clone(&self.control);
    let stop_request = Arc::clone(&self.stop_request);
    let thread = thread::Builder::new()
      .name("ValueRecorderW".to_string())
      .spawn(move || write_thread(file, store, queue, control, stop_request))?;
    *writer_slot = Some(thread);
    Ok(())
  }

  /// Graceful stop: unregister the receiver, then join the writer. The
  /// record file closes with the writer thread.
  pub fn stop(&self) {
    let thread = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(thread) = thread {
      self.stop_request.store(true, Ordering::SeqCst);
      self.store.remove_all_topic_receiver(&self.queue_receiver);
      if thread.join().is_err() {
        error!("value recorder writer thread terminated with a panic");
      }
    }
  }

  pub fn write_queue_empty(&self) -> bool {
    self.queue.len() == 0
  }

  /// Record the ext-mem bytes of values on `topic`. Without this, only the
  /// serialized part of an ext-mem value is written.
  pub fn enable_ext_mem_serialization(&self, topic: &str) {
    self
      .control
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .ext_mem_enabled
      .insert(topic.to_string());
  }

  /// Compress recorded ext-mem bytes on `topic`. Only effective together
  /// with [`enable_ext_mem_serialization`](Self::enable_ext_mem_serialization).
  pub fn enable_ext_mem_compression(&self, topic: &str) {
    let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
    control.ext_mem_compressed.insert(topic.to_string());
    if !control.ext_mem_enabled.contains(topic) {
      warn!(
        "ext mem compression for topic {topic:?} has no effect, its ext mem data is not recorded"
      );
    }
  }

  /// Stop recording `topic` altogether.
  pub fn disable_serialization(&self, topic: &str) {
    self
      .control
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .disabled
      .insert(topic.to_string());
  }

  /// Soft limit on the internal queue; entries beyond it are dropped and
  /// counted instead of written.
  pub fn set_write_queue_size_limit(&self, limit: usize) {
    self
      .control
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .queue_size_limit = limit;
  }
}

impl Drop for ValueRecorder {
  fn drop(&mut self) {
    self.stop();
  }
}

fn write_thread(
  mut file: File,
  store: Arc<ValueStore>,
  queue: Arc<RecorderQueue>,
  control: Arc<Mutex<TopicControl>>,
  stop_request: Arc<AtomicBool>,
) {
  rtsync::set_thread_name("ValueRecorderW");
  let mut monitor = StatusMonitor::new(store.clone());
  while !stop_request.load(Ordering::SeqCst) {
    while let Some((entry, remaining)) = queue.pop() {
      let queue_size_limit = control
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .queue_size_limit;
      if remaining < queue_size_limit || entry.topic == topics::RECORDER_STATUS {
        serialize_entry(&mut file, &store, &control, &mut monitor, entry, remaining);
      } else {
        monitor.report_dropped();
      }
    }
    thread::sleep(Duration::from_millis(10));
  }
}

fn serialize_entry(
  file: &mut File,
  store: &Arc<ValueStore>,
  control: &Arc<Mutex<TopicControl>>,
  monitor: &mut StatusMonitor,
  entry: PoppedValue,
  queue_size: usize,
) {
  let Some(type_info) = store.type_info(&entry.value) else {
    // values of unregistered types cannot be written
    debug!("skipping value on {} with unregistered type", entry.topic);
    return;
  };
  let (topic_enabled, ext_mem_enabled, compress) = {
    let control = control.lock().unwrap_or_else(|e| e.into_inner());
    (
      !control.disabled.contains(&entry.topic),
      control.ext_mem_enabled.contains(&entry.topic),
      control.ext_mem_compressed.contains(&entry.topic),
    )
  };
  if !topic_enabled {
    return;
  }

  monitor.serialize_begin(queue_size, entry.enqueued);

  let packed = match (type_info.pack)(&entry.value, ext_mem_enabled) {
    Ok(packed) => packed,
    Err(e) => {
      monitor.report_write_error(&format!("could not pack value on {}: {e}", entry.topic));
      return;
    }
  };

  let mut buffer = Vec::with_capacity(packed.bytes.len() + 64);
  let header = RecordHeader {
    time: entry.record_time_ms,
    topic: entry.topic.clone(),
    type_id: type_info.type_id.clone(),
    value_id: entry.value.id(),
  };
  if let Err(e) = rmp_serde::encode::write(&mut buffer, &header) {
    monitor.report_write_error(&format!("could not pack record header: {e}"));
    return;
  }
  buffer.extend_from_slice(&packed.bytes);

  let ext_bytes = packed.ext_mem.filter(|b| !b.is_empty());
  let mut ext_header = ExtMemHeader {
    size: ext_bytes.map_or(0, |b| b.len() as u32),
    present: ext_bytes.is_some(),
    compressed_size: 0,
  };

  let compressed;
  let mut payload: Option<&[u8]> = ext_bytes;
  if let Some(bytes) = ext_bytes {
    if compress {
      match compress_zlib(bytes) {
        Ok(data) => {
          ext_header.compressed_size = data.len() as u32;
          compressed = data;
          payload = Some(&compressed);
        }
        Err(e) => {
          // fall back to the uncompressed bytes
          let message = format!(
            "could not compress ext mem data on {}, recording uncompressed: {e}",
            entry.topic
          );
          warn!("{message}");
          monitor.report_write_error(&message);
        }
      }
    }
  }

  if let Err(e) = rmp_serde::encode::write(&mut buffer, &ext_header) {
    monitor.report_write_error(&format!("could not pack ext mem header: {e}"));
    return;
  }

  match file.write_all(&buffer) {
    Ok(()) => monitor.add_bytes_written(buffer.len()),
    Err(e) => monitor.report_write_error(&e.to_string()),
  }
  if let Some(payload) = payload {
    match file.write_all(payload) {
      Ok(()) => monitor.add_bytes_written(payload.len()),
      Err(e) => monitor.report_write_error(&e.to_string()),
    }
  }

  monitor.serialize_end();
}

fn compress_zlib(data: &[u8]) -> std::io::Result<Vec<u8>> {
  let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
  encoder.write_all(data)?;
  encoder.finish()
}

const STATUS_OUTPUT_INTERVAL: Duration = Duration::from_secs(1);

/// Latency, throughput and CPU accounting of the writer thread, published
/// once per second on the recorder status topic.
struct StatusMonitor {
  store: Arc<ValueStore>,
  status: RecorderStatus,
  bytes_written: u64,
  total_latency_ms: u64,
  total_queue_size: u64,
  num_writes: u64,
  drop_count: u32,
  last_output: Instant,
  cpu_snapshot: CpuTimes,
}

impl StatusMonitor {
  fn new(store: Arc<ValueStore>) -> Self {
    StatusMonitor {
      store,
      status: RecorderStatus::default(),
      bytes_written: 0,
      total_latency_ms: 0,
      total_queue_size: 0,
      num_writes: 0,
      drop_count: 0,
      last_output: Instant::now(),
      cpu_snapshot: CpuTimes::of_current_thread(),
    }
  }

  fn serialize_begin(&mut self, queue_size: usize, enqueued: Instant) {
    let latency_ms = enqueued.elapsed().as_millis() as u64;
    self.total_latency_ms += latency_ms;
    self.num_writes += 1;
    if latency_ms > self.status.max_latency_ms {
      self.status.max_latency_ms = latency_ms;
    }
    self.total_queue_size += queue_size as u64;
    if queue_size as u64 > self.status.max_queue_size {
      self.status.max_queue_size = queue_size as u64;
    }
  }

  fn serialize_end(&mut self) {
    if self.last_output.elapsed() >= STATUS_OUTPUT_INTERVAL {
      self.output_status();
    }
  }

  fn report_write_error(&mut self, error: &str) {
    self.status.error_flag = true;
    self.status.error_descs.insert(error.to_string());
  }

  fn report_dropped(&mut self) {
    self.status.drop_flag = true;
    self.drop_count = self.drop_count.saturating_add(1);
  }

  fn add_bytes_written(&mut self, bytes: usize) {
    self.bytes_written += bytes as u64;
  }

  fn output_status(&mut self) {
    let elapsed = self.last_output.elapsed().as_secs_f32().max(f32::EPSILON);
    let cpu = CpuTimes::of_current_thread();

    self.status.output_bps = (self.bytes_written as f32 / elapsed) as u64;
    if self.num_writes > 0 {
      self.status.avg_latency_ms = self.total_latency_ms / self.num_writes;
      self.status.avg_queue_size = self.total_queue_size / self.num_writes;
    }
    self.status.cpu_usage_user = (cpu.user - self.cpu_snapshot.user) * 100.0 / elapsed;
    self.status.cpu_usage_system = (cpu.system - self.cpu_snapshot.system) * 100.0 / elapsed;

    let _ = self
      .store
      .set_value_nonblocking(topics::RECORDER_STATUS, self.status.clone());

    if self.status.drop_flag {
      error!(
        "value recorder dropped {} values, it cannot process them fast enough",
        self.drop_count
      );
      self.drop_count = 0;
    }
    if self.status.avg_latency_ms > 1000 {
      warn!(
        "value recorder writes are delayed by {} ms, values are piling up",
        self.status.avg_latency_ms
      );
    }

    self.last_output = Instant::now();
    self.cpu_snapshot = cpu;
    self.status = RecorderStatus::default();
    self.bytes_written = 0;
    self.total_latency_ms = 0;
    self.total_queue_size = 0;
    self.num_writes = 0;
  }
}

/// Writer thread CPU time in seconds.
#[derive(Clone, Copy)]
struct CpuTimes {
  user: f32,
  system: f32,
}

impl CpuTimes {
  #[cfg(target_os = "linux")]
  fn of_current_thread() -> Self {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_THREAD, &mut usage) };
    if rc != 0 {
      return CpuTimes {
        user: 0.0,
        system: 0.0,
      };
    }
    let seconds =
      |tv: libc::timeval| tv.tv_sec as f32 + tv.tv_usec as f32 / 1_000_000.0;
    CpuTimes {
      user: seconds(usage.ru_utime),
      system: seconds(usage.ru_stime),
    }
  }

  #[cfg(not(target_os = "linux"))]
  fn of_current_thread() -> Self {
    CpuTimes {
      user: 0.0,
      system: 0.0,
    }
  }
}
