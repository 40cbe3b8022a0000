// Built-in value types used by the framework itself. All of them are
// registered with every new value store so log, statistics and recorder
// status topics can always be recorded and bridged.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::value::TypeRegistry;

/// Plain string payload, used for the config topics.
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct StringValue {
  pub value: String,
}

impl StringValue {
  pub fn new(value: impl Into<String>) -> Self {
    StringValue {
      value: value.into(),
    }
  }
}

/// One log line published on a component's log message topic.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct LogMessage {
  pub message: String,
  pub severity: i32,
}

/// Runtime adjustment of a component's value-store log level.
#[derive(Serialize, Deserialize, Default, Debug, Clone, Copy)]
pub struct LogControl {
  pub level: i32,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, Copy)]
pub struct Timestamp {
  pub ms: u64,
}

/// Execution statistics of one handler, in microseconds over the current
/// accounting window.
#[derive(Serialize, Deserialize, Default, Debug, Clone, Copy)]
pub struct RuntimeStatsEntry {
  /// Window start, milliseconds since the epoch.
  pub start: u64,
  pub total: u64,
  pub count: u64,
  pub min: i64,
  pub max: i64,
  pub avg: i64,
  /// Invocations per second over the window.
  pub rate: i64,
}

/// Per-component handler statistics, published on the stats topic.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct RuntimeStats {
  pub entries: BTreeMap<String, RuntimeStatsEntry>,
}

/// Periodic status of the value recorder.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct RecorderStatus {
  /// Throughput into the record file in bytes per second.
  pub output_bps: u64,
  /// Average delay between store write and file write in milliseconds.
  pub avg_latency_ms: u64,
  pub max_latency_ms: u64,
  pub avg_queue_size: u64,
  pub max_queue_size: u64,
  /// Writer thread CPU time in percent of wall time; 100 is one full core.
  pub cpu_usage_user: f32,
  pub cpu_usage_system: f32,
  /// Set when values were dropped since the last status due to overload.
  pub drop_flag: bool,
  /// Set when at least one write failed since the last status.
  pub error_flag: bool,
  pub error_descs: BTreeSet<String>,
}

pub fn register_builtin_types(registry: &mut TypeRegistry) {
  registry.register_type::<StringValue>("mcf::String");
  registry.register_type::<LogMessage>("mcf::LogMessage");
  registry.register_type::<LogControl>("mcf::LogControl");
  registry.register_type::<Timestamp>("mcf::Timestamp");
  registry.register_type::<RuntimeStats>("mcf::RuntimeStats");
  registry.register_type::<RecorderStatus>("mcf::RecorderStatus");
}
