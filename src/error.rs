use std::io;

use thiserror::Error;

/// Outcome of a failed store or port write.
///
/// Successful writes return `Ok(())`; these variants are the only ways a
/// write can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PublishError {
  /// The port is not bound to a topic or not connected.
  #[error("port is not connected")]
  NotConnected,
  /// A non-blocking write found a blocked receiver on the topic.
  #[error("a receiver on the topic is blocked")]
  Again,
  /// A blocking write was aborted before the value was published.
  #[error("write was cancelled")]
  Cancelled,
}

/// Failures of the registered pack/unpack pair of a value type.
#[derive(Debug, Error)]
pub enum CodecError {
  #[error("value type is not registered: {0}")]
  UnknownType(String),
  #[error("stored value does not have the expected type")]
  TypeMismatch,
  #[error("packing failed: {0}")]
  Encode(#[from] rmp_serde::encode::Error),
  #[error("unpacking failed: {0}")]
  Decode(#[from] rmp_serde::decode::Error),
}

/// Errors validating or applying thread scheduling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulingError {
  #[error("priority {priority} out of range {min}-{max} for the selected policy")]
  InvalidPriority { priority: i32, min: i32, max: i32 },
  #[error("could not set scheduling parameters (priority {priority}): errno {errno}")]
  SetFailed { errno: i32, priority: i32 },
}

/// Errors of the remote bridge transport endpoints.
#[derive(Debug, Error)]
pub enum TransportError {
  #[error("malformed connection string: {0}")]
  BadAddress(String),
  #[error("endpoint is not connected")]
  NotConnected,
  #[error("wire codec error: {0}")]
  Codec(#[from] rmp_serde::decode::Error),
  #[error("i/o error: {0}")]
  Io(#[from] io::Error),
}

/// Errors reading or merging component configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("could not read config file {path}: {source}")]
  Io {
    path: String,
    source: io::Error,
  },
  #[error("could not parse config file {path}: {source}")]
  Parse {
    path: String,
    source: serde_json::Error,
  },
  #[error("no config file found in any configured directory")]
  NotFound,
}
