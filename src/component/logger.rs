// Per-component logging with two sinks: the process console via the `log`
// facade and the value store via the component's log message port. The two
// sinks have independent severity thresholds; the value-store one can be
// adjusted at runtime through the log control topic.

use std::sync::{
  atomic::{AtomicI32, Ordering},
  Mutex,
};

use crate::{
  port::{Port, SenderPort},
  value::messages::LogMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogSeverity {
  Trace = 0,
  Debug = 1,
  Info = 2,
  Warn = 3,
  Err = 4,
  Fatal = 5,
}

impl LogSeverity {
  pub fn from_i32(level: i32) -> Self {
    match level {
      0 => LogSeverity::Trace,
      1 => LogSeverity::Debug,
      2 => LogSeverity::Info,
      3 => LogSeverity::Warn,
      4 => LogSeverity::Err,
      _ => LogSeverity::Fatal,
    }
  }

  /// Parse the level names accepted in configuration files.
  pub fn parse(name: &str) -> Option<Self> {
    match name.to_ascii_lowercase().as_str() {
      "trace" => Some(LogSeverity::Trace),
      "debug" => Some(LogSeverity::Debug),
      "info" => Some(LogSeverity::Info),
      "warn" | "warning" => Some(LogSeverity::Warn),
      "err" | "error" => Some(LogSeverity::Err),
      "fatal" | "critical" => Some(LogSeverity::Fatal),
      _ => None,
    }
  }

  fn as_log_level(self) -> log::Level {
    match self {
      LogSeverity::Trace => log::Level::Trace,
      LogSeverity::Debug => log::Level::Debug,
      LogSeverity::Info => log::Level::Info,
      LogSeverity::Warn => log::Level::Warn,
      LogSeverity::Err | LogSeverity::Fatal => log::Level::Error,
    }
  }
}

pub struct ComponentLogger {
  name: Mutex<String>,
  console_level: AtomicI32,
  store_level: AtomicI32,
  port: SenderPort<LogMessage>,
}

impl ComponentLogger {
  pub fn new(name: &str, port: SenderPort<LogMessage>) -> Self {
    ComponentLogger {
      name: Mutex::new(name.to_string()),
      console_level: AtomicI32::new(LogSeverity::Info as i32),
      store_level: AtomicI32::new(LogSeverity::Info as i32),
      port,
    }
  }

  pub fn set_name(&self, name: &str) {
    *self.name.lock().unwrap_or_else(|e| e.into_inner()) = name.to_string();
  }

  pub fn console_level(&self) -> LogSeverity {
    LogSeverity::from_i32(self.console_level.load(Ordering::Relaxed))
  }

  pub fn store_level(&self) -> LogSeverity {
    LogSeverity::from_i32(self.store_level.load(Ordering::Relaxed))
  }

  pub fn set_console_level(&self, level: LogSeverity) {
    self.console_level.store(level as i32, Ordering::Relaxed);
  }

  pub fn set_store_level(&self, level: LogSeverity) {
    self.store_level.store(level as i32, Ordering::Relaxed);
  }

  /// Apply `ConsoleLogLevel` / `ValueStoreLogLevel` keys of a component
  /// configuration document. All other keys are opaque to the framework.
  pub fn set_levels_from_config(&self, config: &serde_json::Value) {
    if let Some(level) = parse_level_key(config, "ConsoleLogLevel") {
      self.set_console_level(level);
    }
    if let Some(level) = parse_level_key(config, "ValueStoreLogLevel") {
      self.set_store_level(level);
    }
  }

  pub fn log(&self, severity: LogSeverity, message: &str) {
    if severity >= self.console_level() {
      let name = self.name.lock().unwrap_or_else(|e| e.into_inner()).clone();
      log::log!(severity.as_log_level(), "[{name}] {message}");
    }
    if severity >= self.store_level() && self.port.is_connected() {
      // log output must never back-pressure the component
      let _ = self.port.set_value(
        LogMessage {
          message: message.to_string(),
          severity: severity as i32,
        },
        false,
      );
    }
  }
}

fn parse_level_key(config: &serde_json::Value, key: &str) -> Option<LogSeverity> {
  let name = config.get(key)?.as_str()?;
  let level = LogSeverity::parse(name);
  if level.is_none() {
    log::warn!("unknown log level {name:?} for key {key}");
  }
  level
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn severity_ordering_matches_levels() {
    assert!(LogSeverity::Trace < LogSeverity::Debug);
    assert!(LogSeverity::Warn < LogSeverity::Err);
    assert_eq!(LogSeverity::from_i32(3), LogSeverity::Warn);
  }

  #[test]
  fn parse_accepts_common_spellings() {
    assert_eq!(LogSeverity::parse("warning"), Some(LogSeverity::Warn));
    assert_eq!(LogSeverity::parse("ERROR"), Some(LogSeverity::Err));
    assert_eq!(LogSeverity::parse("bogus"), None);
  }
}
