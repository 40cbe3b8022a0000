// Reserved topic namespace of the framework. The prefixes are combined with
// component instance names at configure time.

/// Prefix of per-component log topics:
/// `<LOG_PREFIX><instance>/message` and `<LOG_PREFIX><instance>/control`.
pub const LOG_PREFIX: &str = "/mcf/log/";

/// Prefix of per-component configuration topics.
pub const CONFIG_PREFIX: &str = "/mcf/configs/";

/// Prefix of per-component runtime statistics topics.
pub const STATS_PREFIX: &str = "/mcf/runtime/";

/// Topic on which the value recorder publishes its periodic status.
pub const RECORDER_STATUS: &str = "/mcf/recorder/status";

pub fn log_message_topic(instance: &str) -> String {
  format!("{LOG_PREFIX}{instance}/message")
}

pub fn log_control_topic(instance: &str) -> String {
  format!("{LOG_PREFIX}{instance}/control")
}

pub fn config_topic(instance: &str) -> String {
  format!("{CONFIG_PREFIX}{instance}")
}

pub fn stats_topic(instance: &str) -> String {
  format!("{STATS_PREFIX}{instance}")
}
